use std::time::Duration;

use crate::embedding::EmbeddingTuning;

#[derive(Debug, Clone)]
pub struct IndexingTuning {
    pub chunk_min_chars: usize,
    pub chunk_max_chars: usize,
    pub min_batch_threshold: usize,
    pub poll_interval: Duration,
    pub batch_timeout: Duration,
    pub sync_embed_concurrency: usize,
}

impl Default for IndexingTuning {
    fn default() -> Self {
        let embedding = EmbeddingTuning::default();
        Self {
            chunk_min_chars: 500,
            chunk_max_chars: 2_000,
            min_batch_threshold: embedding.min_batch_threshold,
            poll_interval: embedding.poll_interval,
            batch_timeout: embedding.batch_timeout,
            sync_embed_concurrency: embedding.sync_concurrency,
        }
    }
}

impl IndexingTuning {
    pub fn embedding(&self) -> EmbeddingTuning {
        EmbeddingTuning {
            min_batch_threshold: self.min_batch_threshold,
            poll_interval: self.poll_interval,
            batch_timeout: self.batch_timeout,
            sync_concurrency: self.sync_embed_concurrency,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IndexingConfig {
    pub tuning: IndexingTuning,
    /// Drop and rebuild every collection table instead of diffing.
    pub force: bool,
}
