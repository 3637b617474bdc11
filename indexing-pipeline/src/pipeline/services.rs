use std::{path::Path, sync::Arc};

use async_trait::async_trait;
use common::{
    error::AppError,
    utils::{config::CollectionConfig, embedding::EmbeddingService, fingerprint},
};
use tracing::warn;

use crate::{
    chunking::{Chunk, ChunkProducer, DocumentChunker},
    embedding::{EmbeddedChunk, EmbeddingGenerator},
};

use super::config::IndexingTuning;

/// File extensions the enumerator picks up. Anything else in a source
/// root is silently ignored.
const SUPPORTED_EXTENSIONS: [&str; 4] = ["pdf", "txt", "md", "docx"];

/// A source file the run could not process, with the reason it was left
/// out. Skips never abort the run.
#[derive(Debug, Clone)]
pub struct SkippedFile {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct Enumeration {
    pub fingerprints: Vec<fingerprint::FileFingerprint>,
    pub skipped: Vec<SkippedFile>,
}

/// Seam between the pipeline stages and the outside world (filesystem,
/// converters, embedding service). Mocked wholesale in pipeline tests.
#[async_trait]
pub trait PipelineServices: Send + Sync {
    async fn enumerate_files(
        &self,
        collection: &CollectionConfig,
    ) -> Result<Enumeration, AppError>;

    async fn chunk_document(&self, path: &Path) -> Result<Vec<Chunk>, AppError>;

    async fn embed_chunks(&self, chunks: Vec<Chunk>) -> Result<Vec<EmbeddedChunk>, AppError>;
}

#[allow(clippy::module_name_repetitions)]
pub struct DefaultPipelineServices {
    chunker: Arc<dyn ChunkProducer>,
    generator: EmbeddingGenerator,
}

impl DefaultPipelineServices {
    pub fn new(service: Arc<dyn EmbeddingService>, tuning: &IndexingTuning) -> Self {
        Self {
            chunker: Arc::new(DocumentChunker::new(
                tuning.chunk_min_chars,
                tuning.chunk_max_chars,
            )),
            generator: EmbeddingGenerator::new(service, tuning.embedding()),
        }
    }

    pub fn with_chunker(
        chunker: Arc<dyn ChunkProducer>,
        service: Arc<dyn EmbeddingService>,
        tuning: &IndexingTuning,
    ) -> Self {
        Self {
            chunker,
            generator: EmbeddingGenerator::new(service, tuning.embedding()),
        }
    }
}

#[async_trait]
impl PipelineServices for DefaultPipelineServices {
    /// Shallow listing of every source root. Missing roots and unreadable
    /// files are logged and recorded as skips; the listing is sorted by
    /// path so runs are deterministic.
    async fn enumerate_files(
        &self,
        collection: &CollectionConfig,
    ) -> Result<Enumeration, AppError> {
        let mut enumeration = Enumeration::default();

        for root in &collection.data_paths {
            let mut entries = match tokio::fs::read_dir(root).await {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(
                        collection = %collection.id,
                        root = %root,
                        error = %err,
                        "source root unavailable; skipping"
                    );
                    continue;
                }
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if !entry.file_type().await?.is_file() {
                    continue;
                }

                let supported = path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map(str::to_ascii_lowercase)
                    .is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext.as_str()));
                if !supported {
                    continue;
                }

                let target = path.clone();
                match tokio::task::spawn_blocking(move || fingerprint::fingerprint(&target))
                    .await?
                {
                    Ok(fp) => enumeration.fingerprints.push(fp),
                    Err(err) => {
                        let path = path.to_string_lossy().into_owned();
                        warn!(
                            collection = %collection.id,
                            path = %path,
                            error = %err,
                            "failed to fingerprint file; skipping"
                        );
                        enumeration.skipped.push(SkippedFile {
                            path,
                            reason: err.to_string(),
                        });
                    }
                }
            }
        }

        enumeration.fingerprints.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(enumeration)
    }

    async fn chunk_document(&self, path: &Path) -> Result<Vec<Chunk>, AppError> {
        self.chunker.chunk_file(path).await
    }

    async fn embed_chunks(&self, chunks: Vec<Chunk>) -> Result<Vec<EmbeddedChunk>, AppError> {
        self.generator.embed_chunks(chunks).await
    }
}
