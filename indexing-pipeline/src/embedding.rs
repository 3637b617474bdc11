use std::{collections::HashMap, sync::Arc, time::Duration};

use common::{
    error::AppError,
    utils::embedding::{EmbeddingRequest, EmbeddingService, JobState},
};
use futures::StreamExt;
use tokio::time::{sleep, Instant};
use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::{debug, info, warn};

use crate::chunking::Chunk;

const SYNC_RETRY_ATTEMPTS: usize = 3;
const PROGRESS_LOG_STEP_PCT: f64 = 20.0;

#[derive(Debug, Clone)]
pub struct EmbeddingTuning {
    /// Chunk counts below this use the synchronous per-chunk path.
    pub min_batch_threshold: usize,
    pub poll_interval: Duration,
    pub batch_timeout: Duration,
    pub sync_concurrency: usize,
}

impl Default for EmbeddingTuning {
    fn default() -> Self {
        Self {
            min_batch_threshold: 5,
            poll_interval: Duration::from_secs(10),
            batch_timeout: Duration::from_secs(30 * 60),
            sync_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub embedding: Vec<f32>,
}

/// Turns a document's chunks into vectors, choosing between the
/// synchronous path and a polled batch job based on chunk count. One
/// call covers one document, so a batch failure never spills into
/// sibling documents.
pub struct EmbeddingGenerator {
    service: Arc<dyn EmbeddingService>,
    tuning: EmbeddingTuning,
}

impl EmbeddingGenerator {
    pub fn new(service: Arc<dyn EmbeddingService>, tuning: EmbeddingTuning) -> Self {
        Self { service, tuning }
    }

    pub fn dimension(&self) -> usize {
        self.service.dimension()
    }

    pub async fn embed_chunks(&self, chunks: Vec<Chunk>) -> Result<Vec<EmbeddedChunk>, AppError> {
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        if chunks.len() < self.tuning.min_batch_threshold {
            self.embed_sync(chunks).await
        } else {
            self.embed_batch(chunks).await
        }
    }

    /// Per-chunk embedding calls with bounded concurrency. Transient
    /// failures are retried with jittered exponential backoff; output
    /// order matches input order.
    async fn embed_sync(&self, chunks: Vec<Chunk>) -> Result<Vec<EmbeddedChunk>, AppError> {
        debug!(chunks = chunks.len(), "embedding below batch threshold");

        let results: Vec<Result<EmbeddedChunk, AppError>> =
            futures::stream::iter(chunks.into_iter().map(|chunk| {
                let service = Arc::clone(&self.service);
                async move {
                    let strategy = ExponentialBackoff::from_millis(100)
                        .map(jitter)
                        .take(SYNC_RETRY_ATTEMPTS);
                    let embedding =
                        Retry::spawn(strategy, || service.embed_one(&chunk.text)).await?;
                    Ok(EmbeddedChunk { chunk, embedding })
                }
            }))
            .buffered(self.tuning.sync_concurrency.max(1))
            .collect()
            .await;

        results.into_iter().collect()
    }

    /// Submits one batch job and polls it to a terminal state. Results
    /// are correlated back by the per-chunk request id, never by the
    /// order the service returns them in.
    async fn embed_batch(&self, chunks: Vec<Chunk>) -> Result<Vec<EmbeddedChunk>, AppError> {
        let requests: Vec<EmbeddingRequest> = chunks
            .iter()
            .map(|chunk| EmbeddingRequest {
                id: request_id(chunk),
                text: chunk.text.clone(),
            })
            .collect();

        let job_id = self.service.submit(&requests).await?;
        info!(job_id = %job_id, chunks = chunks.len(), "batch embedding job submitted");

        let started = Instant::now();
        let mut last_logged_pct = 0.0;

        let final_status = loop {
            let status = self.service.poll(&job_id).await?;

            let pct = status.progress_pct();
            if pct - last_logged_pct >= PROGRESS_LOG_STEP_PCT {
                info!(
                    job_id = %job_id,
                    completed = status.completed,
                    total = status.total,
                    progress_pct = pct,
                    "batch embedding progress"
                );
                last_logged_pct = pct;
            }

            if status.state.is_terminal() {
                break status;
            }

            if started.elapsed() >= self.tuning.batch_timeout {
                if let Err(err) = self.service.cancel(&job_id).await {
                    warn!(job_id = %job_id, error = %err, "failed to cancel timed-out batch job");
                }
                return Err(AppError::BatchTimeout {
                    job_id,
                    timeout_secs: self.tuning.batch_timeout.as_secs(),
                });
            }

            sleep(self.tuning.poll_interval).await;
        };

        if final_status.state != JobState::Completed {
            return Err(AppError::Batch {
                status: final_status.state.as_str().to_string(),
                message: format!(
                    "batch job {job_id} finished with {}/{} items completed",
                    final_status.completed, final_status.total
                ),
            });
        }

        let mut by_id: HashMap<String, _> = self
            .service
            .fetch_results(&job_id)
            .await?
            .into_iter()
            .map(|result| (result.id.clone(), result))
            .collect();

        let mut embedded = Vec::with_capacity(chunks.len());
        let mut failed: Vec<String> = Vec::new();

        for chunk in chunks {
            let id = request_id(&chunk);
            match by_id.remove(&id) {
                Some(result) => match result.embedding {
                    Some(embedding) => embedded.push(EmbeddedChunk { chunk, embedding }),
                    None => failed.push(format!(
                        "{id}: {}",
                        result.error.unwrap_or_else(|| "no embedding returned".into())
                    )),
                },
                None => failed.push(format!("{id}: missing from batch output")),
            }
        }

        if failed.is_empty() {
            Ok(embedded)
        } else {
            Err(AppError::Embedding(format!(
                "batch job {job_id} returned errors for {} item(s): {}",
                failed.len(),
                failed.join("; ")
            )))
        }
    }
}

fn request_id(chunk: &Chunk) -> String {
    format!("chunk-{}", chunk.ordinal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::utils::embedding::{EmbeddingResult, JobStatus};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    fn chunk(ordinal: usize) -> Chunk {
        Chunk {
            ordinal,
            text: format!("chunk text {ordinal}"),
            page_numbers: None,
        }
    }

    /// Scripted service: replays a fixed poll status sequence (repeating
    /// the last one) and hands back a prepared result set.
    struct ScriptedService {
        statuses: Mutex<Vec<JobStatus>>,
        results: Mutex<Vec<EmbeddingResult>>,
        embed_one_calls: AtomicUsize,
        submit_calls: AtomicUsize,
        cancelled: AtomicBool,
    }

    impl ScriptedService {
        fn new(statuses: Vec<JobStatus>, results: Vec<EmbeddingResult>) -> Self {
            Self {
                statuses: Mutex::new(statuses),
                results: Mutex::new(results),
                embed_one_calls: AtomicUsize::new(0),
                submit_calls: AtomicUsize::new(0),
                cancelled: AtomicBool::new(false),
            }
        }

        fn ok_result(id: &str, value: f32) -> EmbeddingResult {
            EmbeddingResult {
                id: id.into(),
                embedding: Some(vec![value; 4]),
                error: None,
            }
        }
    }

    #[async_trait]
    impl EmbeddingService for ScriptedService {
        fn dimension(&self) -> usize {
            4
        }

        async fn embed_one(&self, text: &str) -> Result<Vec<f32>, AppError> {
            self.embed_one_calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![text.len() as f32; 4])
        }

        async fn submit(&self, _requests: &[EmbeddingRequest]) -> Result<String, AppError> {
            self.submit_calls.fetch_add(1, Ordering::SeqCst);
            Ok("job-1".into())
        }

        async fn poll(&self, _job_id: &str) -> Result<JobStatus, AppError> {
            let mut statuses = self.statuses.lock().await;
            if statuses.len() > 1 {
                Ok(statuses.remove(0))
            } else {
                statuses
                    .first()
                    .copied()
                    .ok_or_else(|| AppError::NotFound("no scripted status".into()))
            }
        }

        async fn fetch_results(&self, _job_id: &str) -> Result<Vec<EmbeddingResult>, AppError> {
            Ok(self.results.lock().await.clone())
        }

        async fn cancel(&self, _job_id: &str) -> Result<(), AppError> {
            self.cancelled.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn status(state: JobState, completed: u32, total: u32) -> JobStatus {
        JobStatus {
            state,
            completed,
            total,
        }
    }

    #[tokio::test]
    async fn small_documents_use_the_sync_path_in_order() {
        let service = Arc::new(ScriptedService::new(vec![], vec![]));
        let generator = EmbeddingGenerator::new(service.clone(), EmbeddingTuning::default());

        let chunks: Vec<Chunk> = (0..3).map(chunk).collect();
        let embedded = generator.embed_chunks(chunks).await.expect("embed");

        assert_eq!(embedded.len(), 3);
        for (idx, item) in embedded.iter().enumerate() {
            assert_eq!(item.chunk.ordinal, idx);
        }
        assert_eq!(service.embed_one_calls.load(Ordering::SeqCst), 3);
        assert_eq!(service.submit_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn batch_results_correlate_by_id_not_order() {
        let chunks: Vec<Chunk> = (0..12).map(chunk).collect();

        // Results come back in reverse order; correlation must not care.
        let mut results: Vec<EmbeddingResult> = (0..12)
            .map(|i| ScriptedService::ok_result(&format!("chunk-{i}"), i as f32))
            .collect();
        results.reverse();

        let service = Arc::new(ScriptedService::new(
            vec![
                status(JobState::Running, 0, 12),
                status(JobState::Running, 6, 12),
                status(JobState::Completed, 12, 12),
            ],
            results,
        ));
        let generator = EmbeddingGenerator::new(service.clone(), EmbeddingTuning::default());

        let embedded = generator.embed_chunks(chunks).await.expect("embed");

        assert_eq!(embedded.len(), 12);
        for (idx, item) in embedded.iter().enumerate() {
            assert_eq!(item.chunk.ordinal, idx);
            assert_eq!(item.embedding, vec![idx as f32; 4]);
        }
        assert_eq!(service.embed_one_calls.load(Ordering::SeqCst), 0);
        assert_eq!(service.submit_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_failure_surfaces_the_batch_status() {
        let service = Arc::new(ScriptedService::new(
            vec![status(JobState::Failed, 0, 8)],
            vec![],
        ));
        let generator = EmbeddingGenerator::new(service, EmbeddingTuning::default());

        let chunks: Vec<Chunk> = (0..8).map(chunk).collect();
        let err = generator.embed_chunks(chunks).await.expect_err("fail");
        match err {
            AppError::Batch { status, .. } => assert_eq!(status, "failed"),
            other => panic!("expected batch error, got {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_job_is_cancelled_after_the_timeout() {
        let service = Arc::new(ScriptedService::new(
            vec![status(JobState::Running, 2, 8)],
            vec![],
        ));
        let tuning = EmbeddingTuning {
            poll_interval: Duration::from_secs(10),
            batch_timeout: Duration::from_secs(45),
            ..EmbeddingTuning::default()
        };
        let generator = EmbeddingGenerator::new(service.clone(), tuning);

        let chunks: Vec<Chunk> = (0..8).map(chunk).collect();
        let err = generator.embed_chunks(chunks).await.expect_err("timeout");
        match err {
            AppError::BatchTimeout { timeout_secs, .. } => assert_eq!(timeout_secs, 45),
            other => panic!("expected batch timeout, got {other}"),
        }
        assert!(service.cancelled.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn per_item_errors_name_the_failing_chunks() {
        let mut results: Vec<EmbeddingResult> = (0..5)
            .map(|i| ScriptedService::ok_result(&format!("chunk-{i}"), i as f32))
            .collect();
        results[2] = EmbeddingResult {
            id: "chunk-2".into(),
            embedding: None,
            error: Some("rate_limited".into()),
        };

        let service = Arc::new(ScriptedService::new(
            vec![status(JobState::Completed, 5, 5)],
            results,
        ));
        let generator = EmbeddingGenerator::new(service, EmbeddingTuning::default());

        let chunks: Vec<Chunk> = (0..5).map(chunk).collect();
        let err = generator.embed_chunks(chunks).await.expect_err("item error");
        match err {
            AppError::Embedding(message) => {
                assert!(message.contains("chunk-2"));
                assert!(message.contains("rate_limited"));
            }
            other => panic!("expected embedding error, got {other}"),
        }
    }

    #[tokio::test]
    async fn empty_input_embeds_nothing() {
        let service = Arc::new(ScriptedService::new(vec![], vec![]));
        let generator = EmbeddingGenerator::new(service.clone(), EmbeddingTuning::default());

        let embedded = generator.embed_chunks(Vec::new()).await.expect("embed");
        assert!(embedded.is_empty());
        assert_eq!(service.embed_one_calls.load(Ordering::SeqCst), 0);
        assert_eq!(service.submit_calls.load(Ordering::SeqCst), 0);
    }
}
