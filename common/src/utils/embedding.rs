use std::{
    collections::{hash_map::DefaultHasher, HashMap},
    hash::{Hash, Hasher},
    sync::Arc,
};

use async_openai::{
    config::OpenAIConfig,
    types::{
        BatchCompletionWindow, BatchEndpoint, BatchRequest, BatchStatus, CreateEmbeddingRequestArgs,
        CreateFileRequest, FileInput, FilePurpose,
    },
    Client,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::{
    error::AppError,
    utils::config::{AppConfig, EmbeddingBackend},
};

/// One text waiting to be embedded, tagged with a stable identifier so
/// batch results can be correlated back to their originating chunk
/// regardless of the order the remote service returns them in.
#[derive(Debug, Clone)]
pub struct EmbeddingRequest {
    pub id: String,
    pub text: String,
}

/// Per-item outcome of a batch job. Either `embedding` or `error` is set.
#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    pub id: String,
    pub embedding: Option<Vec<f32>>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Submitted,
    Running,
    Completed,
    Failed,
    Expired,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Expired | JobState::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Submitted => "submitted",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Expired => "expired",
            JobState::Cancelled => "cancelled",
        }
    }
}

/// Snapshot of a batch job as last observed by polling.
#[derive(Debug, Clone, Copy)]
pub struct JobStatus {
    pub state: JobState,
    pub completed: u32,
    pub total: u32,
}

impl JobStatus {
    pub fn progress_pct(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (f64::from(self.completed) / f64::from(self.total)).min(1.0) * 100.0
        }
    }
}

/// The remote embedding service boundary: a synchronous per-text call
/// plus the asynchronous submit/poll/fetch batch triple.
#[async_trait]
pub trait EmbeddingService: Send + Sync {
    fn dimension(&self) -> usize;

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, AppError>;

    async fn submit(&self, requests: &[EmbeddingRequest]) -> Result<String, AppError>;

    async fn poll(&self, job_id: &str) -> Result<JobStatus, AppError>;

    async fn fetch_results(&self, job_id: &str) -> Result<Vec<EmbeddingResult>, AppError>;

    /// Best-effort cancel; services without cancellation may ignore it.
    async fn cancel(&self, job_id: &str) -> Result<(), AppError>;
}

/// Builds the configured embedding service.
pub fn service_from_config(
    config: &AppConfig,
    openai_client: Option<Arc<Client<OpenAIConfig>>>,
) -> Result<Arc<dyn EmbeddingService>, AppError> {
    match config.embedding_backend {
        EmbeddingBackend::OpenAI => {
            let client = openai_client.ok_or_else(|| {
                AppError::Validation("openai embedding backend requires an API client".into())
            })?;
            Ok(Arc::new(OpenAiEmbeddingService::new(
                client,
                config.embedding_model.clone(),
                config.embedding_dimensions,
            )))
        }
        EmbeddingBackend::Hashed => Ok(Arc::new(HashedEmbeddingService::new(
            config.embedding_dimensions as usize,
        ))),
    }
}

// ---------------------------------------------------------------------------
// OpenAI-backed service
// ---------------------------------------------------------------------------

/// Embeddings via the OpenAI API: per-text calls for the synchronous
/// path, and the files + batches endpoints for the asynchronous path.
/// Batch requests are JSONL lines keyed by `custom_id`.
pub struct OpenAiEmbeddingService {
    client: Arc<Client<OpenAIConfig>>,
    model: String,
    dimensions: u32,
    /// Output file ids by job, recorded when a poll observes completion.
    output_files: Mutex<HashMap<String, String>>,
}

#[derive(Serialize)]
struct BatchInputLine<'a> {
    custom_id: &'a str,
    method: &'static str,
    url: &'static str,
    body: BatchEmbeddingBody<'a>,
}

#[derive(Serialize)]
struct BatchEmbeddingBody<'a> {
    model: &'a str,
    input: &'a str,
    dimensions: u32,
}

#[derive(Deserialize)]
struct BatchOutputLine {
    custom_id: String,
    response: Option<BatchOutputResponse>,
    error: Option<BatchLineError>,
}

#[derive(Deserialize)]
struct BatchOutputResponse {
    status_code: u16,
    body: Option<BatchOutputBody>,
}

#[derive(Deserialize)]
struct BatchOutputBody {
    data: Vec<BatchOutputDatum>,
}

#[derive(Deserialize)]
struct BatchOutputDatum {
    embedding: Vec<f32>,
}

#[derive(Deserialize)]
struct BatchLineError {
    code: Option<String>,
    message: Option<String>,
}

impl OpenAiEmbeddingService {
    pub fn new(client: Arc<Client<OpenAIConfig>>, model: String, dimensions: u32) -> Self {
        Self {
            client,
            model,
            dimensions,
            output_files: Mutex::new(HashMap::new()),
        }
    }

    fn map_status(status: &BatchStatus) -> JobState {
        match status {
            BatchStatus::Validating => JobState::Submitted,
            BatchStatus::InProgress | BatchStatus::Finalizing | BatchStatus::Cancelling => {
                JobState::Running
            }
            BatchStatus::Completed => JobState::Completed,
            BatchStatus::Failed => JobState::Failed,
            BatchStatus::Expired => JobState::Expired,
            BatchStatus::Cancelled => JobState::Cancelled,
        }
    }

    fn encode_input(&self, requests: &[EmbeddingRequest]) -> Result<Vec<u8>, AppError> {
        let mut payload = Vec::new();
        for request in requests {
            let line = BatchInputLine {
                custom_id: &request.id,
                method: "POST",
                url: "/v1/embeddings",
                body: BatchEmbeddingBody {
                    model: &self.model,
                    input: &request.text,
                    dimensions: self.dimensions,
                },
            };
            let encoded = serde_json::to_vec(&line)
                .map_err(|e| AppError::Embedding(format!("encoding batch input line: {e}")))?;
            payload.extend_from_slice(&encoded);
            payload.push(b'\n');
        }
        Ok(payload)
    }

    fn decode_output(raw: &[u8]) -> Result<Vec<EmbeddingResult>, AppError> {
        let text = std::str::from_utf8(raw)
            .map_err(|e| AppError::Embedding(format!("batch output was not UTF-8: {e}")))?;

        let mut results = Vec::new();
        for line in text.lines().filter(|line| !line.trim().is_empty()) {
            let parsed: BatchOutputLine = serde_json::from_str(line)
                .map_err(|e| AppError::Embedding(format!("decoding batch output line: {e}")))?;

            let error = match (&parsed.error, &parsed.response) {
                (Some(err), _) => Some(format!(
                    "{}: {}",
                    err.code.as_deref().unwrap_or("error"),
                    err.message.as_deref().unwrap_or("batch item failed")
                )),
                (None, Some(response)) if response.status_code >= 300 => {
                    Some(format!("batch item returned HTTP {}", response.status_code))
                }
                _ => None,
            };

            let embedding = if error.is_none() {
                parsed
                    .response
                    .and_then(|r| r.body)
                    .and_then(|body| body.data.into_iter().next())
                    .map(|datum| datum.embedding)
            } else {
                None
            };

            let error = match (&embedding, error) {
                (None, None) => Some("batch item carried no embedding data".to_string()),
                (_, err) => err,
            };

            results.push(EmbeddingResult {
                id: parsed.custom_id,
                embedding,
                error,
            });
        }

        Ok(results)
    }
}

#[async_trait]
impl EmbeddingService for OpenAiEmbeddingService {
    fn dimension(&self) -> usize {
        self.dimensions as usize
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, AppError> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(self.model.clone())
            .input([text])
            .dimensions(self.dimensions)
            .build()?;

        let response = self.client.embeddings().create(request).await?;

        let embedding = response
            .data
            .into_iter()
            .next()
            .ok_or_else(|| AppError::Embedding("No embedding data received from API".into()))?
            .embedding;

        debug!(dimensions = embedding.len(), "embedding created");

        Ok(embedding)
    }

    async fn submit(&self, requests: &[EmbeddingRequest]) -> Result<String, AppError> {
        let payload = self.encode_input(requests)?;

        let file = self
            .client
            .files()
            .create(CreateFileRequest {
                file: FileInput::from_vec_u8("embedding-batch.jsonl".to_string(), payload),
                purpose: FilePurpose::Batch,
            })
            .await?;

        let batch = self
            .client
            .batches()
            .create(BatchRequest {
                input_file_id: file.id,
                endpoint: BatchEndpoint::V1Embeddings,
                completion_window: BatchCompletionWindow::W24H,
                metadata: None,
            })
            .await?;

        debug!(job_id = %batch.id, requests = requests.len(), "batch embedding job submitted");

        Ok(batch.id)
    }

    async fn poll(&self, job_id: &str) -> Result<JobStatus, AppError> {
        let batch = self.client.batches().retrieve(job_id).await?;

        if let Some(output_file_id) = batch.output_file_id.clone() {
            self.output_files
                .lock()
                .await
                .insert(job_id.to_string(), output_file_id);
        }

        let (completed, total) = batch
            .request_counts
            .as_ref()
            .map_or((0, 0), |counts| (counts.completed, counts.total));

        Ok(JobStatus {
            state: Self::map_status(&batch.status),
            completed,
            total,
        })
    }

    async fn fetch_results(&self, job_id: &str) -> Result<Vec<EmbeddingResult>, AppError> {
        let output_file_id = match self.output_files.lock().await.get(job_id) {
            Some(id) => id.clone(),
            None => {
                let batch = self.client.batches().retrieve(job_id).await?;
                batch.output_file_id.ok_or_else(|| {
                    AppError::Embedding(format!("batch job {job_id} has no output file"))
                })?
            }
        };

        let raw = self.client.files().content(&output_file_id).await?;
        Self::decode_output(&raw)
    }

    async fn cancel(&self, job_id: &str) -> Result<(), AppError> {
        self.client.batches().cancel(job_id).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Hashed service: deterministic local embeddings
// ---------------------------------------------------------------------------

/// Token-bucket hashed embeddings. No network, deterministic, and with
/// an instantly-completing in-process batch queue; used for offline
/// operation and in tests.
pub struct HashedEmbeddingService {
    dimension: usize,
    jobs: Mutex<HashMap<String, Vec<EmbeddingRequest>>>,
}

impl HashedEmbeddingService {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
            jobs: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl EmbeddingService for HashedEmbeddingService {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_one(&self, text: &str) -> Result<Vec<f32>, AppError> {
        Ok(hashed_embedding(text, self.dimension))
    }

    async fn submit(&self, requests: &[EmbeddingRequest]) -> Result<String, AppError> {
        let job_id = format!("hashed-{}", Uuid::new_v4());
        self.jobs
            .lock()
            .await
            .insert(job_id.clone(), requests.to_vec());
        Ok(job_id)
    }

    async fn poll(&self, job_id: &str) -> Result<JobStatus, AppError> {
        let jobs = self.jobs.lock().await;
        let requests = jobs
            .get(job_id)
            .ok_or_else(|| AppError::NotFound(format!("unknown batch job {job_id}")))?;
        let total = u32::try_from(requests.len()).unwrap_or(u32::MAX);
        Ok(JobStatus {
            state: JobState::Completed,
            completed: total,
            total,
        })
    }

    async fn fetch_results(&self, job_id: &str) -> Result<Vec<EmbeddingResult>, AppError> {
        let requests = self
            .jobs
            .lock()
            .await
            .remove(job_id)
            .ok_or_else(|| AppError::NotFound(format!("unknown batch job {job_id}")))?;

        Ok(requests
            .into_iter()
            .map(|request| EmbeddingResult {
                embedding: Some(hashed_embedding(&request.text, self.dimension)),
                error: None,
                id: request.id,
            })
            .collect())
    }

    async fn cancel(&self, job_id: &str) -> Result<(), AppError> {
        self.jobs.lock().await.remove(job_id);
        Ok(())
    }
}

// Helper functions for hashed embeddings
fn hashed_embedding(text: &str, dimension: usize) -> Vec<f32> {
    let dim = dimension.max(1);
    let mut vector = vec![0.0f32; dim];
    if text.is_empty() {
        return vector;
    }

    let mut token_count = 0f32;
    for token in tokens(text) {
        token_count += 1.0;
        let idx = bucket(&token, dim);
        if let Some(slot) = vector.get_mut(idx) {
            *slot += 1.0;
        }
    }

    if token_count == 0.0 {
        return vector;
    }

    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in &mut vector {
            *value /= norm;
        }
    }

    vector
}

fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_ascii_lowercase())
}

fn bucket(token: &str, dimension: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    token.hash(&mut hasher);
    (hasher.finish() as usize) % dimension
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hashed_embeddings_are_deterministic_and_normalized() {
        let service = HashedEmbeddingService::new(64);

        let a = service.embed_one("vector search for documents").await.expect("embed");
        let b = service.embed_one("vector search for documents").await.expect("embed");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let norm = a.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn hashed_batch_round_trip_preserves_ids() {
        let service = HashedEmbeddingService::new(32);
        let requests = vec![
            EmbeddingRequest {
                id: "chunk-0".into(),
                text: "first span".into(),
            },
            EmbeddingRequest {
                id: "chunk-1".into(),
                text: "second span".into(),
            },
        ];

        let job_id = service.submit(&requests).await.expect("submit");
        let status = service.poll(&job_id).await.expect("poll");
        assert_eq!(status.state, JobState::Completed);
        assert_eq!(status.total, 2);

        let results = service.fetch_results(&job_id).await.expect("fetch");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "chunk-0");
        assert_eq!(results[1].id, "chunk-1");
        assert!(results.iter().all(|r| r.embedding.is_some()));
    }

    #[test]
    fn batch_output_decoding_flags_per_item_errors() {
        let raw = concat!(
            r#"{"custom_id":"chunk-0","response":{"status_code":200,"body":{"data":[{"embedding":[0.1,0.2]}]}},"error":null}"#,
            "\n",
            r#"{"custom_id":"chunk-1","response":null,"error":{"code":"rate_limited","message":"too many requests"}}"#,
            "\n",
        );

        let results = OpenAiEmbeddingService::decode_output(raw.as_bytes()).expect("decode");
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "chunk-0");
        assert_eq!(results[0].embedding.as_deref(), Some(&[0.1, 0.2][..]));
        assert!(results[0].error.is_none());
        assert!(results[1].embedding.is_none());
        assert!(results[1].error.as_deref().unwrap_or("").contains("rate_limited"));
    }

    #[test]
    fn empty_text_embeds_to_zero_vector() {
        let vector = hashed_embedding("", 8);
        assert_eq!(vector, vec![0.0; 8]);
    }
}
