use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Conversion error: {0}")]
    Conversion(String),
    #[error("Embedding error: {0}")]
    Embedding(String),
    #[error("Batch job reached terminal state '{status}': {message}")]
    Batch { status: String, message: String },
    #[error("Batch job {job_id} did not finish within {timeout_secs}s")]
    BatchTimeout { job_id: String, timeout_secs: u64 },
    #[error("Table not found: {0}")]
    TableNotFound(String),
    #[error("Schema mismatch on table {table}: index dimension {found}, expected {expected}")]
    SchemaMismatch {
        table: String,
        expected: usize,
        found: usize,
    },
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Errors that abort a whole refresh run rather than a single file or collection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AppError::Config(_) | AppError::Validation(_))
    }
}
