//! Error types for the extraction pipeline

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("HTTP error: status {status} for {url}")]
    Http { status: u16, url: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Retries exhausted for {url} after {attempts} attempts: {last}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        last: Box<PipelineError>,
    },

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Source {source_name} failed: {reason}")]
    Source { source_name: String, reason: String },

    #[error("Cancelled during {phase}")]
    Cancelled { phase: String },

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Whether the rate limiter should retry after this error.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::Http { status, .. } => is_retryable_status(*status),
            PipelineError::Network(_) => true,
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled { .. })
    }
}

/// 429 and the transient 5xx family.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => PipelineError::Http {
                status: status.as_u16(),
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
            },
            None => PipelineError::Network(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
