//! Error taxonomy for the market-data pipeline.
//!
//! Per-task loops catch everything except [`PipelineError::Cancelled`], log,
//! sleep, and resume. Only `start()` and other explicit public entry points
//! surface a `PipelineError` to the caller.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("http {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("failed to parse message: {0}")]
    Parse(String),

    /// The limiter never actually returns this — `acquire` retries until it
    /// succeeds — but the variant keeps the taxonomy total for callers that
    /// match on every `PipelineError` arm.
    #[error("rate limit exhausted for {0}")]
    RateLimited(String),

    #[error("misconfigured: {0}")]
    Misconfigured(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PipelineError::Timeout(std::time::Duration::from_secs(0))
        } else if let Some(status) = err.status() {
            PipelineError::HttpStatus {
                status: status.as_u16(),
                body: err.to_string(),
            }
        } else {
            PipelineError::Network(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for PipelineError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        PipelineError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Parse(err.to_string())
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
