//! Error types for the worker SDK.

use thiserror::Error;

/// Errors raised while writing heartbeats or submitting batches.
#[derive(Debug, Error)]
pub enum SdkError {
    /// Heartbeat file could not be written.
    #[error("heartbeat write failed: {0}")]
    Io(#[from] std::io::Error),

    /// Heartbeat record could not be encoded.
    #[error("heartbeat encode failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// The coordinator queue is full; resubmit next cycle.
    #[error("coordinator queue is full")]
    Backpressure,

    /// The coordinator refused the batch.
    #[error("coordinator rejected batch ({status}): {reason}")]
    Rejected { status: u16, reason: String },

    /// Timeout waiting for the coordinator.
    #[error("request timed out")]
    Timeout,

    /// Connection or transport failure.
    #[error("HTTP request failed: {0}")]
    Http(String),
}

impl From<reqwest::Error> for SdkError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            SdkError::Timeout
        } else {
            SdkError::Http(err.to_string())
        }
    }
}
