//! Error types for the stage runtime.

use thiserror::Error;

/// Errors raised by stages and topology declarations.
#[derive(Debug, Error)]
pub enum StreamError {
    /// A stage failed to process a record or timer
    #[error("Computation error: {0}")]
    Computation(String),

    /// A stage stopped itself; the host must tear it down
    #[error("Computation aborted: {0}")]
    Aborted(String),

    /// Record or checkpoint encoding error
    #[error("Codec error: {0}")]
    Codec(String),

    /// Invalid topology declaration
    #[error("Topology error: {0}")]
    Topology(String),
}

impl From<serde_json::Error> for StreamError {
    fn from(err: serde_json::Error) -> Self {
        StreamError::Codec(err.to_string())
    }
}

impl StreamError {
    /// Whether the host must stop the stage rather than retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StreamError::Aborted(_))
    }
}
