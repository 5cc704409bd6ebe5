//! Error types for the bulk index action.

use bulk_stream::StreamError;
use bulk_types::BulkError;
use thiserror::Error;

use crate::sink::SinkError;

/// Errors that can occur in the index action stages
#[derive(Error, Debug)]
pub enum IndexingError {
    /// Domain type, codec or command store error
    #[error("Bulk error: {0}")]
    Bulk(#[from] BulkError),

    /// Document could not be loaded
    #[error("Document error: {0}")]
    Document(String),

    /// Index administration failed (write index lookup, refresh, alias)
    #[error("Index admin error: {0}")]
    Admin(String),

    /// Submission to the search index failed
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    /// The submission buffer is unusable
    #[error("Bulk processor error: {0}")]
    Processor(String),

    /// JSON encoding/decoding errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The stage stopped after an escalated failure
    #[error("Indexing aborted: {0}")]
    Aborted(String),
}

impl From<serde_json::Error> for IndexingError {
    fn from(err: serde_json::Error) -> Self {
        IndexingError::Serialization(err.to_string())
    }
}

impl From<IndexingError> for StreamError {
    fn from(err: IndexingError) -> Self {
        match err {
            IndexingError::Aborted(msg) => StreamError::Aborted(msg),
            IndexingError::Serialization(msg) => StreamError::Codec(msg),
            IndexingError::Bulk(BulkError::Serialization(e)) => StreamError::Codec(e.to_string()),
            other => StreamError::Computation(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IndexingError::Admin("no write index".to_string());
        assert_eq!(err.to_string(), "Index admin error: no write index");

        let err = IndexingError::Aborted("bulk failure".to_string());
        assert_eq!(err.to_string(), "Indexing aborted: bulk failure");
    }

    #[test]
    fn test_into_stream_error() {
        let err: StreamError = IndexingError::Aborted("stop".to_string()).into();
        assert!(err.is_fatal());

        let json_err = serde_json::from_str::<u32>("x").unwrap_err();
        let err: StreamError = IndexingError::from(json_err).into();
        assert!(matches!(err, StreamError::Codec(_)));

        let err: StreamError = IndexingError::Document("gone".to_string()).into();
        assert!(matches!(err, StreamError::Computation(_)));
    }
}
