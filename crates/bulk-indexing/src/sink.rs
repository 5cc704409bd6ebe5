//! Search-index sink protocol.
//!
//! A [`BulkSink`] writes a batch of upserts and reports the outcome of each
//! operation. Failures are classified so the submitter can tolerate
//! version conflicts and escalate everything else.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::operation::IndexOperation;

/// A whole-request failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SinkError {
    /// The index is temporarily unable to accept the request
    #[error("Sink unavailable: {0}")]
    Unavailable(String),

    /// The request could not be delivered or was rejected as a whole
    #[error("Transport error: {0}")]
    Transport(String),
}

impl SinkError {
    /// Whether the request may succeed if sent again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SinkError::Unavailable(_))
    }
}

/// Classification of a per-operation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The stored document has the same or a newer version
    VersionConflict,
    /// Any other rejection
    Other,
}

/// Why one operation failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub kind: FailureKind,
    pub message: String,
}

/// One operation queued for submission, tagged with its command.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkItem {
    pub command_id: String,
    pub operation: IndexOperation,
    /// Serialized size of the operation
    pub size: usize,
}

/// A batch of operations submitted in one call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkRequest {
    pub items: Vec<BulkItem>,
    pub size_bytes: usize,
}

impl BulkRequest {
    pub fn push(&mut self, item: BulkItem) {
        self.size_bytes += item.size;
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Outcome of one operation; positional with the request items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItemResponse {
    pub id: String,
    pub failure: Option<ItemFailure>,
}

/// Outcome of a submitted request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkResponse {
    pub items: Vec<BulkItemResponse>,
    pub took_ms: u64,
}

impl BulkResponse {
    pub fn has_failures(&self) -> bool {
        self.items.iter().any(|i| i.failure.is_some())
    }
}

/// Writes batches of operations to a search index.
pub trait BulkSink: Send + Sync {
    fn submit(&self, request: &BulkRequest) -> Result<BulkResponse, SinkError>;
}

#[derive(Debug, Default)]
struct SinkState {
    // (index, id) -> (version, source)
    documents: HashMap<(String, String), (u64, serde_json::Value)>,
    rejected_ids: HashSet<String>,
    scripted_errors: VecDeque<SinkError>,
    submissions: u64,
}

/// In-memory sink enforcing external versioning.
///
/// A write is applied only when its version is greater than the stored
/// one; otherwise it fails with [`FailureKind::VersionConflict`].
#[derive(Debug, Default)]
pub struct MemorySink {
    state: Mutex<SinkState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject every future write of `id` with [`FailureKind::Other`].
    pub fn reject_id(&self, id: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.rejected_ids.insert(id.to_string());
        }
    }

    /// Fail the next submissions with the given errors, in order.
    pub fn fail_next(&self, error: SinkError) {
        if let Ok(mut state) = self.state.lock() {
            state.scripted_errors.push_back(error);
        }
    }

    /// Number of documents visible in `index`.
    pub fn document_count(&self, index: &str) -> usize {
        self.state
            .lock()
            .map(|s| s.documents.keys().filter(|(i, _)| i == index).count())
            .unwrap_or(0)
    }

    /// Stored version of a document.
    pub fn version_of(&self, index: &str, id: &str) -> Option<u64> {
        self.state.lock().ok().and_then(|s| {
            s.documents
                .get(&(index.to_string(), id.to_string()))
                .map(|(v, _)| *v)
        })
    }

    /// Number of submit calls received, including failed ones.
    pub fn submissions(&self) -> u64 {
        self.state.lock().map(|s| s.submissions).unwrap_or(0)
    }
}

impl BulkSink for MemorySink {
    fn submit(&self, request: &BulkRequest) -> Result<BulkResponse, SinkError> {
        let mut state = self
            .state
            .lock()
            .map_err(|e| SinkError::Transport(e.to_string()))?;
        state.submissions += 1;

        if let Some(error) = state.scripted_errors.pop_front() {
            return Err(error);
        }

        let mut items = Vec::with_capacity(request.len());
        for item in &request.items {
            let op = &item.operation;
            let key = (op.index.clone(), op.id.clone());

            let failure = if state.rejected_ids.contains(&op.id) {
                Some(ItemFailure {
                    kind: FailureKind::Other,
                    message: format!("document {} rejected", op.id),
                })
            } else {
                let stored_version = state.documents.get(&key).map(|(v, _)| *v);
                match stored_version {
                    Some(stored) if stored >= op.version => Some(ItemFailure {
                        kind: FailureKind::VersionConflict,
                        message: format!(
                            "version conflict, current version [{stored}] is higher or equal to the one provided [{}]",
                            op.version
                        ),
                    }),
                    _ => {
                        state.documents.insert(key, (op.version, op.source.clone()));
                        None
                    }
                }
            };

            items.push(BulkItemResponse {
                id: op.id.clone(),
                failure,
            });
        }

        debug!(items = items.len(), "Bulk request applied");
        Ok(BulkResponse { items, took_ms: 0 })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use serde_json::json;

    fn request(ops: &[(&str, u64)]) -> BulkRequest {
        let mut req = BulkRequest::default();
        for (id, version) in ops {
            let op = IndexOperation::from_document("docs", Document::new(*id, *version, json!({})));
            req.push(BulkItem {
                command_id: "cmd".to_string(),
                operation: op,
                size: 10,
            });
        }
        req
    }

    #[test]
    fn test_submit_applies_operations() {
        let sink = MemorySink::new();
        let response = sink.submit(&request(&[("a", 1), ("b", 1)])).unwrap();
        assert!(!response.has_failures());
        assert_eq!(sink.document_count("docs"), 2);
    }

    #[test]
    fn test_replay_is_version_conflict() {
        let sink = MemorySink::new();
        sink.submit(&request(&[("a", 1)])).unwrap();
        let response = sink.submit(&request(&[("a", 1)])).unwrap();

        let failure = response.items[0].failure.as_ref().unwrap();
        assert_eq!(failure.kind, FailureKind::VersionConflict);
        assert_eq!(sink.document_count("docs"), 1);

        // A newer version is applied
        let response = sink.submit(&request(&[("a", 2)])).unwrap();
        assert!(!response.has_failures());
        assert_eq!(sink.version_of("docs", "a"), Some(2));
    }

    #[test]
    fn test_rejected_id_is_other_failure() {
        let sink = MemorySink::new();
        sink.reject_id("bad");
        let response = sink.submit(&request(&[("ok", 1), ("bad", 1)])).unwrap();
        assert!(response.items[0].failure.is_none());
        assert_eq!(
            response.items[1].failure.as_ref().map(|f| f.kind),
            Some(FailureKind::Other)
        );
    }

    #[test]
    fn test_scripted_errors() {
        let sink = MemorySink::new();
        sink.fail_next(SinkError::Unavailable("busy".to_string()));
        assert!(sink.submit(&request(&[("a", 1)])).is_err());
        assert!(sink.submit(&request(&[("a", 1)])).is_ok());
        assert_eq!(sink.submissions(), 2);
        assert!(SinkError::Unavailable(String::new()).is_retryable());
        assert!(!SinkError::Transport(String::new()).is_retryable());
    }
}
