//! Write operations and the codec bound shared by the stages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use bulk_types::{BulkBucket, BulkStatus, BulkStatusDelta, Codec, DataBucket};

use crate::document::Document;
use crate::error::IndexingError;

/// An upsert of one document into a search index.
///
/// `version` is the document's external monotonic version; the sink
/// rejects a write whose version is not newer than the stored one, which
/// makes replays idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexOperation {
    pub index: String,
    pub id: String,
    pub version: u64,
    pub source: Value,
}

impl IndexOperation {
    pub fn from_document(index: impl Into<String>, document: Document) -> Self {
        Self {
            index: index.into(),
            id: document.id,
            version: document.version,
            source: document.source,
        }
    }

    /// Serialized size in bytes, used against byte ceilings.
    pub fn encoded_size(&self) -> Result<usize, IndexingError> {
        Ok(serde_json::to_vec(self)?.len())
    }
}

/// Payload of an indexing [`DataBucket`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexBatch {
    pub operations: Vec<IndexOperation>,
}

impl IndexBatch {
    /// Serialized size of a batch with no operations.
    pub const ENVELOPE_BYTES: usize = r#"{"operations":[]}"#.len();

    /// Bytes between two serialized operations.
    pub const SEPARATOR_BYTES: usize = 1;

    pub fn new(operations: Vec<IndexOperation>) -> Self {
        Self { operations }
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Every record type the index action stages encode or decode.
pub trait PipelineCodec:
    Codec<BulkBucket>
    + Codec<DataBucket>
    + Codec<IndexBatch>
    + Codec<BulkStatusDelta>
    + Codec<BulkStatus>
    + Clone
    + 'static
{
}

impl<C> PipelineCodec for C where
    C: Codec<BulkBucket>
        + Codec<DataBucket>
        + Codec<IndexBatch>
        + Codec<BulkStatusDelta>
        + Codec<BulkStatus>
        + Clone
        + 'static
{
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_document() {
        let doc = Document::new("doc-1", 3, json!({"title": "hello"}));
        let op = IndexOperation::from_document("docs", doc);
        assert_eq!(op.index, "docs");
        assert_eq!(op.id, "doc-1");
        assert_eq!(op.version, 3);
    }

    #[test]
    fn test_encoded_size_grows_with_source() {
        let small = IndexOperation::from_document("i", Document::new("a", 1, json!({"t": "x"})));
        let large = IndexOperation::from_document(
            "i",
            Document::new("a", 1, json!({"t": "x".repeat(100)})),
        );
        assert!(large.encoded_size().unwrap() >= small.encoded_size().unwrap() + 99);
    }

    #[test]
    fn test_batch_size_is_envelope_plus_operations() {
        let ops: Vec<IndexOperation> = ["a", "b", "c"]
            .iter()
            .map(|id| IndexOperation::from_document("i", Document::new(*id, 1, json!({"t": id}))))
            .collect();
        let op_bytes: usize = ops.iter().map(|op| op.encoded_size().unwrap()).sum();

        let empty = serde_json::to_vec(&IndexBatch::default()).unwrap();
        assert_eq!(empty.len(), IndexBatch::ENVELOPE_BYTES);

        let full = serde_json::to_vec(&IndexBatch::new(ops)).unwrap();
        assert_eq!(
            full.len(),
            IndexBatch::ENVELOPE_BYTES + op_bytes + 2 * IndexBatch::SEPARATOR_BYTES
        );
    }
}
