//! Records carried between pipeline stages.
//!
//! [`BulkBucket`] is the unit the scroller hands to the first stage.
//! [`DataBucket`] is the generic carrier between later stages: the payload
//! is opaque and decoded by whichever stage consumes it, so the same type
//! serves indexing batches and any other aggregable data.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// A slice of a command's scrolled document ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkBucket {
    /// Command the ids belong to
    pub command_id: String,

    /// Document ids in scroll order
    pub ids: Vec<String>,
}

impl BulkBucket {
    pub fn new(command_id: impl Into<String>, ids: Vec<String>) -> Self {
        Self {
            command_id: command_id.into(),
            ids,
        }
    }

    /// Declared number of items in the bucket.
    pub fn size(&self) -> u64 {
        self.ids.len() as u64
    }
}

/// Opaque, counted payload for one command.
///
/// `count` always reflects the number of logical items represented, even
/// when `payload` is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataBucket {
    /// Command the data belongs to
    pub command_id: String,

    /// Number of logical items represented
    pub count: u64,

    /// Encoded data, interpreted by the consuming stage
    #[serde(default, with = "base64_payload")]
    pub payload: Vec<u8>,
}

impl DataBucket {
    pub fn new(command_id: impl Into<String>, count: u64, payload: Vec<u8>) -> Self {
        Self {
            command_id: command_id.into(),
            count,
            payload,
        }
    }

    /// A count-only bucket with no payload.
    pub fn count_only(command_id: impl Into<String>, count: u64) -> Self {
        Self::new(command_id, count, Vec::new())
    }

    pub fn is_count_only(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Payload bytes travel as one base64 string rather than a number array.
mod base64_payload {
    use base64::{prelude::BASE64_STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Default)]
struct PendingAggregate {
    count: u64,
    delivered: u64,
    payload: Vec<u8>,
}

/// Concatenates data buckets per command until the command's total is reached.
///
/// A partial aggregate is emitted early when appending the next payload
/// would exceed `max_bytes`. Commands may interleave freely.
#[derive(Debug)]
pub struct BucketAggregator {
    max_bytes: usize,
    pending: HashMap<String, PendingAggregate>,
}

impl BucketAggregator {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            pending: HashMap::new(),
        }
    }

    /// Add a bucket of a command whose declared total is `total`.
    ///
    /// Returns the aggregates that became ready, in emission order.
    pub fn append(&mut self, bucket: DataBucket, total: u64) -> Vec<DataBucket> {
        let mut ready = Vec::new();
        let command_id = bucket.command_id;
        let pending = self.pending.entry(command_id.clone()).or_default();

        if !pending.payload.is_empty()
            && pending.payload.len() + bucket.payload.len() > self.max_bytes
        {
            debug!(
                command_id = %command_id,
                bytes = pending.payload.len(),
                "Aggregate reached byte ceiling, emitting partial"
            );
            ready.push(DataBucket::new(
                command_id.clone(),
                pending.count,
                std::mem::take(&mut pending.payload),
            ));
            pending.count = 0;
        }

        pending.payload.extend_from_slice(&bucket.payload);
        pending.count += bucket.count;
        pending.delivered += bucket.count;

        if pending.delivered >= total {
            if let Some(done) = self.pending.remove(&command_id) {
                if done.count > 0 || !done.payload.is_empty() {
                    ready.push(DataBucket::new(command_id, done.count, done.payload));
                }
            }
        }
        ready
    }

    /// Number of commands with an unfinished aggregate.
    pub fn pending_commands(&self) -> usize {
        self.pending.len()
    }
}
