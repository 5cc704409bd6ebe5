//! Command status and the additive deltas stages publish.
//!
//! Stages never own the running total of a command. They publish
//! [`BulkStatusDelta`] increments; the status aggregator merges them
//! into a [`BulkStatus`].

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::command::BulkCommand;

/// Lifecycle state of a bulk command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BulkState {
    /// Submitted, not yet scrolled
    #[default]
    Scheduled,
    /// Document ids are being scrolled into buckets
    ScrollingRunning,
    /// Scroll finished, buckets are being processed
    Running,
    /// Every document has been processed
    Completed,
    /// Processing stopped before completion
    Aborted,
}

impl BulkState {
    /// Whether no further transition can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BulkState::Completed | BulkState::Aborted)
    }
}

impl std::fmt::Display for BulkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BulkState::Scheduled => write!(f, "scheduled"),
            BulkState::ScrollingRunning => write!(f, "scrolling_running"),
            BulkState::Running => write!(f, "running"),
            BulkState::Completed => write!(f, "completed"),
            BulkState::Aborted => write!(f, "aborted"),
        }
    }
}

/// An increment to a command's status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkStatusDelta {
    /// Command the increment applies to
    pub command_id: String,

    /// Number of items processed since the previous delta
    pub processed: u64,

    /// Result entries; numeric values are summed on merge
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub result: HashMap<String, Value>,
}

impl BulkStatusDelta {
    /// Create a processed-count increment.
    pub fn processed(command_id: impl Into<String>, processed: u64) -> Self {
        Self {
            command_id: command_id.into(),
            processed,
            result: HashMap::new(),
        }
    }

    /// Add a result entry.
    pub fn with_result(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.result.insert(key.into(), value.into());
        self
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Aggregated status of a bulk command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkStatus {
    /// Command id
    pub id: String,

    /// Action name of the command
    pub action: String,

    /// Current state
    pub state: BulkState,

    /// Number of documents selected by the scroll
    pub total: u64,

    /// Number of documents processed so far
    pub processed: u64,

    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub submit_time: DateTime<Utc>,

    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub scroll_start_time: Option<DateTime<Utc>>,

    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub scroll_end_time: Option<DateTime<Utc>>,

    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub completed_time: Option<DateTime<Utc>>,

    /// Merged result entries
    #[serde(default)]
    pub result: HashMap<String, Value>,
}

impl BulkStatus {
    /// Create the initial status of a submitted command.
    pub fn scheduled(command: &BulkCommand) -> Self {
        Self {
            id: command.id.clone(),
            action: command.action.clone(),
            state: BulkState::Scheduled,
            total: 0,
            processed: 0,
            submit_time: command.submitted_at,
            scroll_start_time: None,
            scroll_end_time: None,
            completed_time: None,
            result: HashMap::new(),
        }
    }

    /// Merge a delta into this status.
    ///
    /// Returns true when the merge moved the command to `Completed`.
    pub fn apply(&mut self, delta: &BulkStatusDelta) -> bool {
        self.processed += delta.processed;
        for (key, value) in &delta.result {
            let merged = match (self.result.get(key), value) {
                (Some(Value::Number(old)), Value::Number(new)) => {
                    match (old.as_u64(), new.as_u64()) {
                        (Some(a), Some(b)) => Value::from(a + b),
                        _ => value.clone(),
                    }
                }
                _ => value.clone(),
            };
            self.result.insert(key.clone(), merged);
        }
        self.check_completed()
    }

    /// Move to `Completed` once the scroll is done and every document is processed.
    pub fn check_completed(&mut self) -> bool {
        if self.state == BulkState::Running && self.processed >= self.total {
            self.state = BulkState::Completed;
            self.completed_time = Some(Utc::now());
            return true;
        }
        false
    }

    /// Whether the command completed.
    pub fn is_completed(&self) -> bool {
        self.state == BulkState::Completed
    }

    /// Milliseconds from submission to completion.
    pub fn elapsed_ms(&self) -> Option<i64> {
        self.completed_time
            .map(|done| (done - self.submit_time).num_milliseconds())
    }

    /// Milliseconds the command waited before its scroll started.
    pub fn wait_ms(&self) -> Option<i64> {
        self.scroll_start_time
            .map(|start| (start - self.submit_time).num_milliseconds())
    }

    /// Milliseconds spent scrolling document ids.
    pub fn scroll_ms(&self) -> Option<i64> {
        match (self.scroll_start_time, self.scroll_end_time) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        }
    }

    /// Processing throughput over the whole command lifetime.
    pub fn docs_per_second(&self) -> Option<f64> {
        self.elapsed_ms().map(|ms| {
            let secs = (ms.max(1) as f64) / 1000.0;
            self.processed as f64 / secs
        })
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn running_status(total: u64) -> BulkStatus {
        let cmd = BulkCommand::new("index", "default", "q");
        let mut status = BulkStatus::scheduled(&cmd);
        status.state = BulkState::Running;
        status.total = total;
        status
    }

    #[test]
    fn test_state_display_and_serde() {
        assert_eq!(BulkState::Completed.to_string(), "completed");
        let json = serde_json::to_string(&BulkState::ScrollingRunning).unwrap();
        assert_eq!(json, "\"scrolling_running\"");
        assert!(BulkState::Aborted.is_terminal());
        assert!(!BulkState::Running.is_terminal());
    }

    #[test]
    fn test_apply_is_additive() {
        let mut status = running_status(10);
        let id = status.id.clone();
        assert!(!status.apply(&BulkStatusDelta::processed(&id, 4)));
        assert_eq!(status.processed, 4);
        assert!(status.apply(&BulkStatusDelta::processed(&id, 6)));
        assert_eq!(status.state, BulkState::Completed);
        assert!(status.completed_time.is_some());
    }

    #[test]
    fn test_apply_merges_numeric_results() {
        let mut status = running_status(100);
        let id = status.id.clone();
        status.apply(&BulkStatusDelta::processed(&id, 0).with_result("versionConflicts", 2));
        status.apply(&BulkStatusDelta::processed(&id, 0).with_result("versionConflicts", 3));
        assert_eq!(status.result.get("versionConflicts"), Some(&Value::from(5u64)));
    }

    #[test]
    fn test_not_completed_while_scrolling() {
        let mut status = running_status(0);
        status.state = BulkState::ScrollingRunning;
        let id = status.id.clone();
        assert!(!status.apply(&BulkStatusDelta::processed(&id, 5)));
        assert_eq!(status.state, BulkState::ScrollingRunning);
    }

    #[test]
    fn test_timings() {
        let mut status = running_status(1000);
        let submit = status.submit_time;
        status.scroll_start_time = Some(submit + Duration::milliseconds(200));
        status.scroll_end_time = Some(submit + Duration::milliseconds(700));
        status.completed_time = Some(submit + Duration::milliseconds(2000));
        status.processed = 1000;

        assert_eq!(status.wait_ms(), Some(200));
        assert_eq!(status.scroll_ms(), Some(500));
        assert_eq!(status.elapsed_ms(), Some(2000));
        let rate = status.docs_per_second().unwrap();
        assert!((rate - 500.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_delta_bytes_roundtrip() {
        let delta = BulkStatusDelta::processed("cmd", 7).with_result("indexingErrors", 1);
        let decoded = BulkStatusDelta::from_bytes(&delta.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, delta);
    }
}
