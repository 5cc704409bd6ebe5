//! Checkpoint tracking for stage inputs.
//!
//! A checkpoint records the read offset a stage has durably consumed on
//! one input stream. A restart resumes right after it.

use chrono::{DateTime, Utc};

/// Committed read position of a stage on one input stream.
#[derive(Debug, Clone)]
pub struct StreamCheckpoint {
    /// Stage name
    pub computation: String,

    /// Input stream name
    pub stream: String,

    /// Number of records consumed up to this checkpoint
    pub offset: u64,

    /// Number of commits since creation
    pub commits: u64,

    /// Time of the last commit
    pub committed_at: DateTime<Utc>,
}

impl StreamCheckpoint {
    pub fn new(computation: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            computation: computation.into(),
            stream: stream.into(),
            offset: 0,
            commits: 0,
            committed_at: Utc::now(),
        }
    }

    /// Advance to `offset`. Offsets never move backwards.
    ///
    /// Returns true if the checkpoint moved.
    pub fn advance(&mut self, offset: u64) -> bool {
        if offset <= self.offset {
            return false;
        }
        self.offset = offset;
        self.commits += 1;
        self.committed_at = Utc::now();
        true
    }
}
