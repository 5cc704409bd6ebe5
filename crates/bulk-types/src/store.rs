//! Command and status lookup.
//!
//! The status-tracking service is external to the pipeline; stages only
//! need read access to commands and statuses through [`CommandStore`].
//! [`MemoryCommandStore`] is the in-process implementation used by tests
//! and local runs. It also plays the status aggregator: deltas are merged
//! additively and the completion transition is reported to the caller.

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::Utc;
use tracing::{debug, info};

use crate::command::BulkCommand;
use crate::error::BulkError;
use crate::status::{BulkState, BulkStatus, BulkStatusDelta};

/// Read access to submitted commands and their statuses.
pub trait CommandStore: Send + Sync {
    /// Look up a command by id. `None` once the command has been evicted.
    fn get_command(&self, command_id: &str) -> Result<Option<BulkCommand>, BulkError>;

    /// Look up the aggregated status of a command.
    fn get_status(&self, command_id: &str) -> Result<Option<BulkStatus>, BulkError>;
}

#[derive(Debug, Default)]
struct StoreInner {
    commands: HashMap<String, BulkCommand>,
    statuses: HashMap<String, BulkStatus>,
}

/// In-memory command store and status aggregator.
#[derive(Debug, Default)]
pub struct MemoryCommandStore {
    inner: RwLock<StoreInner>,
}

impl MemoryCommandStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a command and its initial `Scheduled` status.
    pub fn submit(&self, command: BulkCommand) -> Result<BulkStatus, BulkError> {
        let status = BulkStatus::scheduled(&command);
        let mut inner = self.write()?;
        info!(command_id = %command.id, action = %command.action, "Command submitted");
        inner.statuses.insert(command.id.clone(), status.clone());
        inner.commands.insert(command.id.clone(), command);
        Ok(status)
    }

    /// Mark the start of the id scroll.
    pub fn start_scroll(&self, command_id: &str) -> Result<BulkStatus, BulkError> {
        self.update(command_id, |status| {
            status.state = BulkState::ScrollingRunning;
            status.scroll_start_time = Some(Utc::now());
        })
    }

    /// Mark the end of the id scroll with the number of ids found.
    ///
    /// Returns the status; its state is `Completed` when every delta
    /// already arrived.
    pub fn end_scroll(&self, command_id: &str, total: u64) -> Result<BulkStatus, BulkError> {
        self.update(command_id, |status| {
            status.state = BulkState::Running;
            status.total = total;
            status.scroll_end_time = Some(Utc::now());
            status.check_completed();
        })
    }

    /// Merge a delta. Returns the status snapshot if this delta completed the command.
    pub fn apply_delta(&self, delta: &BulkStatusDelta) -> Result<Option<BulkStatus>, BulkError> {
        let mut inner = self.write()?;
        let status = inner
            .statuses
            .get_mut(&delta.command_id)
            .ok_or_else(|| BulkError::NotFound(format!("status {}", delta.command_id)))?;

        if status.state.is_terminal() {
            debug!(command_id = %delta.command_id, state = %status.state, "Delta after terminal state");
            status.apply(delta);
            return Ok(None);
        }

        if status.apply(delta) {
            info!(
                command_id = %status.id,
                processed = status.processed,
                total = status.total,
                "Command completed"
            );
            return Ok(Some(status.clone()));
        }
        Ok(None)
    }

    /// Move a command to `Aborted`.
    pub fn abort(&self, command_id: &str) -> Result<BulkStatus, BulkError> {
        self.update(command_id, |status| {
            status.state = BulkState::Aborted;
            status.completed_time = Some(Utc::now());
        })
    }

    /// Drop the command while retaining its status.
    pub fn evict_command(&self, command_id: &str) -> Result<bool, BulkError> {
        Ok(self.write()?.commands.remove(command_id).is_some())
    }

    fn update<F>(&self, command_id: &str, f: F) -> Result<BulkStatus, BulkError>
    where
        F: FnOnce(&mut BulkStatus),
    {
        let mut inner = self.write()?;
        let status = inner
            .statuses
            .get_mut(command_id)
            .ok_or_else(|| BulkError::NotFound(format!("status {command_id}")))?;
        f(status);
        Ok(status.clone())
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, StoreInner>, BulkError> {
        self.inner
            .write()
            .map_err(|e| BulkError::Storage(e.to_string()))
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, StoreInner>, BulkError> {
        self.inner
            .read()
            .map_err(|e| BulkError::Storage(e.to_string()))
    }
}

impl CommandStore for MemoryCommandStore {
    fn get_command(&self, command_id: &str) -> Result<Option<BulkCommand>, BulkError> {
        Ok(self.read()?.commands.get(command_id).cloned())
    }

    fn get_status(&self, command_id: &str) -> Result<Option<BulkStatus>, BulkError> {
        Ok(self.read()?.statuses.get(command_id).cloned())
    }
}
