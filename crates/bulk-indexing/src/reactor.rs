//! Completion reactor stage.
//!
//! Watches command statuses and, once an index command completes, makes
//! the new documents searchable: refresh the write index and repoint the
//! search alias when the command asked for it.

use std::sync::Arc;

use bulk_stream::{Computation, ComputationContext, ComputationMetadata, Record, StreamError};
use bulk_types::{BulkCommand, BulkState, BulkStatus, Codec, CommandStore, JsonCodec};
use tracing::{debug, error, info};

use crate::admin::IndexAdmin;
use crate::operation::PipelineCodec;
use crate::topology::{DONE_STREAM, REACTOR_NODE};

/// Stage consuming [`BulkStatus`] snapshots of one action.
pub struct IndexCompletionReactor<C = JsonCodec> {
    meta: ComputationMetadata,
    action_name: String,
    codec: C,
    store: Arc<dyn CommandStore>,
    admin: Arc<dyn IndexAdmin>,
}

impl IndexCompletionReactor<JsonCodec> {
    pub fn new(
        action_name: impl Into<String>,
        store: Arc<dyn CommandStore>,
        admin: Arc<dyn IndexAdmin>,
    ) -> Self {
        Self::with_codec(action_name, JsonCodec, store, admin)
    }
}

impl<C: PipelineCodec> IndexCompletionReactor<C> {
    pub fn with_codec(
        action_name: impl Into<String>,
        codec: C,
        store: Arc<dyn CommandStore>,
        admin: Arc<dyn IndexAdmin>,
    ) -> Self {
        Self {
            meta: ComputationMetadata::new(REACTOR_NODE).with_input(DONE_STREAM),
            action_name: action_name.into(),
            codec,
            store,
            admin,
        }
    }

    fn is_relevant(&self, status: &BulkStatus) -> bool {
        status.action == self.action_name && status.state == BulkState::Completed
    }

    fn on_completed(&self, status: &BulkStatus) {
        let command = match self.store.get_command(&status.id) {
            Ok(Some(command)) => command,
            Ok(None) => {
                error!(
                    command_id = %status.id,
                    "Completed command not found, skipping post-indexing"
                );
                return;
            }
            Err(e) => {
                error!(command_id = %status.id, error = %e, "Cannot load completed command");
                return;
            }
        };

        self.apply_side_effects(&command);
        log_telemetry(status);
    }

    fn apply_side_effects(&self, command: &BulkCommand) {
        if command.refresh_on_completion() {
            if let Err(e) = self.admin.refresh(&command.repository) {
                error!(
                    command_id = %command.id,
                    repository = %command.repository,
                    error = %e,
                    "Refresh after indexing failed"
                );
            }
        }
        if command.update_alias() {
            if let Err(e) = self.admin.sync_search_alias(&command.repository) {
                error!(
                    command_id = %command.id,
                    repository = %command.repository,
                    error = %e,
                    "Search alias update failed"
                );
            }
        }
    }
}

fn log_telemetry(status: &BulkStatus) {
    let elapsed_ms = status.elapsed_ms().unwrap_or(0);
    let wait_ms = status.wait_ms().unwrap_or(0);
    let scroll_ms = status.scroll_ms().unwrap_or(0);
    let docs_per_second = status.docs_per_second().unwrap_or(0.0);
    info!(
        command_id = %status.id,
        processed = status.processed,
        elapsed_ms,
        wait_ms,
        scroll_ms,
        docs_per_second,
        "Indexing command completed"
    );
}

impl<C: PipelineCodec> Computation for IndexCompletionReactor<C> {
    fn metadata(&self) -> &ComputationMetadata {
        &self.meta
    }

    fn process_record(
        &mut self,
        ctx: &mut dyn ComputationContext,
        _input_stream: &str,
        record: Record,
    ) -> Result<(), StreamError> {
        match Codec::<BulkStatus>::decode(&self.codec, &record.data) {
            Ok(status) if self.is_relevant(&status) => self.on_completed(&status),
            Ok(status) => {
                debug!(
                    command_id = %status.id,
                    action = %status.action,
                    state = %status.state,
                    "Ignoring status"
                );
            }
            Err(e) => {
                error!(key = %record.key, error = %e, "Cannot decode status, skipping");
            }
        }
        ctx.ask_for_checkpoint();
        Ok(())
    }
}
