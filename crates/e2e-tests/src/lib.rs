//! End-to-end test infrastructure for the bulk index action.
//!
//! [`LocalPipeline`] hosts every stage in-process and plays the parts the
//! runtime and the status service normally play: it routes produced
//! records to the consuming stage by partition, merges status deltas into
//! a [`MemoryCommandStore`] and republishes completed statuses to the
//! completion reactor.

use std::sync::Arc;

use bulk_indexing::{
    index_action_topology, BuildIndexRequests, BulkIndexSubmitter, Collaborators, Document,
    IndexActionStages, IndexCompletionReactor, MemoryDocumentSource, MemoryIndexAdmin, MemorySink,
    SubmitterConfig, SubmitterState, ACTION_STREAM, BATCH_STREAM, BUILDER_NODE, DONE_STREAM,
    REACTOR_NODE, STATUS_STREAM, SUBMITTER_NODE,
};
use bulk_stream::{partition_for, Computation, MemoryContext, Record, StreamError};
use bulk_types::{
    BulkBucket, BulkCommand, BulkError, BulkStatus, BulkStatusDelta, CommandStore,
    IndexActionSettings, MemoryCommandStore,
};
use tracing_subscriber::EnvFilter;

/// Repository every harness command targets.
pub const REPOSITORY: &str = "default";

/// Write index of [`REPOSITORY`].
pub const WRITE_INDEX: &str = "docs-v1";

/// Install a test subscriber once; `RUST_LOG` overrides `level`.
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

fn store_error(err: BulkError) -> StreamError {
    StreamError::Computation(err.to_string())
}

/// In-process host of the index action.
pub struct LocalPipeline {
    pub settings: IndexActionSettings,
    pub store: Arc<MemoryCommandStore>,
    pub documents: Arc<MemoryDocumentSource>,
    pub admin: Arc<MemoryIndexAdmin>,
    pub sink: Arc<MemorySink>,
    bucket_size: usize,
    done_filter: Option<String>,
    builder: BuildIndexRequests,
    builder_ctx: MemoryContext,
    submitters: Vec<(BulkIndexSubmitter, MemoryContext)>,
    reactor: IndexCompletionReactor,
    reactor_ctx: MemoryContext,
    batches: Vec<Record>,
}

impl LocalPipeline {
    /// Create the stages from `settings` and initialize one submitter per
    /// batch stream partition.
    pub fn new(settings: IndexActionSettings) -> Self {
        init_tracing(&settings.log_level);

        let store = Arc::new(MemoryCommandStore::new());
        let documents = Arc::new(MemoryDocumentSource::new());
        let admin = Arc::new(MemoryIndexAdmin::new().with_write_index(REPOSITORY, WRITE_INDEX));
        let sink = Arc::new(MemorySink::new());

        let topology = index_action_topology(&settings).expect("Invalid topology");
        let IndexActionStages {
            builder,
            submitter,
            reactor,
        } = IndexActionStages::new(
            &settings,
            Collaborators {
                store: store.clone(),
                documents: documents.clone(),
                admin: admin.clone(),
                sink: sink.clone(),
            },
        )
        .expect("Invalid settings");

        let partitions = topology.stream(BATCH_STREAM).map_or(1, |s| s.partitions);
        let mut first = Some(submitter);
        let mut submitters = Vec::with_capacity(partitions);
        for _ in 0..partitions {
            let mut stage = first.take().unwrap_or_else(|| {
                BulkIndexSubmitter::new(SubmitterConfig::from_settings(&settings), sink.clone())
            });
            let mut ctx = MemoryContext::new(SUBMITTER_NODE, BATCH_STREAM).with_clock(0);
            stage.init(&mut ctx).expect("Failed to init submitter");
            submitters.push((stage, ctx));
        }

        let done_filter = topology
            .node(REACTOR_NODE)
            .and_then(|node| node.inputs.first())
            .and_then(|binding| binding.filter.clone());

        Self {
            settings,
            store,
            documents,
            admin,
            sink,
            bucket_size: 50,
            done_filter,
            builder,
            builder_ctx: MemoryContext::new(BUILDER_NODE, ACTION_STREAM),
            submitters,
            reactor,
            reactor_ctx: MemoryContext::new(REACTOR_NODE, DONE_STREAM),
            batches: Vec::new(),
        }
    }

    /// Number of ids per scrolled bucket.
    pub fn with_bucket_size(mut self, bucket_size: usize) -> Self {
        self.bucket_size = bucket_size.max(1);
        self
    }

    /// Store `count` documents at version 1 and return their ids.
    pub fn put_documents(&self, prefix: &str, count: usize) -> Vec<String> {
        (0..count)
            .map(|i| {
                let id = format!("{prefix}-{i:04}");
                self.put_document(&id, 1);
                id
            })
            .collect()
    }

    /// Store or replace one document.
    pub fn put_document(&self, id: &str, version: u64) {
        let source = serde_json::json!({
            "title": format!("Document {id}"),
            "body": format!("Body of {id} at version {version}"),
        });
        self.documents
            .put(REPOSITORY, Document::new(id, version, source))
            .expect("Failed to store document");
    }

    /// Submit a command and scroll `ids` through the batch builder.
    ///
    /// Nothing reaches the index until the next [`tick`](Self::tick).
    pub fn submit(&mut self, command: BulkCommand, ids: &[String]) -> Result<String, StreamError> {
        let command_id = self.start_command(command)?;
        self.scroll(&command_id, ids)?;
        self.end_scroll(&command_id, ids.len() as u64)?;
        Ok(command_id)
    }

    /// Register a command and mark its scroll as started.
    pub fn start_command(&mut self, command: BulkCommand) -> Result<String, StreamError> {
        let command_id = command.id.clone();
        self.store.submit(command).map_err(store_error)?;
        self.store.start_scroll(&command_id).map_err(store_error)?;
        Ok(command_id)
    }

    /// Cut `ids` into buckets and deliver them to the batch builder.
    pub fn scroll(&mut self, command_id: &str, ids: &[String]) -> Result<(), StreamError> {
        for (n, chunk) in ids.chunks(self.bucket_size).enumerate() {
            let bucket = BulkBucket::new(command_id, chunk.to_vec());
            self.deliver_bucket(&format!("{command_id}:{n}"), &bucket)?;
        }
        Ok(())
    }

    /// Record the scroll total; publishes the status if that completes the command.
    pub fn end_scroll(&mut self, command_id: &str, total: u64) -> Result<BulkStatus, StreamError> {
        let status = self
            .store
            .end_scroll(command_id, total)
            .map_err(store_error)?;
        if status.is_completed() {
            self.publish_done(&status)?;
        }
        Ok(status)
    }

    /// Submit a command and flush everything it produced.
    pub fn run(&mut self, command: BulkCommand, ids: &[String]) -> Result<String, StreamError> {
        let command_id = self.submit(command, ids)?;
        self.tick()?;
        Ok(command_id)
    }

    /// Deliver one bucket to the batch builder and route what it produced.
    pub fn deliver_bucket(&mut self, key: &str, bucket: &BulkBucket) -> Result<(), StreamError> {
        let data = serde_json::to_vec(bucket)?;
        self.builder_ctx
            .deliver(&mut self.builder, Record::new(key, data))?;

        for (stream, record) in self.builder_ctx.take_produced() {
            match stream.as_str() {
                BATCH_STREAM => {
                    self.batches.push(record.clone());
                    self.deliver_batch(record)?;
                }
                STATUS_STREAM => self.apply_status(&record)?,
                other => panic!("Unexpected builder output stream {other}"),
            }
        }
        Ok(())
    }

    /// Deliver a batch record to the submitter owning its partition.
    pub fn deliver_batch(&mut self, record: Record) -> Result<(), StreamError> {
        let partition = partition_for(&record.key, self.submitters.len());
        let (stage, ctx) = &mut self.submitters[partition];
        ctx.deliver(stage, record)?;
        let produced = ctx.take_produced();
        self.route_statuses(produced)
    }

    /// Fire every submitter's flush timer.
    ///
    /// Statuses produced by every submitter are routed before the first
    /// error, if any, is returned.
    pub fn tick(&mut self) -> Result<(), StreamError> {
        let interval_ms = self.settings.flush_interval().as_millis() as i64;
        let mut produced = Vec::new();
        let mut outcome = Ok(());
        for (stage, ctx) in &mut self.submitters {
            ctx.advance_clock(interval_ms);
            let fired = ctx.fire_due_timers(stage);
            produced.extend(ctx.take_produced());
            if let Err(e) = fired {
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }
        self.route_statuses(produced)?;
        outcome
    }

    /// Batch records produced by the builder so far, in order.
    pub fn batches(&self) -> &[Record] {
        &self.batches
    }

    pub fn status(&self, command_id: &str) -> BulkStatus {
        self.store
            .get_status(command_id)
            .expect("Failed to read status")
            .expect("Unknown command")
    }

    pub fn submitter_states(&self) -> Vec<SubmitterState> {
        self.submitters.iter().map(|(s, _)| s.state()).collect()
    }

    /// Committed offset of every submitter partition.
    pub fn submitter_offsets(&self) -> Vec<u64> {
        self.submitters
            .iter()
            .map(|(_, ctx)| ctx.checkpoint().offset)
            .collect()
    }

    /// Records consumed by each submitter partition.
    pub fn submitter_consumed(&self) -> Vec<u64> {
        self.submitters.iter().map(|(_, ctx)| ctx.consumed()).collect()
    }

    pub fn builder_offset(&self) -> u64 {
        self.builder_ctx.checkpoint().offset
    }

    /// Statuses delivered to the reactor and its committed offset.
    pub fn reactor_progress(&self) -> (u64, u64) {
        (
            self.reactor_ctx.consumed(),
            self.reactor_ctx.checkpoint().offset,
        )
    }

    /// Tear down and reinitialize every submitter, as a host does after a
    /// fatal error.
    pub fn restart_submitters(&mut self) -> Result<(), StreamError> {
        for (stage, ctx) in &mut self.submitters {
            stage.destroy();
            stage.init(ctx)?;
        }
        Ok(())
    }

    pub fn shutdown(&mut self) {
        self.builder.destroy();
        for (stage, _) in &mut self.submitters {
            stage.destroy();
        }
        self.reactor.destroy();
    }

    fn route_statuses(&mut self, produced: Vec<(String, Record)>) -> Result<(), StreamError> {
        for (stream, record) in produced {
            if stream == STATUS_STREAM {
                self.apply_status(&record)?;
            }
        }
        Ok(())
    }

    fn apply_status(&mut self, record: &Record) -> Result<(), StreamError> {
        let delta = BulkStatusDelta::from_bytes(&record.data)?;
        if let Some(status) = self.store.apply_delta(&delta).map_err(store_error)? {
            self.publish_done(&status)?;
        }
        Ok(())
    }

    fn publish_done(&mut self, status: &BulkStatus) -> Result<(), StreamError> {
        if let Some(action) = &self.done_filter {
            if &status.action != action {
                return Ok(());
            }
        }
        let record = Record::new(status.id.clone(), status.to_bytes()?);
        self.reactor_ctx.deliver(&mut self.reactor, record)
    }
}

impl Drop for LocalPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}
