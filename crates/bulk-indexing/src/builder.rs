//! Batch builder stage.
//!
//! Turns a bucket of document ids into byte-bounded batches of index
//! operations. Documents that cannot be loaded are dropped here and
//! accounted for by a count-only shortfall record, so downstream counts
//! always add up to the declared bucket size.

use std::sync::Arc;

use bulk_stream::{Computation, ComputationContext, ComputationMetadata, Record, StreamError};
use bulk_types::{
    BulkBucket, BulkCommand, BulkStatusDelta, Codec, CommandStore, DataBucket, IndexActionSettings,
    JsonCodec,
};
use tracing::{debug, info, warn};

use crate::admin::IndexAdmin;
use crate::document::DocumentSource;
use crate::error::IndexingError;
use crate::operation::{IndexBatch, IndexOperation, PipelineCodec};
use crate::topology::{ACTION_STREAM, BATCH_STREAM, BUILDER_NODE, STATUS_STREAM};

/// Suffix of the shortfall record key.
pub const MISSING_SUFFIX: &str = "missing";

/// Configuration of the batch builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuilderConfig {
    /// Maximum serialized size of one batch
    pub max_bytes: usize,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self { max_bytes: 900_000 }
    }
}

impl BuilderConfig {
    pub fn from_settings(settings: &IndexActionSettings) -> Self {
        Self {
            max_bytes: settings.batch_max_bytes,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: usize) -> Self {
        self.max_bytes = max_bytes;
        self
    }
}

/// A batch closed by the accumulator.
#[derive(Debug, Clone, PartialEq)]
pub struct SealedBatch {
    pub operations: Vec<IndexOperation>,
    /// Serialized size of the whole [`IndexBatch`], envelope included
    pub size_bytes: usize,
}

impl Default for SealedBatch {
    fn default() -> Self {
        Self {
            operations: Vec::new(),
            size_bytes: IndexBatch::ENVELOPE_BYTES,
        }
    }
}

/// Splits one bucket's operations into batches under a byte ceiling.
///
/// An operation larger than the ceiling on its own gets a batch of its
/// own. State is reset by [`start`](Self::start) and handed out by
/// [`finish`](Self::finish); nothing carries over between buckets.
#[derive(Debug)]
pub struct RequestAccumulator {
    max_bytes: usize,
    bucket_key: String,
    current: SealedBatch,
    sealed: Vec<SealedBatch>,
}

impl RequestAccumulator {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            bucket_key: String::new(),
            current: SealedBatch::default(),
            sealed: Vec::new(),
        }
    }

    /// Begin a new bucket, discarding anything left from a previous one.
    pub fn start(&mut self, bucket_key: &str) {
        self.bucket_key = bucket_key.to_string();
        self.current = SealedBatch::default();
        self.sealed.clear();
    }

    /// Add an operation whose serialized size is `size`.
    ///
    /// Sizes are checked against the batch as it will be encoded, so the
    /// envelope and separators count toward the ceiling.
    pub fn add(&mut self, operation: IndexOperation, size: usize) {
        if IndexBatch::ENVELOPE_BYTES + size > self.max_bytes {
            warn!(
                bucket = %self.bucket_key,
                id = %operation.id,
                size,
                max_bytes = self.max_bytes,
                "Operation exceeds batch ceiling, sending it alone"
            );
        }
        if !self.current.operations.is_empty()
            && self.current.size_bytes + IndexBatch::SEPARATOR_BYTES + size > self.max_bytes
        {
            self.seal();
        }
        if !self.current.operations.is_empty() {
            self.current.size_bytes += IndexBatch::SEPARATOR_BYTES;
        }
        self.current.size_bytes += size;
        self.current.operations.push(operation);
    }

    /// Seal what remains and return every batch of the bucket.
    ///
    /// A bucket with no operations still yields one empty batch.
    pub fn finish(&mut self) -> Vec<SealedBatch> {
        if !self.current.operations.is_empty() || self.sealed.is_empty() {
            self.seal();
        }
        std::mem::take(&mut self.sealed)
    }

    fn seal(&mut self) {
        let batch = std::mem::take(&mut self.current);
        debug!(
            bucket = %self.bucket_key,
            operations = batch.operations.len(),
            bytes = batch.size_bytes,
            "Sealed batch"
        );
        self.sealed.push(batch);
    }
}

/// Stage consuming [`BulkBucket`] records and producing indexing
/// [`DataBucket`] records.
pub struct BuildIndexRequests<C = JsonCodec> {
    meta: ComputationMetadata,
    codec: C,
    store: Arc<dyn CommandStore>,
    documents: Arc<dyn DocumentSource>,
    admin: Arc<dyn IndexAdmin>,
    accumulator: RequestAccumulator,
}

impl BuildIndexRequests<JsonCodec> {
    pub fn new(
        config: BuilderConfig,
        store: Arc<dyn CommandStore>,
        documents: Arc<dyn DocumentSource>,
        admin: Arc<dyn IndexAdmin>,
    ) -> Self {
        Self::with_codec(config, JsonCodec, store, documents, admin)
    }
}

impl<C: PipelineCodec> BuildIndexRequests<C> {
    pub fn with_codec(
        config: BuilderConfig,
        codec: C,
        store: Arc<dyn CommandStore>,
        documents: Arc<dyn DocumentSource>,
        admin: Arc<dyn IndexAdmin>,
    ) -> Self {
        Self {
            meta: ComputationMetadata::new(BUILDER_NODE)
                .with_input(ACTION_STREAM)
                .with_output(BATCH_STREAM)
                .with_output(STATUS_STREAM),
            codec,
            store,
            documents,
            admin,
            accumulator: RequestAccumulator::new(config.max_bytes),
        }
    }

    fn resolve_index(&self, command: &BulkCommand) -> Result<String, IndexingError> {
        match command.index_name() {
            Some(name) => Ok(name.to_string()),
            None => self.admin.write_index_name(&command.repository),
        }
    }

    fn load_operations(
        &mut self,
        bucket_key: &str,
        command: &BulkCommand,
        index: &str,
        ids: &[String],
    ) -> Result<u64, IndexingError> {
        self.accumulator.start(bucket_key);
        let mut included = 0;
        for id in ids {
            let document = match self.documents.load(&command.repository, id) {
                Ok(Some(document)) => document,
                Ok(None) => {
                    debug!(command_id = %command.id, id = %id, "Document not found, skipping");
                    continue;
                }
                Err(e) => {
                    warn!(command_id = %command.id, id = %id, error = %e, "Cannot load document, skipping");
                    continue;
                }
            };
            let operation = IndexOperation::from_document(index, document);
            let size = operation.encoded_size()?;
            self.accumulator.add(operation, size);
            included += 1;
        }
        Ok(included)
    }

    fn publish_processed(
        &self,
        ctx: &mut dyn ComputationContext,
        command_id: &str,
        processed: u64,
    ) -> Result<(), IndexingError> {
        let delta = BulkStatusDelta::processed(command_id, processed);
        let data = Codec::<BulkStatusDelta>::encode(&self.codec, &delta)?;
        ctx.produce_record(STATUS_STREAM, Record::new(command_id, data));
        Ok(())
    }

    fn emit_shortfall(
        &self,
        ctx: &mut dyn ComputationContext,
        bucket_key: &str,
        command_id: &str,
        missing: u64,
    ) -> Result<(), IndexingError> {
        debug!(command_id, bucket = bucket_key, missing, "Emitting shortfall record");
        let bucket = DataBucket::count_only(command_id, missing);
        let data = Codec::<DataBucket>::encode(&self.codec, &bucket)?;
        ctx.produce_record(
            BATCH_STREAM,
            Record::new(format!("{bucket_key}-{MISSING_SUFFIX}"), data),
        );
        Ok(())
    }

    fn build(
        &mut self,
        ctx: &mut dyn ComputationContext,
        bucket_key: &str,
        bucket: BulkBucket,
    ) -> Result<(), IndexingError> {
        let declared = bucket.size();

        let Some(command) = self.store.get_command(&bucket.command_id)? else {
            warn!(
                command_id = %bucket.command_id,
                bucket = bucket_key,
                "Command not found, accounting bucket as missing"
            );
            self.publish_processed(ctx, &bucket.command_id, declared)?;
            if declared > 0 {
                self.emit_shortfall(ctx, bucket_key, &bucket.command_id, declared)?;
            }
            return Ok(());
        };

        let index = self.resolve_index(&command)?;
        let included = self.load_operations(bucket_key, &command, &index, &bucket.ids)?;
        let batches = self.accumulator.finish();

        self.publish_processed(ctx, &command.id, declared)?;

        let batch_count = batches.len();
        for (i, batch) in batches.into_iter().enumerate() {
            let count = batch.operations.len() as u64;
            let payload =
                Codec::<IndexBatch>::encode(&self.codec, &IndexBatch::new(batch.operations))?;
            let data = Codec::<DataBucket>::encode(
                &self.codec,
                &DataBucket::new(&command.id, count, payload),
            )?;
            ctx.produce_record(BATCH_STREAM, Record::new(format!("{bucket_key}-{i}"), data));
        }

        if included < declared {
            self.emit_shortfall(ctx, bucket_key, &command.id, declared - included)?;
        }

        info!(
            command_id = %command.id,
            bucket = bucket_key,
            index = %index,
            declared,
            included,
            batches = batch_count,
            "Built index requests"
        );
        Ok(())
    }
}

impl<C: PipelineCodec> Computation for BuildIndexRequests<C> {
    fn metadata(&self) -> &ComputationMetadata {
        &self.meta
    }

    fn process_record(
        &mut self,
        ctx: &mut dyn ComputationContext,
        _input_stream: &str,
        record: Record,
    ) -> Result<(), StreamError> {
        let bucket = Codec::<BulkBucket>::decode(&self.codec, &record.data)
            .map_err(IndexingError::from)?;
        self.build(ctx, &record.key, bucket)?;
        ctx.ask_for_checkpoint();
        Ok(())
    }
}
