//! Bulk submitter stage.
//!
//! Feeds decoded batches into a [`BulkProcessor`] and commits its input
//! only after a flush on the periodic timer has completed. Failures are
//! reported by the processor's worker thread through an [`AbortLatch`]
//! and a bounded report channel; the processing thread checks the latch
//! before every record and timer tick.
//!
//! ```text
//! active ──(latch tripped)──> draining ──(timer tick)──> terminated
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use bulk_stream::{Computation, ComputationContext, ComputationMetadata, Record, StreamError};
use bulk_types::{BulkStatusDelta, Codec, DataBucket, IndexActionSettings, JsonCodec};
use tracing::{debug, error, info, warn};

use crate::abort::{
    report_channel, AbortLatch, FailureReport, ReportReceiver, ReportSender,
    REPORT_CHANNEL_CAPACITY,
};
use crate::error::IndexingError;
use crate::operation::{IndexBatch, PipelineCodec};
use crate::processor::{BulkListener, BulkProcessor, BulkProcessorConfig, RetryPolicy};
use crate::sink::{BulkItem, BulkRequest, BulkResponse, BulkSink, FailureKind, SinkError};
use crate::topology::{BATCH_STREAM, STATUS_STREAM, SUBMITTER_NODE};

/// Key of the periodic flush timer.
pub const FLUSH_TIMER: &str = "flush";

/// Status result key counting tolerated version conflicts.
pub const VERSION_CONFLICTS_RESULT: &str = "versionConflicts";

/// Status result key counting escalated indexing errors.
pub const INDEXING_ERRORS_RESULT: &str = "indexingErrors";

/// Configuration of the bulk submitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitterConfig {
    /// Flush once this many operations are pending
    pub bulk_actions: usize,
    /// Flush once pending operations reach this many bytes
    pub bulk_size_bytes: usize,
    /// Period of the flush-and-checkpoint timer
    pub flush_interval: Duration,
    pub retry: RetryPolicy,
    /// Keep going after non-tolerated failures instead of aborting
    pub continue_on_failure: bool,
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            bulk_actions: 1_000,
            bulk_size_bytes: 5_242_880,
            flush_interval: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            continue_on_failure: false,
        }
    }
}

impl SubmitterConfig {
    pub fn from_settings(settings: &IndexActionSettings) -> Self {
        Self {
            bulk_actions: settings.bulk_actions,
            bulk_size_bytes: settings.bulk_size_bytes,
            flush_interval: settings.flush_interval(),
            retry: RetryPolicy::new(settings.retry_delay(), settings.max_retries),
            continue_on_failure: settings.continue_on_failure,
        }
    }

    pub fn with_bulk_actions(mut self, actions: usize) -> Self {
        self.bulk_actions = actions;
        self
    }

    pub fn with_bulk_size_bytes(mut self, bytes: usize) -> Self {
        self.bulk_size_bytes = bytes;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_continue_on_failure(mut self, continue_on_failure: bool) -> Self {
        self.continue_on_failure = continue_on_failure;
        self
    }
}

/// Lifecycle of a submitter instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitterState {
    /// Accepting records
    Active,
    /// A failure tripped the latch; records are dropped
    Draining,
    /// The stage raised a fatal error and must be torn down
    Terminated,
}

/// Maps processor outcomes onto the latch and the report channel.
struct SubmitListener {
    latch: AbortLatch,
    reports: ReportSender,
    continue_on_failure: bool,
}

impl SubmitListener {
    fn escalate(&self, execution_id: u64) {
        if self.continue_on_failure {
            return;
        }
        if self.latch.trip() {
            error!(execution_id, "Aborting bulk indexing after failure");
        }
    }

    fn post_counts(&self, counts: BTreeMap<(String, FailureKind), u64>) {
        for ((command_id, kind), count) in counts {
            self.reports.post(FailureReport {
                command_id,
                kind,
                count,
            });
        }
    }
}

impl BulkListener for SubmitListener {
    fn before_bulk(&self, execution_id: u64, request: &BulkRequest) {
        debug!(
            execution_id,
            actions = request.len(),
            bytes = request.size_bytes,
            "Submitting bulk request"
        );
    }

    fn after_bulk(&self, execution_id: u64, request: &BulkRequest, response: &BulkResponse) {
        if !response.has_failures() {
            return;
        }

        let mut counts: BTreeMap<(String, FailureKind), u64> = BTreeMap::new();
        let mut escalated = false;
        for (item, outcome) in request.items.iter().zip(&response.items) {
            let Some(failure) = &outcome.failure else {
                continue;
            };
            match failure.kind {
                FailureKind::VersionConflict => {
                    debug!(
                        command_id = %item.command_id,
                        id = %outcome.id,
                        message = %failure.message,
                        "Version conflict ignored"
                    );
                }
                FailureKind::Other => {
                    error!(
                        command_id = %item.command_id,
                        id = %outcome.id,
                        message = %failure.message,
                        "Failed to index document"
                    );
                    escalated = true;
                }
            }
            *counts
                .entry((item.command_id.clone(), failure.kind))
                .or_default() += 1;
        }

        self.post_counts(counts);
        if escalated {
            self.escalate(execution_id);
        }
    }

    fn after_bulk_failure(&self, execution_id: u64, request: &BulkRequest, error: &SinkError) {
        error!(
            execution_id,
            actions = request.len(),
            error = %error,
            "Bulk request failed"
        );

        let mut counts: BTreeMap<(String, FailureKind), u64> = BTreeMap::new();
        for item in &request.items {
            *counts
                .entry((item.command_id.clone(), FailureKind::Other))
                .or_default() += 1;
        }
        self.post_counts(counts);
        self.escalate(execution_id);
    }
}

/// Stage consuming indexing [`DataBucket`] records and writing them to a
/// [`BulkSink`].
pub struct BulkIndexSubmitter<C = JsonCodec> {
    meta: ComputationMetadata,
    config: SubmitterConfig,
    codec: C,
    sink: Arc<dyn BulkSink>,
    state: SubmitterState,
    latch: AbortLatch,
    reports: Option<ReportReceiver>,
    processor: Option<BulkProcessor>,
    updates: bool,
}

impl BulkIndexSubmitter<JsonCodec> {
    pub fn new(config: SubmitterConfig, sink: Arc<dyn BulkSink>) -> Self {
        Self::with_codec(config, JsonCodec, sink)
    }
}

impl<C: PipelineCodec> BulkIndexSubmitter<C> {
    pub fn with_codec(config: SubmitterConfig, codec: C, sink: Arc<dyn BulkSink>) -> Self {
        Self {
            meta: ComputationMetadata::new(SUBMITTER_NODE)
                .with_input(BATCH_STREAM)
                .with_output(STATUS_STREAM),
            config,
            codec,
            sink,
            state: SubmitterState::Active,
            latch: AbortLatch::new(),
            reports: None,
            processor: None,
            updates: false,
        }
    }

    pub fn state(&self) -> SubmitterState {
        self.state
    }

    /// Latch of the current instance lifetime.
    pub fn latch(&self) -> &AbortLatch {
        &self.latch
    }

    /// Operations added but not yet flushed.
    pub fn pending(&self) -> usize {
        self.processor.as_ref().map_or(0, BulkProcessor::pending)
    }

    fn processor(&mut self) -> Result<&mut BulkProcessor, IndexingError> {
        self.processor
            .as_mut()
            .ok_or_else(|| IndexingError::Processor("submitter not initialized".to_string()))
    }

    fn arm_timer(&self, ctx: &mut dyn ComputationContext) {
        let interval_ms = i64::try_from(self.config.flush_interval.as_millis()).unwrap_or(i64::MAX);
        let fire_at = ctx.now_ms().saturating_add(interval_ms);
        ctx.set_timer(FLUSH_TIMER, fire_at);
    }

    /// Move to draining if the latch has been tripped. Returns true when
    /// the stage is no longer active.
    fn check_latch(&mut self) -> bool {
        if self.latch.is_tripped() {
            if self.state == SubmitterState::Active {
                warn!(name = %self.meta.name, "Bulk submitter draining");
                self.state = SubmitterState::Draining;
            }
            return true;
        }
        false
    }

    /// Publish failure reports as result-only status deltas.
    fn publish_reports(&mut self, ctx: &mut dyn ComputationContext) -> Result<(), IndexingError> {
        let Some(receiver) = self.reports.as_mut() else {
            return Ok(());
        };
        let reports = receiver.drain();
        if reports.is_empty() {
            return Ok(());
        }

        let mut per_command: BTreeMap<String, (u64, u64)> = BTreeMap::new();
        for report in reports {
            let entry = per_command.entry(report.command_id).or_default();
            match report.kind {
                FailureKind::VersionConflict => entry.0 += report.count,
                FailureKind::Other => entry.1 += report.count,
            }
        }

        for (command_id, (conflicts, errors)) in per_command {
            let mut delta = BulkStatusDelta::processed(&command_id, 0);
            if conflicts > 0 {
                delta = delta.with_result(VERSION_CONFLICTS_RESULT, conflicts);
            }
            if errors > 0 {
                delta = delta.with_result(INDEXING_ERRORS_RESULT, errors);
            }
            let data = Codec::<BulkStatusDelta>::encode(&self.codec, &delta)?;
            ctx.produce_record(STATUS_STREAM, Record::new(command_id, data));
        }
        Ok(())
    }

    fn submit(&mut self, key: &str, bucket: DataBucket) -> Result<(), IndexingError> {
        if bucket.is_count_only() {
            debug!(
                command_id = %bucket.command_id,
                bucket = key,
                count = bucket.count,
                "Count-only bucket, nothing to submit"
            );
            // Still consumed, so the next tick commits past it
            self.updates = true;
            return Ok(());
        }

        let batch = Codec::<IndexBatch>::decode(&self.codec, &bucket.payload)?;
        debug!(
            command_id = %bucket.command_id,
            bucket = key,
            operations = batch.len(),
            "Adding operations"
        );
        for operation in batch.operations {
            let size = operation.encoded_size()?;
            self.processor()?.add(BulkItem {
                command_id: bucket.command_id.clone(),
                operation,
                size,
            })?;
            self.updates = true;
        }
        Ok(())
    }
}

impl<C: PipelineCodec> Computation for BulkIndexSubmitter<C> {
    fn metadata(&self) -> &ComputationMetadata {
        &self.meta
    }

    fn init(&mut self, ctx: &mut dyn ComputationContext) -> Result<(), StreamError> {
        let latch = AbortLatch::new();
        let (sender, receiver) = report_channel(REPORT_CHANNEL_CAPACITY);
        let listener = Arc::new(SubmitListener {
            latch: latch.clone(),
            reports: sender,
            continue_on_failure: self.config.continue_on_failure,
        });
        let processor_config = BulkProcessorConfig::default()
            .with_name(format!("{}-flusher", self.meta.name))
            .with_bulk_actions(self.config.bulk_actions)
            .with_bulk_size_bytes(self.config.bulk_size_bytes)
            .with_retry(self.config.retry);

        self.processor = Some(BulkProcessor::new(
            processor_config,
            self.sink.clone(),
            listener,
        )?);
        self.latch = latch;
        self.reports = Some(receiver);
        self.state = SubmitterState::Active;
        self.updates = false;
        self.arm_timer(ctx);

        info!(
            name = %self.meta.name,
            bulk_actions = self.config.bulk_actions,
            bulk_size_bytes = self.config.bulk_size_bytes,
            flush_interval_ms = self.config.flush_interval.as_millis() as u64,
            continue_on_failure = self.config.continue_on_failure,
            "Bulk submitter initialized"
        );
        Ok(())
    }

    fn process_record(
        &mut self,
        ctx: &mut dyn ComputationContext,
        _input_stream: &str,
        record: Record,
    ) -> Result<(), StreamError> {
        if self.check_latch() {
            debug!(bucket = %record.key, "Dropping record while draining");
            return Ok(());
        }
        self.publish_reports(ctx)?;

        let bucket = Codec::<DataBucket>::decode(&self.codec, &record.data)
            .map_err(IndexingError::from)?;
        self.submit(&record.key, bucket)?;
        Ok(())
    }

    fn process_timer(
        &mut self,
        ctx: &mut dyn ComputationContext,
        key: &str,
        _timestamp_ms: i64,
    ) -> Result<(), StreamError> {
        if key != FLUSH_TIMER {
            return Ok(());
        }
        if self.check_latch() {
            self.state = SubmitterState::Terminated;
            self.publish_reports(ctx)?;
            error!(name = %self.meta.name, "Bulk submitter terminated after failure");
            return Err(IndexingError::Aborted("bulk indexing failure".to_string()).into());
        }

        if self.updates {
            self.processor()?.flush()?;
            self.updates = false;
            self.publish_reports(ctx)?;
            if self.check_latch() {
                // Not committed; the next tick terminates the stage
                warn!(name = %self.meta.name, "Flush failed, skipping checkpoint");
            } else {
                ctx.ask_for_checkpoint();
            }
        } else {
            self.publish_reports(ctx)?;
        }

        self.arm_timer(ctx);
        Ok(())
    }

    fn destroy(&mut self) {
        let Some(mut processor) = self.processor.take() else {
            return;
        };
        // Closing performs the final flush, even after a failure
        if let Err(e) = processor.close() {
            error!(error = %e, "Failed to close bulk processor");
        }
        debug!(name = %self.meta.name, "Bulk submitter destroyed");
    }
}
