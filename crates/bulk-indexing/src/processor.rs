//! Synchronous bulk submission buffer.
//!
//! [`BulkProcessor`] accumulates operations and submits them to a
//! [`BulkSink`] when a count or byte threshold is reached or when the
//! owner calls [`BulkProcessor::flush`]. It runs with zero concurrency:
//! the submission happens on a dedicated worker thread while the caller
//! blocks until it completes, so a slow sink slows the caller down.
//!
//! Listener callbacks run on the worker thread, never on the caller's.
//! The blocking calls rely on tokio's `blocking_*` channel methods and
//! must not be made from inside an async runtime.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::IndexingError;
use crate::sink::{BulkItem, BulkRequest, BulkResponse, BulkSink, SinkError};

/// Retry policy for retryable sink errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry; later delays grow exponentially
    pub initial_delay: Duration,
    /// Number of retries after the first attempt
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    pub fn new(initial_delay: Duration, max_retries: u32) -> Self {
        Self {
            initial_delay,
            max_retries,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(Duration::ZERO, 0)
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_delay,
            current_interval: self.initial_delay,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Thresholds and retry policy of a [`BulkProcessor`].
#[derive(Debug, Clone)]
pub struct BulkProcessorConfig {
    /// Name of the worker thread
    pub name: String,
    /// Flush once this many operations are pending
    pub bulk_actions: usize,
    /// Flush once pending operations reach this many bytes
    pub bulk_size_bytes: usize,
    pub retry: RetryPolicy,
}

impl Default for BulkProcessorConfig {
    fn default() -> Self {
        Self {
            name: "bulk-processor".to_string(),
            bulk_actions: 1_000,
            bulk_size_bytes: 5_242_880,
            retry: RetryPolicy::default(),
        }
    }
}

impl BulkProcessorConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_bulk_actions(mut self, actions: usize) -> Self {
        self.bulk_actions = actions;
        self
    }

    pub fn with_bulk_size_bytes(mut self, bytes: usize) -> Self {
        self.bulk_size_bytes = bytes;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Callbacks around each submission. Invoked on the worker thread.
pub trait BulkListener: Send + Sync {
    fn before_bulk(&self, execution_id: u64, request: &BulkRequest);

    fn after_bulk(&self, execution_id: u64, request: &BulkRequest, response: &BulkResponse);

    fn after_bulk_failure(&self, execution_id: u64, request: &BulkRequest, error: &SinkError);
}

struct FlushJob {
    execution_id: u64,
    request: BulkRequest,
    done: oneshot::Sender<()>,
}

/// Single-flight, blocking submission buffer.
pub struct BulkProcessor {
    config: BulkProcessorConfig,
    pending: BulkRequest,
    next_execution_id: u64,
    jobs: Option<mpsc::Sender<FlushJob>>,
    worker: Option<JoinHandle<()>>,
}

impl BulkProcessor {
    /// Start the worker thread.
    pub fn new(
        config: BulkProcessorConfig,
        sink: Arc<dyn BulkSink>,
        listener: Arc<dyn BulkListener>,
    ) -> Result<Self, IndexingError> {
        let (tx, mut rx) = mpsc::channel::<FlushJob>(1);
        let retry = config.retry;

        let worker = std::thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || {
                while let Some(job) = rx.blocking_recv() {
                    execute(job, sink.as_ref(), listener.as_ref(), retry);
                }
                debug!("Bulk processor worker stopped");
            })
            .map_err(|e| IndexingError::Processor(e.to_string()))?;

        Ok(Self {
            config,
            pending: BulkRequest::default(),
            next_execution_id: 0,
            jobs: Some(tx),
            worker: Some(worker),
        })
    }

    /// Queue an operation, flushing first if a threshold is reached.
    pub fn add(&mut self, item: BulkItem) -> Result<(), IndexingError> {
        if self.jobs.is_none() {
            return Err(IndexingError::Processor("bulk processor is closed".to_string()));
        }
        self.pending.push(item);
        if self.pending.len() >= self.config.bulk_actions
            || self.pending.size_bytes >= self.config.bulk_size_bytes
        {
            debug!(
                actions = self.pending.len(),
                bytes = self.pending.size_bytes,
                "Bulk threshold reached"
            );
            self.flush()?;
        }
        Ok(())
    }

    /// Submit pending operations and wait for the outcome to be delivered
    /// to the listener.
    pub fn flush(&mut self) -> Result<(), IndexingError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| IndexingError::Processor("bulk processor is closed".to_string()))?;

        self.next_execution_id += 1;
        let (done_tx, done_rx) = oneshot::channel();
        let job = FlushJob {
            execution_id: self.next_execution_id,
            request: std::mem::take(&mut self.pending),
            done: done_tx,
        };

        jobs.blocking_send(job)
            .map_err(|_| IndexingError::Processor("bulk processor worker is gone".to_string()))?;
        done_rx
            .blocking_recv()
            .map_err(|_| IndexingError::Processor("bulk processor worker died".to_string()))
    }

    /// Number of operations waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Flush and stop the worker. Idempotent.
    pub fn close(&mut self) -> Result<(), IndexingError> {
        let flushed = self.flush();
        self.stop();
        flushed
    }

    fn stop(&mut self) {
        // Dropping the sender ends the worker loop
        self.jobs = None;
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!(name = %self.config.name, "Bulk processor worker panicked");
            }
        }
    }
}

impl Drop for BulkProcessor {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "Failed to close bulk processor");
        }
    }
}

fn execute(job: FlushJob, sink: &dyn BulkSink, listener: &dyn BulkListener, retry: RetryPolicy) {
    let FlushJob {
        execution_id,
        request,
        done,
    } = job;

    listener.before_bulk(execution_id, &request);
    let start = Instant::now();
    match submit_with_retry(sink, &request, retry) {
        Ok(response) => {
            info!(
                execution_id,
                actions = request.len(),
                bytes = request.size_bytes,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Bulk request submitted"
            );
            listener.after_bulk(execution_id, &request, &response);
        }
        Err(e) => listener.after_bulk_failure(execution_id, &request, &e),
    }
    // The caller may have given up waiting
    let _ = done.send(());
}

fn submit_with_retry(
    sink: &dyn BulkSink,
    request: &BulkRequest,
    retry: RetryPolicy,
) -> Result<BulkResponse, SinkError> {
    let mut backoff = retry.backoff();
    let mut retries = 0;

    loop {
        match sink.submit(request) {
            Ok(response) => return Ok(response),
            Err(e) if e.is_retryable() && retries < retry.max_retries => {
                retries += 1;
                let delay = backoff.next_backoff().unwrap_or(retry.initial_delay);
                warn!(
                    error = %e,
                    retry = retries,
                    retry_in_ms = delay.as_millis() as u64,
                    "Bulk request rejected, retrying"
                );
                std::thread::sleep(delay);
            }
            Err(e) => {
                error!(error = %e, retries, "Bulk request failed");
                return Err(e);
            }
        }
    }
}
