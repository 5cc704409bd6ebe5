//! Cross-thread failure handoff for the bulk submitter.
//!
//! The submission buffer reports outcomes from its own worker thread while
//! the submitter's state lives on the processing thread. Two primitives
//! bridge them:
//!
//! - [`AbortLatch`]: a one-way flag set by the worker on an escalated
//!   failure and checked by the processing thread before every record and
//!   timer tick
//! - [`FailureReport`] over a bounded tokio channel: per-command failure
//!   counts drained by the processing thread and published as status
//!   results

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use crate::sink::FailureKind;

/// Capacity of the failure report channel.
pub const REPORT_CHANNEL_CAPACITY: usize = 1024;

/// One-way latch shared between the submission worker and the submitter.
///
/// Once tripped it stays tripped; a new latch is created when the stage is
/// reinitialized.
#[derive(Debug, Clone, Default)]
pub struct AbortLatch {
    tripped: Arc<AtomicBool>,
}

impl AbortLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the latch. Returns true if this call tripped it.
    pub fn trip(&self) -> bool {
        self.tripped
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }
}

/// Failures of one command observed in one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    pub command_id: String,
    pub kind: FailureKind,
    pub count: u64,
}

/// Sending half used by the submission worker.
#[derive(Debug, Clone)]
pub struct ReportSender {
    tx: mpsc::Sender<FailureReport>,
}

impl ReportSender {
    /// Post a report without blocking the worker.
    ///
    /// A full channel drops the report; the abort latch is unaffected.
    pub fn post(&self, report: FailureReport) {
        if let Err(e) = self.tx.try_send(report) {
            warn!(error = %e, "Failure report dropped");
        }
    }
}

/// Receiving half drained by the processing thread.
#[derive(Debug)]
pub struct ReportReceiver {
    rx: mpsc::Receiver<FailureReport>,
}

impl ReportReceiver {
    /// Take every report posted so far.
    pub fn drain(&mut self) -> Vec<FailureReport> {
        let mut reports = Vec::new();
        while let Ok(report) = self.rx.try_recv() {
            reports.push(report);
        }
        reports
    }
}

/// Create a bounded report channel.
pub fn report_channel(capacity: usize) -> (ReportSender, ReportReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ReportSender { tx }, ReportReceiver { rx })
}
