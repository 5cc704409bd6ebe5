//! Stage contract.
//!
//! A [`Computation`] is driven by its host one call at a time: records are
//! delivered in partition order and timers fire on the same thread, so a
//! stage never needs locks for its own state.

use crate::error::StreamError;
use crate::record::Record;

/// Actions a stage may take while handling a record or a timer.
pub trait ComputationContext {
    /// Append a record to an output stream.
    fn produce_record(&mut self, stream: &str, record: Record);

    /// Register (or re-register) a timer firing at `fire_at_ms`.
    fn set_timer(&mut self, key: &str, fire_at_ms: i64);

    /// Request that the read offset be committed once the current call returns.
    fn ask_for_checkpoint(&mut self);

    /// Current host time in milliseconds since epoch.
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Static description of a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputationMetadata {
    pub name: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl ComputationMetadata {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn with_input(mut self, stream: impl Into<String>) -> Self {
        self.inputs.push(stream.into());
        self
    }

    pub fn with_output(mut self, stream: impl Into<String>) -> Self {
        self.outputs.push(stream.into());
        self
    }
}

/// A single-threaded pipeline stage.
pub trait Computation: Send {
    fn metadata(&self) -> &ComputationMetadata;

    /// Called once before any record or timer.
    fn init(&mut self, _ctx: &mut dyn ComputationContext) -> Result<(), StreamError> {
        Ok(())
    }

    fn process_record(
        &mut self,
        ctx: &mut dyn ComputationContext,
        input_stream: &str,
        record: Record,
    ) -> Result<(), StreamError>;

    fn process_timer(
        &mut self,
        _ctx: &mut dyn ComputationContext,
        _key: &str,
        _timestamp_ms: i64,
    ) -> Result<(), StreamError> {
        Ok(())
    }

    /// Release resources. Called once when the host tears the stage down.
    fn destroy(&mut self) {}
}
