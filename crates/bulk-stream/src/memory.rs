//! In-process computation context.
//!
//! Records produced, timers set and checkpoint requests are kept in memory
//! so tests and local runs can drive a stage and inspect what it did.

use std::collections::BTreeMap;

use tracing::debug;

use crate::checkpoint::StreamCheckpoint;
use crate::computation::{Computation, ComputationContext};
use crate::error::StreamError;
use crate::record::Record;

/// Context hosting one stage reading one input stream.
#[derive(Debug)]
pub struct MemoryContext {
    input_stream: String,
    checkpoint: StreamCheckpoint,
    consumed: u64,
    produced: Vec<(String, Record)>,
    timers: BTreeMap<String, i64>,
    checkpoint_requested: bool,
    clock_ms: Option<i64>,
}

impl MemoryContext {
    pub fn new(computation: impl Into<String>, input_stream: impl Into<String>) -> Self {
        let input_stream = input_stream.into();
        Self {
            checkpoint: StreamCheckpoint::new(computation, input_stream.clone()),
            input_stream,
            consumed: 0,
            produced: Vec::new(),
            timers: BTreeMap::new(),
            checkpoint_requested: false,
            clock_ms: None,
        }
    }

    /// Use a fixed clock instead of wall time.
    pub fn with_clock(mut self, now_ms: i64) -> Self {
        self.clock_ms = Some(now_ms);
        self
    }

    /// Move the fixed clock forward.
    pub fn advance_clock(&mut self, delta_ms: i64) {
        let now = self.now_ms();
        self.clock_ms = Some(now + delta_ms);
    }

    /// Deliver one record from the input stream, then commit if the stage asked.
    pub fn deliver(
        &mut self,
        computation: &mut dyn Computation,
        record: Record,
    ) -> Result<(), StreamError> {
        self.consumed += 1;
        let stream = self.input_stream.clone();
        computation.process_record(self, &stream, record)?;
        self.commit_if_requested();
        Ok(())
    }

    /// Fire every timer due at the current clock, then commit if the stage asked.
    ///
    /// Timers re-armed by the stage during this call are kept for the next one.
    pub fn fire_due_timers(&mut self, computation: &mut dyn Computation) -> Result<usize, StreamError> {
        let now = self.now_ms();
        let due: Vec<(String, i64)> = self
            .timers
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(k, at)| (k.clone(), *at))
            .collect();
        for (key, _) in &due {
            self.timers.remove(key);
        }
        for (key, at) in &due {
            computation.process_timer(self, key, *at)?;
            self.commit_if_requested();
        }
        Ok(due.len())
    }

    /// Fire every pending timer regardless of the clock.
    pub fn fire_all_timers(&mut self, computation: &mut dyn Computation) -> Result<usize, StreamError> {
        let latest = self.timers.values().copied().max();
        if let Some(at) = latest {
            if at > self.now_ms() {
                self.clock_ms = Some(at);
            }
        }
        self.fire_due_timers(computation)
    }

    /// Commit the consumed offset if a checkpoint was requested.
    pub fn commit_if_requested(&mut self) -> Option<u64> {
        if !self.checkpoint_requested {
            return None;
        }
        self.checkpoint_requested = false;
        if self.checkpoint.advance(self.consumed) {
            debug!(
                computation = %self.checkpoint.computation,
                offset = self.checkpoint.offset,
                "Checkpoint committed"
            );
        }
        Some(self.checkpoint.offset)
    }

    pub fn checkpoint(&self) -> &StreamCheckpoint {
        &self.checkpoint
    }

    /// Records delivered so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn produced(&self) -> &[(String, Record)] {
        &self.produced
    }

    /// Records produced on one stream, in order.
    pub fn records(&self, stream: &str) -> Vec<&Record> {
        self.produced
            .iter()
            .filter(|(s, _)| s == stream)
            .map(|(_, r)| r)
            .collect()
    }

    pub fn take_produced(&mut self) -> Vec<(String, Record)> {
        std::mem::take(&mut self.produced)
    }

    pub fn timer(&self, key: &str) -> Option<i64> {
        self.timers.get(key).copied()
    }

    pub fn pending_timers(&self) -> usize {
        self.timers.len()
    }
}

impl ComputationContext for MemoryContext {
    fn produce_record(&mut self, stream: &str, record: Record) {
        self.produced.push((stream.to_string(), record));
    }

    fn set_timer(&mut self, key: &str, fire_at_ms: i64) {
        self.timers.insert(key.to_string(), fire_at_ms);
    }

    fn ask_for_checkpoint(&mut self) {
        self.checkpoint_requested = true;
    }

    fn now_ms(&self) -> i64 {
        self.clock_ms
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::computation::ComputationMetadata;

    // Echoes records and checkpoints every other one
    struct Echo {
        meta: ComputationMetadata,
        seen: usize,
        ticks: usize,
    }

    impl Echo {
        fn new() -> Self {
            Self {
                meta: ComputationMetadata::new("echo").with_input("in").with_output("out"),
                seen: 0,
                ticks: 0,
            }
        }
    }

    impl Computation for Echo {
        fn metadata(&self) -> &ComputationMetadata {
            &self.meta
        }

        fn init(&mut self, ctx: &mut dyn ComputationContext) -> Result<(), StreamError> {
            let at = ctx.now_ms() + 1_000;
            ctx.set_timer("tick", at);
            Ok(())
        }

        fn process_record(
            &mut self,
            ctx: &mut dyn ComputationContext,
            _input_stream: &str,
            record: Record,
        ) -> Result<(), StreamError> {
            self.seen += 1;
            ctx.produce_record("out", record);
            if self.seen % 2 == 0 {
                ctx.ask_for_checkpoint();
            }
            Ok(())
        }

        fn process_timer(
            &mut self,
            ctx: &mut dyn ComputationContext,
            key: &str,
            timestamp_ms: i64,
        ) -> Result<(), StreamError> {
            self.ticks += 1;
            ctx.set_timer(key, timestamp_ms + 1_000);
            Ok(())
        }
    }

    #[test]
    fn test_deliver_and_checkpoint() {
        let mut echo = Echo::new();
        let mut ctx = MemoryContext::new("echo", "in").with_clock(0);
        echo.init(&mut ctx).unwrap();

        ctx.deliver(&mut echo, Record::new("a", b"1".to_vec())).unwrap();
        assert_eq!(ctx.checkpoint().offset, 0);
        ctx.deliver(&mut echo, Record::new("b", b"2".to_vec())).unwrap();
        assert_eq!(ctx.checkpoint().offset, 2);
        ctx.deliver(&mut echo, Record::new("c", b"3".to_vec())).unwrap();
        assert_eq!(ctx.checkpoint().offset, 2);

        assert_eq!(ctx.records("out").len(), 3);
        assert_eq!(ctx.consumed(), 3);
    }

    #[test]
    fn test_timers_fire_when_due() {
        let mut echo = Echo::new();
        let mut ctx = MemoryContext::new("echo", "in").with_clock(0);
        echo.init(&mut ctx).unwrap();

        assert_eq!(ctx.fire_due_timers(&mut echo).unwrap(), 0);
        ctx.advance_clock(1_000);
        assert_eq!(ctx.fire_due_timers(&mut echo).unwrap(), 1);
        assert_eq!(echo.ticks, 1);
        // Re-armed for the next interval
        assert_eq!(ctx.timer("tick"), Some(2_000));

        assert_eq!(ctx.fire_all_timers(&mut echo).unwrap(), 1);
        assert_eq!(echo.ticks, 2);
    }
}
