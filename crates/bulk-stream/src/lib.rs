//! Hosting-runtime abstractions for bulk pipeline stages.
//!
//! The runtime that delivers records, fires timers and commits offsets is
//! external. Stages are written against the traits here:
//!
//! - [`Record`]: a keyed, opaque message on a named stream
//! - [`Computation`]: a single-threaded stage driven by records and timers
//! - [`ComputationContext`]: what a stage may do in response (produce,
//!   set timers, ask for a checkpoint)
//! - [`Topology`]: named stages wired by named streams
//! - [`StreamCheckpoint`]: the committed read offset of a stage input
//! - [`MemoryContext`]: an in-process context for tests and local runs

pub mod checkpoint;
pub mod computation;
pub mod error;
pub mod memory;
pub mod record;
pub mod topology;

pub use checkpoint::StreamCheckpoint;
pub use computation::{Computation, ComputationContext, ComputationMetadata};
pub use error::StreamError;
pub use memory::MemoryContext;
pub use record::Record;
pub use topology::{partition_for, NodeDecl, StreamBinding, StreamDecl, Topology, TopologyBuilder};
