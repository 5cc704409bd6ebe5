//! # bulk-indexing
//!
//! The bulk index action: turns a command over an arbitrarily large
//! document set into size-bounded write requests against a search index.
//!
//! Three stages, each a [`Computation`](bulk_stream::Computation):
//!
//! - [`BuildIndexRequests`]: loads the documents of a bucket of ids and
//!   splits their index operations into byte-bounded batches
//! - [`BulkIndexSubmitter`]: feeds batches to a synchronous
//!   [`BulkProcessor`], checkpointing only after a completed flush, and
//!   stops the pipeline on non-tolerated failures
//! - [`IndexCompletionReactor`]: refreshes the index and swaps the search
//!   alias when a command completes
//!
//! The document repository, index administration and the index itself are
//! reached through [`DocumentSource`], [`IndexAdmin`] and [`BulkSink`].
//! In-memory implementations back tests and local runs.

pub mod abort;
pub mod admin;
pub mod builder;
pub mod document;
pub mod error;
pub mod operation;
pub mod processor;
pub mod reactor;
pub mod sink;
pub mod submitter;
pub mod topology;

pub use abort::{report_channel, AbortLatch, FailureReport, ReportReceiver, ReportSender};
pub use admin::{IndexAdmin, MemoryIndexAdmin};
pub use builder::{BuildIndexRequests, BuilderConfig, RequestAccumulator, SealedBatch};
pub use document::{Document, DocumentSource, MemoryDocumentSource};
pub use error::IndexingError;
pub use operation::{IndexBatch, IndexOperation, PipelineCodec};
pub use processor::{BulkListener, BulkProcessor, BulkProcessorConfig, RetryPolicy};
pub use reactor::IndexCompletionReactor;
pub use sink::{
    BulkItem, BulkItemResponse, BulkRequest, BulkResponse, BulkSink, FailureKind, ItemFailure,
    MemorySink, SinkError,
};
pub use submitter::{
    BulkIndexSubmitter, SubmitterConfig, SubmitterState, FLUSH_TIMER, INDEXING_ERRORS_RESULT,
    VERSION_CONFLICTS_RESULT,
};
pub use topology::{
    index_action_topology, Collaborators, IndexActionStages, ACTION_STREAM, BATCH_STREAM,
    BUILDER_NODE, DONE_STREAM, REACTOR_NODE, STATUS_STREAM, SUBMITTER_NODE,
};
