//! # bulk-types
//!
//! Shared domain types for the bulk indexing pipeline.
//!
//! - [`BulkCommand`]: an immutable request to apply an action to a document set
//! - [`BulkStatus`] / [`BulkStatusDelta`]: command progress and its additive increments
//! - [`BulkBucket`] / [`DataBucket`]: records carried between pipeline stages
//! - [`BucketAggregator`]: per-command concatenation of data buckets
//! - [`Codec`]: pluggable record encoding (JSON by default)
//! - [`CommandStore`]: lookup of commands and statuses by id
//! - [`IndexActionSettings`]: layered configuration

pub mod bucket;
pub mod codec;
pub mod command;
pub mod config;
pub mod error;
pub mod status;
pub mod store;

pub use bucket::{BucketAggregator, BulkBucket, DataBucket};
pub use codec::{Codec, JsonCodec};
pub use command::{BulkCommand, INDEX_NAME_PARAM, REFRESH_PARAM, UPDATE_ALIAS_PARAM};
pub use config::IndexActionSettings;
pub use error::BulkError;
pub use status::{BulkState, BulkStatus, BulkStatusDelta};
pub use store::{CommandStore, MemoryCommandStore};
