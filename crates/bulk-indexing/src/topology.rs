//! Wiring of the index action.
//!
//! ```text
//! bulk/index ──> buildIndexRequests ──> bulk/bulkIndex ──> bulkIndex
//!                        │                                     │
//!                        └────────────> bulk/status <──────────┘
//!
//! bulk/done (filtered by action) ──> indexCompletion
//! ```
//!
//! `bulk/status` is folded into command statuses by the external status
//! aggregator, which republishes them on `bulk/done`.

use std::sync::Arc;

use bulk_stream::{NodeDecl, StreamBinding, StreamError, Topology};
use bulk_types::{BulkError, CommandStore, IndexActionSettings, JsonCodec};
use tracing::info;

use crate::admin::IndexAdmin;
use crate::builder::{BuildIndexRequests, BuilderConfig};
use crate::document::DocumentSource;
use crate::operation::PipelineCodec;
use crate::reactor::IndexCompletionReactor;
use crate::sink::BulkSink;
use crate::submitter::{BulkIndexSubmitter, SubmitterConfig};

/// Input of the action: one record per bucket of scrolled ids.
pub const ACTION_STREAM: &str = "bulk/index";

/// Indexing batches between the builder and the submitter.
pub const BATCH_STREAM: &str = "bulk/bulkIndex";

/// Status deltas of every action.
pub const STATUS_STREAM: &str = "bulk/status";

/// Aggregated command statuses.
pub const DONE_STREAM: &str = "bulk/done";

pub const BUILDER_NODE: &str = "buildIndexRequests";
pub const SUBMITTER_NODE: &str = "bulkIndex";
pub const REACTOR_NODE: &str = "indexCompletion";

/// Declare the streams and stages of the index action.
pub fn index_action_topology(settings: &IndexActionSettings) -> Result<Topology, StreamError> {
    Topology::builder()
        .stream(ACTION_STREAM, 1)
        .stream(BATCH_STREAM, settings.partitions)
        .stream(STATUS_STREAM, 1)
        .stream(DONE_STREAM, 1)
        .node(
            NodeDecl::new(BUILDER_NODE, 1)
                .input(StreamBinding::new(ACTION_STREAM))
                .output(StreamBinding::new(BATCH_STREAM))
                .output(StreamBinding::new(STATUS_STREAM)),
        )
        .node(
            NodeDecl::new(SUBMITTER_NODE, settings.partitions)
                .input(StreamBinding::new(BATCH_STREAM))
                .output(StreamBinding::new(STATUS_STREAM)),
        )
        .node(
            NodeDecl::new(REACTOR_NODE, 1)
                .input(StreamBinding::filtered(DONE_STREAM, settings.action_name.clone())),
        )
        .build()
}

/// External services the stages depend on.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn CommandStore>,
    pub documents: Arc<dyn DocumentSource>,
    pub admin: Arc<dyn IndexAdmin>,
    pub sink: Arc<dyn BulkSink>,
}

/// One instance of each stage, ready to be handed to a host.
pub struct IndexActionStages<C = JsonCodec> {
    pub builder: BuildIndexRequests<C>,
    pub submitter: BulkIndexSubmitter<C>,
    pub reactor: IndexCompletionReactor<C>,
}

impl IndexActionStages<JsonCodec> {
    /// Create the stages with the JSON codec.
    pub fn new(
        settings: &IndexActionSettings,
        collaborators: Collaborators,
    ) -> Result<Self, BulkError> {
        Self::with_codec(settings, JsonCodec, collaborators)
    }
}

impl<C: PipelineCodec> IndexActionStages<C> {
    /// Create the stages after validating the settings.
    pub fn with_codec(
        settings: &IndexActionSettings,
        codec: C,
        collaborators: Collaborators,
    ) -> Result<Self, BulkError> {
        settings.validate()?;
        let Collaborators {
            store,
            documents,
            admin,
            sink,
        } = collaborators;

        info!(
            action = %settings.action_name,
            batch_max_bytes = settings.batch_max_bytes,
            partitions = settings.partitions,
            "Creating index action stages"
        );

        Ok(Self {
            builder: BuildIndexRequests::with_codec(
                BuilderConfig::from_settings(settings),
                codec.clone(),
                store.clone(),
                documents,
                admin.clone(),
            ),
            submitter: BulkIndexSubmitter::with_codec(
                SubmitterConfig::from_settings(settings),
                codec.clone(),
                sink,
            ),
            reactor: IndexCompletionReactor::with_codec(
                settings.action_name.clone(),
                codec,
                store,
                admin,
            ),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::MemoryIndexAdmin;
    use crate::document::MemoryDocumentSource;
    use crate::sink::MemorySink;
    use bulk_stream::Computation;
    use bulk_types::MemoryCommandStore;

    fn collaborators() -> Collaborators {
        Collaborators {
            store: Arc::new(MemoryCommandStore::new()),
            documents: Arc::new(MemoryDocumentSource::new()),
            admin: Arc::new(MemoryIndexAdmin::new()),
            sink: Arc::new(MemorySink::new()),
        }
    }

    #[test]
    fn test_topology_shape() {
        let settings = IndexActionSettings::default();
        let topology = index_action_topology(&settings).unwrap();

        assert_eq!(topology.stream(ACTION_STREAM).unwrap().partitions, 1);
        assert_eq!(
            topology.stream(BATCH_STREAM).unwrap().partitions,
            settings.partitions
        );

        let status_producers: Vec<&str> = topology
            .producers(STATUS_STREAM)
            .iter()
            .map(|n| n.name.as_str())
            .collect();
        assert_eq!(status_producers, vec![BUILDER_NODE, SUBMITTER_NODE]);

        let reactor = topology.node(REACTOR_NODE).unwrap();
        assert_eq!(reactor.inputs[0].filter.as_deref(), Some("index"));
        assert!(reactor.outputs.is_empty());
    }

    #[test]
    fn test_zero_partitions_rejected() {
        let settings = IndexActionSettings {
            partitions: 0,
            ..Default::default()
        };
        assert!(index_action_topology(&settings).is_err());
    }

    #[test]
    fn test_stage_metadata_matches_topology() {
        let settings = IndexActionSettings::default();
        let topology = index_action_topology(&settings).unwrap();
        let stages = IndexActionStages::new(&settings, collaborators()).unwrap();

        let metas = [
            stages.builder.metadata(),
            stages.submitter.metadata(),
            stages.reactor.metadata(),
        ];
        for meta in metas {
            let node = topology.node(&meta.name).unwrap();
            let inputs: Vec<&str> = node.inputs.iter().map(|b| b.stream.as_str()).collect();
            let outputs: Vec<&str> = node.outputs.iter().map(|b| b.stream.as_str()).collect();
            assert_eq!(meta.inputs, inputs);
            assert_eq!(meta.outputs, outputs);
        }
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let settings = IndexActionSettings {
            batch_max_bytes: 0,
            ..Default::default()
        };
        assert!(IndexActionStages::new(&settings, collaborators()).is_err());
    }
}
