//! Topology declarations.
//!
//! A topology names the stages of a pipeline and the streams connecting
//! them. It is a declaration only; the host uses it to create partitions
//! and route records.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};

use crate::error::StreamError;

/// A named stream and its partition count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDecl {
    pub name: String,
    pub partitions: usize,
}

/// A stage's use of a stream, optionally filtered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamBinding {
    pub stream: String,
    /// Only records matching this filter are delivered (inputs only)
    pub filter: Option<String>,
}

impl StreamBinding {
    pub fn new(stream: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            filter: None,
        }
    }

    pub fn filtered(stream: impl Into<String>, filter: impl Into<String>) -> Self {
        Self {
            stream: stream.into(),
            filter: Some(filter.into()),
        }
    }
}

/// A stage of the topology.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDecl {
    pub name: String,
    /// Number of stage instances; each owns a subset of input partitions
    pub concurrency: usize,
    pub inputs: Vec<StreamBinding>,
    pub outputs: Vec<StreamBinding>,
}

impl NodeDecl {
    pub fn new(name: impl Into<String>, concurrency: usize) -> Self {
        Self {
            name: name.into(),
            concurrency,
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn input(mut self, binding: StreamBinding) -> Self {
        self.inputs.push(binding);
        self
    }

    pub fn output(mut self, binding: StreamBinding) -> Self {
        self.outputs.push(binding);
        self
    }
}

/// A validated set of stages and streams.
#[derive(Debug, Clone)]
pub struct Topology {
    streams: HashMap<String, StreamDecl>,
    nodes: Vec<NodeDecl>,
}

impl Topology {
    pub fn builder() -> TopologyBuilder {
        TopologyBuilder::default()
    }

    pub fn node(&self, name: &str) -> Option<&NodeDecl> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn nodes(&self) -> &[NodeDecl] {
        &self.nodes
    }

    pub fn stream(&self, name: &str) -> Option<&StreamDecl> {
        self.streams.get(name)
    }

    /// Stages reading `stream`, in declaration order.
    pub fn consumers(&self, stream: &str) -> Vec<&NodeDecl> {
        self.nodes
            .iter()
            .filter(|n| n.inputs.iter().any(|b| b.stream == stream))
            .collect()
    }

    /// Stages writing to `stream`, in declaration order.
    pub fn producers(&self, stream: &str) -> Vec<&NodeDecl> {
        self.nodes
            .iter()
            .filter(|n| n.outputs.iter().any(|b| b.stream == stream))
            .collect()
    }
}

/// Builder for [`Topology`].
#[derive(Debug, Default)]
pub struct TopologyBuilder {
    streams: Vec<StreamDecl>,
    nodes: Vec<NodeDecl>,
}

impl TopologyBuilder {
    pub fn stream(mut self, name: impl Into<String>, partitions: usize) -> Self {
        self.streams.push(StreamDecl {
            name: name.into(),
            partitions,
        });
        self
    }

    pub fn node(mut self, node: NodeDecl) -> Self {
        self.nodes.push(node);
        self
    }

    /// Validate names and bindings.
    pub fn build(self) -> Result<Topology, StreamError> {
        let mut streams = HashMap::new();
        for stream in self.streams {
            if stream.partitions == 0 {
                return Err(StreamError::Topology(format!(
                    "stream {} has no partition",
                    stream.name
                )));
            }
            if streams.insert(stream.name.clone(), stream.clone()).is_some() {
                return Err(StreamError::Topology(format!(
                    "stream {} declared twice",
                    stream.name
                )));
            }
        }

        let mut names = HashSet::new();
        for node in &self.nodes {
            if !names.insert(node.name.as_str()) {
                return Err(StreamError::Topology(format!(
                    "node {} declared twice",
                    node.name
                )));
            }
            if node.concurrency == 0 {
                return Err(StreamError::Topology(format!(
                    "node {} has no instance",
                    node.name
                )));
            }
            for binding in node.inputs.iter().chain(node.outputs.iter()) {
                if !streams.contains_key(&binding.stream) {
                    return Err(StreamError::Topology(format!(
                        "node {} uses undeclared stream {}",
                        node.name, binding.stream
                    )));
                }
            }
            if node.outputs.iter().any(|b| b.filter.is_some()) {
                return Err(StreamError::Topology(format!(
                    "node {} filters an output",
                    node.name
                )));
            }
        }

        Ok(Topology {
            streams,
            nodes: self.nodes,
        })
    }
}

/// Partition of `key` on a stream with `partitions` partitions.
///
/// Stable within one build, so a replayed key lands on the partition it
/// was first routed to. `DefaultHasher` output may change between toolchains.
pub fn partition_for(key: &str, partitions: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions.max(1) as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TopologyBuilder {
        Topology::builder()
            .stream("in", 1)
            .stream("mid", 4)
            .node(
                NodeDecl::new("a", 1)
                    .input(StreamBinding::new("in"))
                    .output(StreamBinding::new("mid")),
            )
            .node(NodeDecl::new("b", 2).input(StreamBinding::new("mid")))
    }

    #[test]
    fn test_build_and_query() {
        let topology = sample().build().unwrap();
        assert_eq!(topology.stream("mid").unwrap().partitions, 4);
        assert_eq!(topology.consumers("mid")[0].name, "b");
        assert_eq!(topology.producers("mid")[0].name, "a");
        assert!(topology.node("c").is_none());
    }

    #[test]
    fn test_undeclared_stream_rejected() {
        let result = sample()
            .node(NodeDecl::new("c", 1).input(StreamBinding::new("nowhere")))
            .build();
        assert!(matches!(result, Err(StreamError::Topology(_))));
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let result = sample().node(NodeDecl::new("a", 1)).build();
        assert!(result.is_err());
    }

    #[test]
    fn test_partition_for_is_stable() {
        let p = partition_for("bucket-7-0", 4);
        assert!(p < 4);
        assert_eq!(p, partition_for("bucket-7-0", 4));
        assert_eq!(partition_for("anything", 1), 0);
    }
}
