use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;

use crate::membership::types::NodeId;

/// A live node as seen by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    /// Absent for in-process nodes that are reached without HTTP.
    pub http_addr: Option<SocketAddr>,
    pub protocol_version: u32,
}

impl NodeInfo {
    pub fn local(id: impl Into<NodeId>, protocol_version: u32) -> Self {
        Self {
            id: id.into(),
            http_addr: None,
            protocol_version,
        }
    }
}

/// The set of nodes eligible to run tasks, ordered by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryNodes {
    nodes: BTreeMap<NodeId, NodeInfo>,
}

impl DiscoveryNodes {
    pub fn new(nodes: impl IntoIterator<Item = NodeInfo>) -> Self {
        Self {
            nodes: nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
        }
    }

    pub fn get(&self, id: &NodeId) -> Option<&NodeInfo> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn min_protocol_version(&self) -> Option<u32> {
        self.nodes.values().map(|n| n.protocol_version).min()
    }

    /// True when the cluster is non-empty and every node speaks at least `version`.
    pub fn supports_protocol(&self, version: u32) -> bool {
        self.min_protocol_version().is_some_and(|min| min >= version)
    }

    /// Lowest node id wins. Every node computes the same answer from the same view.
    pub fn elect_master(&self) -> Option<NodeId> {
        self.nodes.keys().next().cloned()
    }
}

/// Source of the live node set.
///
/// Implemented by the gossip membership service in production and by fixed node
/// lists in tests.
pub trait ClusterMembership: Send + Sync {
    fn local_node_id(&self) -> NodeId;

    fn live_nodes(&self) -> Vec<NodeInfo>;

    fn minimum_protocol_version(&self) -> Option<u32> {
        self.live_nodes().iter().map(|n| n.protocol_version).min()
    }
}

/// A fixed membership view.
#[derive(Debug, Clone)]
pub struct StaticMembership {
    pub local: NodeId,
    pub nodes: Vec<NodeInfo>,
}

impl ClusterMembership for StaticMembership {
    fn local_node_id(&self) -> NodeId {
        self.local.clone()
    }

    fn live_nodes(&self) -> Vec<NodeInfo> {
        self.nodes.clone()
    }
}
