use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::nodes::DiscoveryNodes;
use crate::error::TaskError;
use crate::membership::types::NodeId;
use crate::tasks::registry::{RegistryDiff, TaskRegistry};

/// Name of the persistent tasks block inside the cluster state document.
pub const PERSISTENT_TASKS_METADATA: &str = "persistent_tasks";

/// Versioned cluster document replicated from the coordinator to every node.
///
/// `term` grows by one every time a node takes over as master; `version` grows
/// with every committed change. Snapshots are ordered by `(term, version)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterState {
    #[serde(default)]
    pub term: u64,
    pub version: u64,
    pub master_node: Option<NodeId>,
    pub nodes: DiscoveryNodes,
    #[serde(rename = "persistent_tasks")]
    pub tasks: TaskRegistry,
}

impl ClusterState {
    pub fn with_tasks(&self, tasks: TaskRegistry) -> ClusterState {
        ClusterState {
            tasks,
            ..self.clone()
        }
    }

    pub fn with_nodes(&self, nodes: DiscoveryNodes, master_node: Option<NodeId>) -> ClusterState {
        ClusterState {
            nodes,
            master_node,
            ..self.clone()
        }
    }

    pub fn is_master(&self, node: &NodeId) -> bool {
        self.master_node.as_ref() == Some(node)
    }

    pub fn freshness(&self) -> (u64, u64) {
        (self.term, self.version)
    }

    /// Same content, ignoring the version number.
    pub fn same_content(&self, other: &ClusterState) -> bool {
        self.term == other.term
            && self.master_node == other.master_node
            && self.nodes == other.nodes
            && self.tasks == other.tasks
    }

    pub fn diff(&self, previous: &ClusterState) -> ClusterStateDiff {
        ClusterStateDiff {
            from_term: previous.term,
            from_version: previous.version,
            term: self.term,
            to_version: self.version,
            master_node: self.master_node.clone(),
            nodes: self.nodes.clone(),
            tasks: self.tasks.diff(&previous.tasks),
        }
    }
}

/// What a follower needs to move from `(from_term, from_version)` to
/// `(term, to_version)`.
///
/// Nodes are small and sent whole; tasks are sent per id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterStateDiff {
    pub from_term: u64,
    pub from_version: u64,
    pub term: u64,
    pub to_version: u64,
    pub master_node: Option<NodeId>,
    pub nodes: DiscoveryNodes,
    pub tasks: RegistryDiff,
}

impl ClusterStateDiff {
    pub fn apply(&self, base: &ClusterState) -> Result<ClusterState, TaskError> {
        // Two masters can reach the same version number with different content,
        // so the base must match on term as well.
        if base.freshness() != (self.from_term, self.from_version) {
            return Err(TaskError::InvalidRequest(format!(
                "cluster state diff expects base [term {}, version {}] but local state is [term {}, version {}]",
                self.from_term, self.from_version, base.term, base.version
            )));
        }
        Ok(ClusterState {
            term: self.term,
            version: self.to_version,
            master_node: self.master_node.clone(),
            nodes: self.nodes.clone(),
            tasks: self.tasks.apply(&base.tasks),
        })
    }
}

/// A pair of consecutive snapshots as seen by a subscriber.
#[derive(Debug, Clone)]
pub struct ClusterChangedEvent {
    pub previous: Arc<ClusterState>,
    pub current: Arc<ClusterState>,
}

impl ClusterChangedEvent {
    pub fn new(previous: Arc<ClusterState>, current: Arc<ClusterState>) -> Self {
        Self { previous, current }
    }

    pub fn nodes_added(&self) -> Vec<NodeId> {
        self.current
            .nodes
            .ids()
            .filter(|id| !self.previous.nodes.contains(id))
            .cloned()
            .collect()
    }

    pub fn nodes_removed(&self) -> Vec<NodeId> {
        self.previous
            .nodes
            .ids()
            .filter(|id| !self.current.nodes.contains(id))
            .cloned()
            .collect()
    }

    pub fn nodes_changed(&self) -> bool {
        self.previous.nodes != self.current.nodes
    }

    pub fn tasks_changed(&self) -> bool {
        self.previous.tasks != self.current.tasks
    }

    pub fn master_changed(&self) -> bool {
        self.previous.master_node != self.current.master_node
    }

    pub fn local_node_master(&self, local: &NodeId) -> bool {
        self.current.is_master(local)
    }
}
