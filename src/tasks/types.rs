use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::cluster::nodes::DiscoveryNodes;
use crate::error::TaskError;
use crate::membership::types::NodeId;

/// Lowest protocol version that understands locally aborted completions.
pub const LOCAL_ABORT_MIN_PROTOCOL_VERSION: u32 = 2;

pub const INITIAL_ASSIGNMENT_EXPLANATION: &str = "waiting for initial assignment";
pub const NO_NODE_FOUND_EXPLANATION: &str = "no appropriate nodes found for the assignment";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which node owns execution of a task, or why none does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub executor_node: Option<NodeId>,
    pub explanation: String,
}

impl Assignment {
    pub fn to_node(node: NodeId) -> Self {
        Self {
            executor_node: Some(node),
            explanation: String::new(),
        }
    }

    pub fn unassigned(explanation: impl Into<String>) -> Self {
        Self {
            executor_node: None,
            explanation: explanation.into(),
        }
    }

    pub fn initial() -> Self {
        Self::unassigned(INITIAL_ASSIGNMENT_EXPLANATION)
    }

    pub fn is_assigned(&self) -> bool {
        self.executor_node.is_some()
    }

    pub fn is_assigned_to(&self, node: &NodeId) -> bool {
        self.executor_node.as_ref() == Some(node)
    }
}

impl fmt::Display for Assignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.executor_node {
            Some(node) => write!(f, "node [{node}]"),
            None => write!(f, "unassigned ({})", self.explanation),
        }
    }
}

/// One persisted task inside the cluster state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub task_name: String,
    pub params: Value,
    pub state: Option<Value>,
    pub assignment: Assignment,
    pub allocation_id: u64,
    /// Allocation that last wrote `state`.
    pub allocation_id_on_last_state_update: Option<u64>,
    /// Terminal failure kept around until the record is removed.
    pub failure: Option<String>,
}

impl TaskRecord {
    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// True when this record should be (re)considered for assignment.
    pub fn needs_assignment(&self, live: &DiscoveryNodes) -> bool {
        if self.is_failed() {
            return false;
        }
        match &self.assignment.executor_node {
            Some(node) => !live.contains(node),
            None => true,
        }
    }
}

/// What happens to a record whose execution reported a failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompletionPolicy {
    /// Keep the record with its failure until someone removes it.
    #[default]
    RetainFailed,
    RemoveFailed,
}
