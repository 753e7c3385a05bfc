//! Network Protocol Definitions
//!
//! DTOs exchanged between nodes: requests routed to the elected coordinator,
//! local cancellations routed to the node that runs a task, and cluster state
//! publication from the coordinator to followers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::cluster::state::{ClusterState, ClusterStateDiff};
use crate::tasks::types::{TaskId, TaskRecord};

pub const ENDPOINT_COORDINATOR: &str = "/internal/persistent_tasks";
pub const ENDPOINT_LOCAL_CANCEL: &str = "/internal/persistent_tasks/cancel";
pub const ENDPOINT_PUBLISH_STATE: &str = "/internal/cluster_state";
pub const ENDPOINT_TASKS: &str = "/tasks";
pub const ENDPOINT_TASK: &str = "/tasks/:id";
pub const ENDPOINT_TASK_STATS: &str = "/stats/tasks";

/// A request for the coordinator, tagged with the subsystem that issued it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorRequest {
    pub origin: String,
    pub action: CoordinatorAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorAction {
    Start {
        task_id: TaskId,
        task_name: String,
        params: Value,
    },
    UpdateState {
        task_id: TaskId,
        allocation_id: u64,
        state: Option<Value>,
    },
    Complete {
        task_id: TaskId,
        allocation_id: u64,
        failure: Option<String>,
        local_abort_reason: Option<String>,
    },
    Remove {
        task_id: TaskId,
    },
    Cancel {
        task_id: TaskId,
        reason: Option<String>,
    },
    Unassign {
        task_id: TaskId,
        allocation_id: u64,
        reason: String,
    },
}

impl CoordinatorAction {
    pub fn name(&self) -> &'static str {
        match self {
            CoordinatorAction::Start { .. } => "start",
            CoordinatorAction::UpdateState { .. } => "update_state",
            CoordinatorAction::Complete { .. } => "complete",
            CoordinatorAction::Remove { .. } => "remove",
            CoordinatorAction::Cancel { .. } => "cancel",
            CoordinatorAction::Unassign { .. } => "unassign",
        }
    }

    pub fn task_id(&self) -> &TaskId {
        match self {
            CoordinatorAction::Start { task_id, .. }
            | CoordinatorAction::UpdateState { task_id, .. }
            | CoordinatorAction::Complete { task_id, .. }
            | CoordinatorAction::Remove { task_id }
            | CoordinatorAction::Cancel { task_id, .. }
            | CoordinatorAction::Unassign { task_id, .. } => task_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CoordinatorResponse {
    Task(Arc<TaskRecord>),
    /// The record after completion, or `None` when completion removed it.
    Completed(Option<Arc<TaskRecord>>),
    Cancelled(bool),
}

/// Asks the node running `task_id` to cancel its local allocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalCancelRequest {
    pub origin: String,
    pub task_id: TaskId,
    pub allocation_id: u64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "state", rename_all = "snake_case")]
pub enum PublishStateRequest {
    Full(ClusterState),
    Diff(ClusterStateDiff),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartTaskRequest {
    pub task_id: TaskId,
    pub task_name: String,
    #[serde(default)]
    pub params: Value,
}
