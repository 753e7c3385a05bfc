//! Per-node façade over the coordinator.
//!
//! Running tasks and callers go through `TaskClient` to start, update, complete,
//! remove and cancel persistent tasks, and to wait for the registry to reach a
//! condition. Waits are driven by the cluster state subscription and never poll.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

use super::registry::TaskRegistry;
use super::types::{LOCAL_ABORT_MIN_PROTOCOL_VERSION, TaskId, TaskRecord};
use crate::cluster::service::ClusterStateService;
use crate::cluster::state::ClusterState;
use crate::error::TaskError;
use crate::transport::ClusterTransport;
use crate::transport::protocol::{CoordinatorAction, CoordinatorRequest, CoordinatorResponse};

/// Origin attached to every request this client sends.
pub const PERSISTENT_TASKS_ORIGIN: &str = "persistent_tasks";

#[derive(Debug, Clone, PartialEq)]
pub enum WaitOutcome<T> {
    Satisfied(T),
    TimedOut,
}

impl<T> WaitOutcome<T> {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, WaitOutcome::Satisfied(_))
    }

    pub fn into_option(self) -> Option<T> {
        match self {
            WaitOutcome::Satisfied(value) => Some(value),
            WaitOutcome::TimedOut => None,
        }
    }
}

fn unexpected_response(response: CoordinatorResponse) -> TaskError {
    TaskError::Transport(format!("unexpected coordinator response: {response:?}"))
}

#[derive(Clone)]
pub struct TaskClient {
    cluster: Arc<ClusterStateService>,
    transport: Arc<dyn ClusterTransport>,
}

impl TaskClient {
    pub fn new(cluster: Arc<ClusterStateService>, transport: Arc<dyn ClusterTransport>) -> Self {
        Self { cluster, transport }
    }

    pub fn cluster(&self) -> &Arc<ClusterStateService> {
        &self.cluster
    }

    async fn execute(&self, action: CoordinatorAction) -> Result<CoordinatorResponse, TaskError> {
        let span = tracing::info_span!(
            "persistent_task_request",
            origin = PERSISTENT_TASKS_ORIGIN,
            action = action.name(),
            task = %action.task_id(),
        );
        let request = CoordinatorRequest {
            origin: PERSISTENT_TASKS_ORIGIN.to_string(),
            action,
        };
        self.transport.send_to_coordinator(request).instrument(span).await
    }

    fn expect_task(response: CoordinatorResponse) -> Result<Arc<TaskRecord>, TaskError> {
        match response {
            CoordinatorResponse::Task(record) => Ok(record),
            other => Err(unexpected_response(other)),
        }
    }

    pub async fn send_start_request(
        &self,
        task_id: TaskId,
        task_name: &str,
        params: Value,
    ) -> Result<Arc<TaskRecord>, TaskError> {
        let response = self
            .execute(CoordinatorAction::Start {
                task_id,
                task_name: task_name.to_string(),
                params,
            })
            .await?;
        Self::expect_task(response)
    }

    pub async fn send_update_state_request(
        &self,
        task_id: &TaskId,
        allocation_id: u64,
        state: Option<Value>,
    ) -> Result<Arc<TaskRecord>, TaskError> {
        let response = self
            .execute(CoordinatorAction::UpdateState {
                task_id: task_id.clone(),
                allocation_id,
                state,
            })
            .await?;
        Self::expect_task(response)
    }

    /// Returns the record as left by completion, `None` if completion removed it.
    pub async fn send_completion_request(
        &self,
        task_id: &TaskId,
        allocation_id: u64,
        failure: Option<String>,
        local_abort_reason: Option<String>,
    ) -> Result<Option<Arc<TaskRecord>>, TaskError> {
        let response = self
            .execute(CoordinatorAction::Complete {
                task_id: task_id.clone(),
                allocation_id,
                failure,
                local_abort_reason,
            })
            .await?;
        match response {
            CoordinatorResponse::Completed(record) => Ok(record),
            other => Err(unexpected_response(other)),
        }
    }

    pub async fn send_remove_request(
        &self,
        task_id: &TaskId,
    ) -> Result<Arc<TaskRecord>, TaskError> {
        let response = self
            .execute(CoordinatorAction::Remove {
                task_id: task_id.clone(),
            })
            .await?;
        Self::expect_task(response)
    }

    /// Asks the node running the task to cancel it. The registry changes later,
    /// when that node reports completion.
    pub async fn send_cancel_request(
        &self,
        task_id: &TaskId,
        reason: Option<String>,
    ) -> Result<bool, TaskError> {
        let response = self
            .execute(CoordinatorAction::Cancel {
                task_id: task_id.clone(),
                reason,
            })
            .await?;
        match response {
            CoordinatorResponse::Cancelled(cancelled) => Ok(cancelled),
            other => Err(unexpected_response(other)),
        }
    }

    pub async fn send_unassign_request(
        &self,
        task_id: &TaskId,
        allocation_id: u64,
        reason: &str,
    ) -> Result<Arc<TaskRecord>, TaskError> {
        let response = self
            .execute(CoordinatorAction::Unassign {
                task_id: task_id.clone(),
                allocation_id,
                reason: reason.to_string(),
            })
            .await?;
        Self::expect_task(response)
    }

    /// Waits until `predicate` holds for the task's record (`None` if absent).
    ///
    /// Checks the current snapshot first, then re-checks on every published
    /// change until the predicate holds, the cluster service closes or `timeout`
    /// elapses.
    pub async fn wait_for_persistent_task_condition<F>(
        &self,
        task_id: &TaskId,
        predicate: F,
        timeout: Duration,
    ) -> Result<WaitOutcome<Option<Arc<TaskRecord>>>, TaskError>
    where
        F: Fn(Option<&TaskRecord>) -> bool + Send,
    {
        self.wait_for_state(
            move |state| {
                let record = state.tasks.get(task_id).cloned();
                predicate(record.as_deref()).then_some(record)
            },
            timeout,
        )
        .await
    }

    pub async fn wait_for_persistent_tasks_condition<F>(
        &self,
        predicate: F,
        timeout: Duration,
    ) -> Result<WaitOutcome<TaskRegistry>, TaskError>
    where
        F: Fn(&TaskRegistry) -> bool + Send,
    {
        self.wait_for_state(
            move |state| predicate(&state.tasks).then(|| state.tasks.clone()),
            timeout,
        )
        .await
    }

    async fn wait_for_state<T, F>(
        &self,
        mut extract: F,
        timeout: Duration,
    ) -> Result<WaitOutcome<T>, TaskError>
    where
        F: FnMut(&ClusterState) -> Option<T> + Send,
    {
        let mut rx = self.cluster.subscribe();
        let current = rx.borrow_and_update().clone();
        if let Some(value) = extract(&current) {
            return Ok(WaitOutcome::Satisfied(value));
        }

        let closed = self.cluster.closed_token();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = closed.cancelled() => return Err(TaskError::NodeClosed),
                _ = &mut deadline => return Ok(WaitOutcome::TimedOut),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(TaskError::NodeClosed);
                    }
                    let current = rx.borrow_and_update().clone();
                    if let Some(value) = extract(&current) {
                        return Ok(WaitOutcome::Satisfied(value));
                    }
                }
            }
        }
    }

    pub fn is_local_abort_supported(&self) -> bool {
        self.cluster
            .state()
            .nodes
            .supports_protocol(LOCAL_ABORT_MIN_PROTOCOL_VERSION)
    }

    pub fn validate_local_abort_supported(&self) -> Result<(), TaskError> {
        if self.is_local_abort_supported() {
            return Ok(());
        }
        let minimum = self.cluster.state().nodes.min_protocol_version();
        Err(TaskError::Unsupported(format!(
            "local abort requires every node to run protocol version [{LOCAL_ABORT_MIN_PROTOCOL_VERSION}] or later, cluster minimum is [{}]",
            minimum.map_or_else(|| "unknown".to_string(), |v| v.to_string())
        )))
    }
}
