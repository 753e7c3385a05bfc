//! Coordinator-side logic for persistent tasks.
//!
//! Only the elected master acts on requests; every other node answers with
//! `NotCoordinator`. All registry mutations go through
//! [`ClusterStateService::submit_update`], so they are serialised and always
//! computed on the latest snapshot.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::allocated::DEFAULT_CANCEL_REASON;
use super::client::PERSISTENT_TASKS_ORIGIN;
use super::executor::{AssignmentContext, ExecutorRegistry};
use super::types::{
    Assignment, CompletionPolicy, LOCAL_ABORT_MIN_PROTOCOL_VERSION, TaskId, TaskRecord,
};
use crate::cluster::service::ClusterStateService;
use crate::cluster::state::{ClusterChangedEvent, ClusterState};
use crate::error::TaskError;
use crate::membership::types::NodeId;
use crate::transport::ClusterTransport;
use crate::transport::protocol::{
    CoordinatorAction, CoordinatorRequest, CoordinatorResponse, LocalCancelRequest,
};

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub completion_policy: CompletionPolicy,
    /// How often the master re-evaluates unassigned tasks without a cluster change.
    pub recheck_interval: Duration,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            completion_policy: CompletionPolicy::default(),
            recheck_interval: Duration::from_secs(30),
        }
    }
}

pub struct CoordinatorService {
    local_node: NodeId,
    cluster: Arc<ClusterStateService>,
    executors: Arc<ExecutorRegistry>,
    transport: Arc<dyn ClusterTransport>,
    settings: CoordinatorSettings,
}

fn check_allocation(record: &TaskRecord, allocation_id: u64) -> Result<(), TaskError> {
    if record.allocation_id != allocation_id {
        return Err(TaskError::StaleRequest {
            id: record.id.clone(),
            requested: allocation_id,
            current: record.allocation_id,
        });
    }
    Ok(())
}

fn existing<'a>(state: &'a ClusterState, id: &TaskId) -> Result<&'a Arc<TaskRecord>, TaskError> {
    state.tasks.get(id).ok_or_else(|| TaskError::TaskNotFound(id.clone()))
}

fn validate_local_abort(state: &ClusterState) -> Result<(), TaskError> {
    if state.nodes.supports_protocol(LOCAL_ABORT_MIN_PROTOCOL_VERSION) {
        return Ok(());
    }
    Err(TaskError::Unsupported(format!(
        "local abort of persistent tasks requires protocol version [{}] on every node, cluster minimum is [{:?}]",
        LOCAL_ABORT_MIN_PROTOCOL_VERSION,
        state.nodes.min_protocol_version()
    )))
}

impl CoordinatorService {
    pub fn new(
        local_node: NodeId,
        cluster: Arc<ClusterStateService>,
        executors: Arc<ExecutorRegistry>,
        transport: Arc<dyn ClusterTransport>,
        settings: CoordinatorSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_node,
            cluster,
            executors,
            transport,
            settings,
        })
    }

    pub fn is_elected(&self) -> bool {
        self.cluster.state().is_master(&self.local_node)
    }

    /// Checked against the snapshot a mutation is computed on, so a change of
    /// master between the request and the commit rejects the mutation.
    fn ensure_master(&self, state: &ClusterState) -> Result<(), TaskError> {
        if state.is_master(&self.local_node) {
            Ok(())
        } else {
            Err(TaskError::NotCoordinator(self.local_node.to_string()))
        }
    }

    /// Entry point for requests arriving through a transport.
    pub async fn handle(
        &self,
        request: CoordinatorRequest,
    ) -> Result<CoordinatorResponse, TaskError> {
        debug!(
            origin = %request.origin,
            action = request.action.name(),
            task = %request.action.task_id(),
            "coordinator request"
        );
        match request.action {
            CoordinatorAction::Start {
                task_id,
                task_name,
                params,
            } => self
                .create_task(task_id, &task_name, params)
                .await
                .map(CoordinatorResponse::Task),
            CoordinatorAction::UpdateState {
                task_id,
                allocation_id,
                state,
            } => self
                .update_task_state(&task_id, allocation_id, state)
                .await
                .map(CoordinatorResponse::Task),
            CoordinatorAction::Complete {
                task_id,
                allocation_id,
                failure,
                local_abort_reason,
            } => self
                .complete_task(&task_id, allocation_id, failure, local_abort_reason)
                .await
                .map(CoordinatorResponse::Completed),
            CoordinatorAction::Remove { task_id } => {
                self.remove_task(&task_id).await.map(CoordinatorResponse::Task)
            }
            CoordinatorAction::Cancel { task_id, reason } => self
                .cancel_task(&task_id, reason)
                .await
                .map(CoordinatorResponse::Cancelled),
            CoordinatorAction::Unassign {
                task_id,
                allocation_id,
                reason,
            } => self
                .unassign_task(&task_id, allocation_id, &reason)
                .await
                .map(CoordinatorResponse::Task),
        }
    }

    pub async fn create_task(
        &self,
        id: TaskId,
        task_name: &str,
        params: Value,
    ) -> Result<Arc<TaskRecord>, TaskError> {
        self.executors.validate_params(task_name, &params)?;

        let executors = self.executors.clone();
        let key = id.clone();
        let state = self
            .cluster
            .submit_update("create persistent task", move |s| {
                self.ensure_master(s)?;
                if s.tasks.contains(&id) {
                    return Err(TaskError::DuplicateTask(id));
                }
                let ctx = AssignmentContext::new(&s.nodes, s.tasks.tasks());
                let assignment = executors.select_assignment(task_name, &params, &ctx);
                let tasks = s.tasks.add_task(id, task_name, params, assignment)?;
                Ok(s.with_tasks(tasks))
            })
            .await?;

        let record = existing(&state, &key)?.clone();
        info!(
            "Persistent task [{}] of type [{}] created with allocation [{}], assignment {}",
            record.id, record.task_name, record.allocation_id, record.assignment
        );
        Ok(record)
    }

    pub async fn update_task_state(
        &self,
        id: &TaskId,
        allocation_id: u64,
        task_state: Option<Value>,
    ) -> Result<Arc<TaskRecord>, TaskError> {
        let state = self
            .cluster
            .submit_update("update persistent task state", |s| {
                self.ensure_master(s)?;
                check_allocation(existing(s, id)?, allocation_id)?;
                Ok(s.with_tasks(s.tasks.update_task_state(id, allocation_id, task_state)?))
            })
            .await?;
        Ok(existing(&state, id)?.clone())
    }

    /// Applies a completion reported by the node that ran the task.
    ///
    /// Returns the record when it is kept (failed under `RetainFailed`, or locally
    /// aborted and waiting for a new node) and `None` when it was removed.
    pub async fn complete_task(
        &self,
        id: &TaskId,
        allocation_id: u64,
        failure: Option<String>,
        local_abort_reason: Option<String>,
    ) -> Result<Option<Arc<TaskRecord>>, TaskError> {
        let policy = self.settings.completion_policy;
        let state = self
            .cluster
            .submit_update("complete persistent task", |s| {
                self.ensure_master(s)?;
                if local_abort_reason.is_some() {
                    validate_local_abort(s)?;
                }
                check_allocation(existing(s, id)?, allocation_id)?;
                let tasks = s
                    .tasks
                    .complete_task(id, allocation_id, failure, local_abort_reason, policy)?;
                Ok(s.with_tasks(tasks))
            })
            .await?;

        let record = state.tasks.get(id).cloned();
        match &record {
            Some(r) if r.is_failed() => info!("Persistent task [{}] failed and is retained", id),
            Some(r) => info!("Persistent task [{}] locally aborted, now {}", id, r.assignment),
            None => info!("Persistent task [{}] completed and removed", id),
        }
        Ok(record)
    }

    pub async fn remove_task(&self, id: &TaskId) -> Result<Arc<TaskRecord>, TaskError> {
        let mut removed = None;
        self.cluster
            .submit_update("remove persistent task", |s| {
                self.ensure_master(s)?;
                removed = Some(existing(s, id)?.clone());
                Ok(s.with_tasks(s.tasks.remove_task(id)?))
            })
            .await?;

        info!("Persistent task [{}] removed", id);
        removed.ok_or_else(|| TaskError::TaskNotFound(id.clone()))
    }

    /// Forwards a cancellation to the node running the task. The registry is not
    /// touched here; it changes once that node reports completion.
    pub async fn cancel_task(
        &self,
        id: &TaskId,
        reason: Option<String>,
    ) -> Result<bool, TaskError> {
        let state = self.cluster.state();
        self.ensure_master(&state)?;
        let record = existing(&state, id)?;
        let Some(node) = &record.assignment.executor_node else {
            debug!("Persistent task [{}] is not assigned, nothing to cancel", id);
            return Ok(false);
        };

        let request = LocalCancelRequest {
            origin: PERSISTENT_TASKS_ORIGIN.to_string(),
            task_id: id.clone(),
            allocation_id: record.allocation_id,
            reason: reason.unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string()),
        };
        let cancelled = self.transport.send_to_node(node, request).await?;
        debug!("Cancel of persistent task [{}] on node [{}]: {}", id, node, cancelled);
        Ok(cancelled)
    }

    pub async fn unassign_task(
        &self,
        id: &TaskId,
        allocation_id: u64,
        reason: &str,
    ) -> Result<Arc<TaskRecord>, TaskError> {
        let state = self
            .cluster
            .submit_update("unassign persistent task", |s| {
                self.ensure_master(s)?;
                check_allocation(existing(s, id)?, allocation_id)?;
                Ok(s.with_tasks(s.tasks.reassign_task(id, Assignment::unassigned(reason))?))
            })
            .await?;
        Ok(existing(&state, id)?.clone())
    }

    /// Gives every orphaned or unassigned (and not failed) task a fresh selection.
    ///
    /// A record is only touched when the selection differs from its current
    /// assignment, so running this twice against the same topology is a no-op.
    pub async fn reassign_tasks(&self) -> Result<Arc<ClusterState>, TaskError> {
        let executors = self.executors.clone();
        self.cluster
            .submit_update("reassign persistent tasks", move |s| {
                self.ensure_master(s)?;
                let mut builder = s.tasks.builder();
                let candidates: Vec<Arc<TaskRecord>> =
                    s.tasks.tasks().filter(|t| t.needs_assignment(&s.nodes)).cloned().collect();

                for record in candidates {
                    let ctx = AssignmentContext::new(&s.nodes, builder.tasks());
                    let assignment =
                        executors.select_assignment(&record.task_name, &record.params, &ctx);
                    if assignment != record.assignment {
                        debug!(
                            "Reassigning persistent task [{}] from {} to {}",
                            record.id, record.assignment, assignment
                        );
                        builder.reassign_task(&record.id, assignment)?;
                    }
                }

                if !builder.is_changed() {
                    return Ok(s.clone());
                }
                Ok(s.with_tasks(builder.build()))
            })
            .await
    }

    async fn try_reassign(&self, trigger: &str) {
        match self.reassign_tasks().await {
            Ok(state) => debug!(trigger, version = state.version, "reassignment check done"),
            Err(TaskError::NotCoordinator(_)) | Err(TaskError::NodeClosed) => {}
            Err(e) => warn!("Reassignment after {} failed: {}", trigger, e),
        }
    }

    /// Reacts to cluster changes and periodic rechecks while this node is master.
    pub async fn run(self: Arc<Self>) {
        let mut rx = self.cluster.subscribe();
        let closed = self.cluster.closed_token();
        let mut previous = rx.borrow_and_update().clone();
        let mut recheck = tokio::time::interval(self.settings.recheck_interval);

        info!("Persistent task coordinator started on [{}]", self.local_node);
        loop {
            tokio::select! {
                _ = closed.cancelled() => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = rx.borrow_and_update().clone();
                    let event = ClusterChangedEvent::new(previous, current.clone());
                    previous = current;

                    let relevant = event.master_changed()
                        || event.nodes_changed()
                        || event.tasks_changed();
                    if event.local_node_master(&self.local_node) && relevant {
                        if event.master_changed() {
                            info!("Node [{}] elected coordinator", self.local_node);
                        }
                        for node in event.nodes_removed() {
                            info!("Node [{}] left, reassigning its persistent tasks", node);
                        }
                        self.try_reassign("cluster change").await;
                    }
                }
                _ = recheck.tick() => {
                    if self.is_elected() {
                        self.try_reassign("periodic recheck").await;
                    }
                }
            }
        }
        info!("Persistent task coordinator stopped");
    }
}
