//! Per-node reconciler.
//!
//! Watches the cluster state and keeps the set of local `AllocatedTask`s in line
//! with the registry: allocations assigned to this node are started, allocations
//! that were removed or moved elsewhere are cancelled locally. This service owns
//! every `AllocatedTask` on the node; tasks only hold client handles back.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::allocated::{AllocatedTask, AllocatedTaskState, DEFAULT_CANCEL_REASON};
use super::client::TaskClient;
use super::executor::ExecutorRegistry;
use super::tracking::LocalTaskManager;
use super::types::{TaskId, TaskRecord};
use crate::cluster::service::ClusterStateService;
use crate::cluster::state::ClusterState;
use crate::membership::types::NodeId;
use crate::transport::protocol::LocalCancelRequest;

pub struct PersistentTasksNodeService {
    local_node: NodeId,
    cluster: Arc<ClusterStateService>,
    executors: Arc<ExecutorRegistry>,
    task_manager: Arc<LocalTaskManager>,
    client: TaskClient,
    /// Keyed by allocation id, which is unique across the registry.
    running: DashMap<u64, Arc<AllocatedTask>>,
}

impl PersistentTasksNodeService {
    pub fn new(
        local_node: NodeId,
        cluster: Arc<ClusterStateService>,
        executors: Arc<ExecutorRegistry>,
        task_manager: Arc<LocalTaskManager>,
        client: TaskClient,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_node,
            cluster,
            executors,
            task_manager,
            client,
            running: DashMap::new(),
        })
    }

    pub fn local_node(&self) -> &NodeId {
        &self.local_node
    }

    pub async fn run(self: Arc<Self>) {
        let mut rx = self.cluster.subscribe();
        let closed = self.cluster.closed_token();
        let initial = rx.borrow_and_update().clone();
        self.reconcile(&initial);

        loop {
            tokio::select! {
                _ = closed.cancelled() => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = rx.borrow_and_update().clone();
                    self.reconcile(&state);
                }
            }
        }
        debug!("Persistent task node service on [{}] stopped", self.local_node);
    }

    /// Brings local allocations in line with `state`.
    pub fn reconcile(&self, state: &ClusterState) {
        let obsolete: Vec<Arc<AllocatedTask>> = self
            .running
            .iter()
            .filter(|entry| {
                let task = entry.value();
                !state.tasks.get(task.persistent_task_id()).is_some_and(|record| {
                    record.allocation_id == task.allocation_id()
                        && record.assignment.is_assigned_to(&self.local_node)
                })
            })
            .map(|entry| entry.value().clone())
            .collect();

        for task in obsolete {
            self.running.remove(&task.allocation_id());
            if !task.is_completed() && task.cancel_unassigned() {
                info!(
                    "Persistent task [{}] allocation [{}] no longer assigned to this node, cancelled",
                    task.persistent_task_id(),
                    task.allocation_id()
                );
            }
        }

        let to_start: Vec<Arc<TaskRecord>> = state
            .tasks
            .tasks_assigned_to(&self.local_node)
            .filter(|record| {
                !record.is_failed() && !self.running.contains_key(&record.allocation_id)
            })
            .cloned()
            .collect();

        for record in to_start {
            self.start_task(&record);
        }
    }

    fn start_task(&self, record: &TaskRecord) {
        let task = AllocatedTask::new(record, self.client.clone(), self.task_manager.clone());
        self.running.insert(record.allocation_id, task.clone());

        let execution = match self.executors.create_execution(record, task.clone()) {
            Ok(execution) => execution,
            Err(e) => {
                warn!("Cannot start persistent task [{}]: {}", record.id, e);
                task.mark_as_failed(e.into());
                return;
            }
        };

        info!(
            "Starting persistent task [{}] of type [{}] with allocation [{}]",
            record.id, record.task_name, record.allocation_id
        );

        let task_manager = self.task_manager.clone();
        tokio::spawn(async move {
            // Run on its own task so a panicking executor still completes the allocation.
            let outcome = match tokio::spawn(execution).await {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("persistent task execution aborted: {e}")),
            };

            match outcome {
                Ok(()) => {
                    if !task.is_completed() {
                        task.mark_as_completed();
                    }
                }
                Err(e) => {
                    // Cancelled directly through the task manager: record the reason so
                    // a user cancellation is not reported as a failure.
                    if task.state() == AllocatedTaskState::Started && task.is_cancelled() {
                        let reason = task_manager
                            .cancel_reason(task.local_id())
                            .unwrap_or_else(|| DEFAULT_CANCEL_REASON.to_string());
                        task.cancel(&reason);
                    }
                    if !task.is_completed() {
                        task.mark_as_failed(e);
                    }
                }
            }
        });
    }

    /// Cancels the local allocation named by `request`, if it is running here.
    pub fn cancel_local(&self, request: &LocalCancelRequest) -> bool {
        let task = self.running.get(&request.allocation_id).map(|e| e.value().clone());
        match task {
            Some(task) if task.persistent_task_id() == &request.task_id => {
                debug!(
                    origin = %request.origin,
                    "Local cancel of [{}]: {}", request.task_id, request.reason
                );
                task.cancel(&request.reason)
            }
            _ => {
                debug!(
                    "No running allocation [{}] of [{}] on this node",
                    request.allocation_id, request.task_id
                );
                false
            }
        }
    }

    pub fn get_running(&self, id: &TaskId) -> Option<Arc<AllocatedTask>> {
        self.running
            .iter()
            .find(|e| e.value().persistent_task_id() == id)
            .map(|e| e.value().clone())
    }
}
