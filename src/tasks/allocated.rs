//! Local execution handle of one persistent task allocation.
//!
//! State machine, held in a single `AtomicU8`:
//!
//! ```text
//! STARTED --cancel--> PENDING_CANCEL
//! STARTED --complete/fail/abort--> COMPLETED
//! PENDING_CANCEL --complete/fail/abort--> COMPLETED
//! ```
//!
//! COMPLETED is terminal. Only the caller that wins the transition into COMPLETED
//! releases the local tracking slot and reports completion to the coordinator.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::client::{TaskClient, WaitOutcome};
use super::tracking::{LocalTaskId, LocalTaskManager};
use super::types::{TaskId, TaskRecord};
use crate::error::TaskError;

/// Reason used for cancellations that should not be reported as failures.
pub const DEFAULT_CANCEL_REASON: &str = "by user request";

pub(crate) const UNASSIGNED_CANCEL_REASON: &str =
    "task has been removed or reassigned, cancelling locally";

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocatedTaskState {
    Started = 0,
    PendingCancel = 1,
    Completed = 2,
}

impl AllocatedTaskState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => AllocatedTaskState::Started,
            1 => AllocatedTaskState::PendingCancel,
            _ => AllocatedTaskState::Completed,
        }
    }
}

struct Cancellation {
    reason: String,
    notify_coordinator: bool,
}

pub struct AllocatedTask {
    persistent_task_id: TaskId,
    allocation_id: u64,
    task_name: String,
    local_id: LocalTaskId,
    state: AtomicU8,
    token: CancellationToken,
    cancellation: Mutex<Option<Cancellation>>,
    failure: OnceLock<String>,
    client: TaskClient,
    task_manager: Arc<LocalTaskManager>,
}

impl AllocatedTask {
    /// Registers the allocation with the local task manager and returns the handle.
    pub fn new(
        record: &TaskRecord,
        client: TaskClient,
        task_manager: Arc<LocalTaskManager>,
    ) -> Arc<Self> {
        let (local_id, token) = task_manager.register(
            &format!("persistent_task[{}]", record.task_name),
            format!("id={}, allocation={}", record.id, record.allocation_id),
        );
        Arc::new(Self {
            persistent_task_id: record.id.clone(),
            allocation_id: record.allocation_id,
            task_name: record.task_name.clone(),
            local_id,
            state: AtomicU8::new(AllocatedTaskState::Started as u8),
            token,
            cancellation: Mutex::new(None),
            failure: OnceLock::new(),
            client,
            task_manager,
        })
    }

    pub fn persistent_task_id(&self) -> &TaskId {
        &self.persistent_task_id
    }

    pub fn allocation_id(&self) -> u64 {
        self.allocation_id
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn local_id(&self) -> LocalTaskId {
        self.local_id
    }

    pub fn state(&self) -> AllocatedTaskState {
        AllocatedTaskState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_completed(&self) -> bool {
        self.state() == AllocatedTaskState::Completed
    }

    /// Failure reported to the coordinator, if any.
    pub fn failure(&self) -> Option<&str> {
        self.failure.get().map(String::as_str)
    }

    pub fn cancellation_reason(&self) -> Option<String> {
        self.cancellation.lock().as_ref().map(|c| c.reason.clone())
    }

    /// STARTED -> PENDING_CANCEL. False means completion already won the race.
    pub fn mark_as_cancelled(&self) -> bool {
        self.state
            .compare_exchange(
                AllocatedTaskState::Started as u8,
                AllocatedTaskState::PendingCancel as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Cancels on behalf of a user or the coordinator. Completion is still reported.
    pub fn cancel(&self, reason: &str) -> bool {
        self.request_cancel(reason, true)
    }

    /// Cancels because the record was removed or moved elsewhere. The coordinator
    /// has already moved on, so completion is not reported.
    pub fn cancel_unassigned(&self) -> bool {
        self.request_cancel(UNASSIGNED_CANCEL_REASON, false)
    }

    fn request_cancel(&self, reason: &str, notify_coordinator: bool) -> bool {
        // Held across the transition so a concurrent completion that observes
        // PENDING_CANCEL also observes the reason.
        let mut cancellation = self.cancellation.lock();
        if !self.mark_as_cancelled() {
            trace!(
                "Cancellation of [{}] ignored, task is already {:?}",
                self.persistent_task_id,
                self.state()
            );
            return false;
        }
        *cancellation = Some(Cancellation {
            reason: reason.to_string(),
            notify_coordinator,
        });
        drop(cancellation);

        debug!("Cancelling persistent task [{}]: {}", self.persistent_task_id, reason);
        self.task_manager.cancel(self.local_id, reason);
        self.token.cancel();
        true
    }

    pub fn mark_as_completed(&self) -> bool {
        self.complete_and_notify(None, None)
    }

    pub fn mark_as_failed(&self, error: anyhow::Error) -> bool {
        self.complete_and_notify(Some(format!("{error:#}")), None)
    }

    /// Completes without failing, asking the coordinator to place the task again.
    pub fn mark_as_locally_aborted(&self, reason: &str) -> Result<bool, TaskError> {
        self.client.validate_local_abort_supported()?;
        Ok(self.complete_and_notify(None, Some(reason.to_string())))
    }

    fn complete_and_notify(
        &self,
        failure: Option<String>,
        local_abort_reason: Option<String>,
    ) -> bool {
        let completed = AllocatedTaskState::Completed as u8;
        let previous = match self.state.fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
            (s != completed).then_some(completed)
        }) {
            Ok(previous) => AllocatedTaskState::from_u8(previous),
            Err(_) => {
                warn!(
                    "Attempt to complete task [{}] with allocation [{}] in state [Completed]",
                    self.persistent_task_id, self.allocation_id
                );
                return false;
            }
        };

        self.task_manager.unregister(self.local_id);

        let (notify, cancel_reason) = match previous {
            AllocatedTaskState::PendingCancel => match &*self.cancellation.lock() {
                Some(c) => (c.notify_coordinator, Some(c.reason.clone())),
                None => (true, None),
            },
            _ => (true, None),
        };

        let failure = match (previous, failure) {
            (AllocatedTaskState::PendingCancel, Some(f))
                if cancel_reason.as_deref().is_none_or(|r| r == DEFAULT_CANCEL_REASON) =>
            {
                debug!(
                    "Persistent task [{}] failed after user cancellation, reporting normal completion: {}",
                    self.persistent_task_id, f
                );
                None
            }
            (_, failure) => failure,
        };

        if let Some(f) = &failure {
            warn!(
                "Persistent task [{}] with allocation [{}] failed: {}",
                self.persistent_task_id, self.allocation_id, f
            );
            let _ = self.failure.set(f.clone());
        }

        if !notify {
            debug!(
                "Persistent task [{}] completed locally after unassignment, not notifying coordinator",
                self.persistent_task_id
            );
            return true;
        }

        let client = self.client.clone();
        let id = self.persistent_task_id.clone();
        let allocation_id = self.allocation_id;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    match client
                        .send_completion_request(&id, allocation_id, failure, local_abort_reason)
                        .await
                    {
                        Ok(_) => trace!("Completion of [{}] acknowledged", id),
                        Err(e @ (TaskError::StaleRequest { .. } | TaskError::TaskNotFound(_))) => {
                            debug!("Completion of [{}] no longer relevant: {}", id, e)
                        }
                        Err(e) => warn!("Notification for task [{}] failed: {}", id, e),
                    }
                });
            }
            Err(_) => warn!("No runtime available to report completion of [{}]", id),
        }
        true
    }

    pub async fn update_persistent_task_state(
        &self,
        state: Value,
    ) -> Result<Arc<TaskRecord>, TaskError> {
        self.client
            .send_update_state_request(&self.persistent_task_id, self.allocation_id, Some(state))
            .await
    }

    pub async fn wait_for_persistent_task<F>(
        &self,
        predicate: F,
        timeout: Duration,
    ) -> Result<WaitOutcome<Option<Arc<TaskRecord>>>, TaskError>
    where
        F: Fn(Option<&TaskRecord>) -> bool + Send,
    {
        self.client
            .wait_for_persistent_task_condition(&self.persistent_task_id, predicate, timeout)
            .await
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.state() == AllocatedTaskState::PendingCancel
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// Polling point for executors.
    pub fn ensure_not_cancelled(&self) -> anyhow::Result<()> {
        if self.is_cancelled() {
            return Err(TaskError::TaskCancelled.into());
        }
        Ok(())
    }
}

impl std::fmt::Debug for AllocatedTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocatedTask")
            .field("persistent_task_id", &self.persistent_task_id)
            .field("allocation_id", &self.allocation_id)
            .field("task_name", &self.task_name)
            .field("state", &self.state())
            .finish()
    }
}
