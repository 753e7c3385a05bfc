//! Local task tracking.
//!
//! Every running allocation occupies one slot here for as long as it runs. The
//! manager can cancel a slot, which trips the token handed out at registration.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

pub type LocalTaskId = u64;

struct TrackedTask {
    action: String,
    description: String,
    token: CancellationToken,
    cancel_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalTaskInfo {
    pub id: LocalTaskId,
    pub action: String,
    pub description: String,
    pub cancelled: bool,
}

#[derive(Default)]
pub struct LocalTaskManager {
    next_id: AtomicU64,
    tasks: DashMap<LocalTaskId, TrackedTask>,
}

impl LocalTaskManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, action: &str, description: String) -> (LocalTaskId, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();
        self.tasks.insert(
            id,
            TrackedTask {
                action: action.to_string(),
                description,
                token: token.clone(),
                cancel_reason: None,
            },
        );
        tracing::trace!("Registered local task {} [{}]", id, action);
        (id, token)
    }

    /// Returns false when the slot was already released.
    pub fn unregister(&self, id: LocalTaskId) -> bool {
        let removed = self.tasks.remove(&id).is_some();
        if removed {
            tracing::trace!("Unregistered local task {}", id);
        }
        removed
    }

    /// Cancels the slot. The first reason recorded wins.
    pub fn cancel(&self, id: LocalTaskId, reason: &str) -> bool {
        match self.tasks.get_mut(&id) {
            Some(mut task) => {
                if task.cancel_reason.is_none() {
                    task.cancel_reason = Some(reason.to_string());
                }
                task.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn cancel_reason(&self, id: LocalTaskId) -> Option<String> {
        self.tasks.get(&id).and_then(|t| t.cancel_reason.clone())
    }

    pub fn contains(&self, id: LocalTaskId) -> bool {
        self.tasks.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn list(&self) -> Vec<LocalTaskInfo> {
        let mut tasks: Vec<LocalTaskInfo> = self
            .tasks
            .iter()
            .map(|entry| LocalTaskInfo {
                id: *entry.key(),
                action: entry.action.clone(),
                description: entry.description.clone(),
                cancelled: entry.token.is_cancelled(),
            })
            .collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }
}
