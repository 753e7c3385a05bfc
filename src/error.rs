//! Error taxonomy for persistent task coordination.
//!
//! Coordinator-side failures are values, not panics: they travel back to the
//! requester through the returned future, and across nodes inside the JSON body
//! of the transport reply (hence `Serialize`/`Deserialize`).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tasks::types::TaskId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum TaskError {
    /// A start request named an id that is already in the registry.
    #[error("persistent task with id [{0}] already exists")]
    DuplicateTask(TaskId),

    #[error("persistent task with id [{0}] not found")]
    TaskNotFound(TaskId),

    /// The requester holds an allocation that has since been replaced.
    /// Its work is obsolete and it should stop.
    #[error(
        "persistent task [{id}] is at allocation [{current}] but the request was made for allocation [{requested}]"
    )]
    StaleRequest {
        id: TaskId,
        requested: u64,
        current: u64,
    },

    /// A capability gate failed (for example local abort on a mixed-version cluster).
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("node closed while waiting for a cluster state change")]
    NodeClosed,

    #[error("task cancelled")]
    TaskCancelled,

    #[error("no persistent task executor registered for task name [{0}]")]
    UnknownTaskName(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("node [{0}] is not the elected coordinator")]
    NotCoordinator(String),

    #[error("transport failure: {0}")]
    Transport(String),
}

impl TaskError {
    /// True when the failure means the caller's allocation is no longer current.
    pub fn is_stale(&self) -> bool {
        matches!(self, TaskError::StaleRequest { .. })
    }
}

impl From<reqwest::Error> for TaskError {
    fn from(e: reqwest::Error) -> Self {
        TaskError::Transport(e.to_string())
    }
}
