//! Built-in executors.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::allocated::AllocatedTask;
use super::executor::PersistentTaskExecutor;
use crate::error::TaskError;

pub const PROGRESS_TASK_NAME: &str = "progress";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressParams {
    pub steps: u64,
    #[serde(default = "default_step_millis")]
    pub step_millis: u64,
}

fn default_step_millis() -> u64 {
    100
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressState {
    pub completed_steps: u64,
}

/// Counts through `steps` units of work, checkpointing after each one.
///
/// A reassigned task resumes from the last checkpoint rather than from zero.
/// Cancellation is checked before every step.
pub struct ProgressExecutor;

#[async_trait]
impl PersistentTaskExecutor for ProgressExecutor {
    fn task_name(&self) -> &str {
        PROGRESS_TASK_NAME
    }

    fn validate_params(&self, params: &Value) -> Result<(), TaskError> {
        let params: ProgressParams = serde_json::from_value(params.clone())
            .map_err(|e| TaskError::InvalidRequest(format!("invalid progress params: {e}")))?;
        if params.steps == 0 {
            return Err(TaskError::InvalidRequest("progress task needs at least one step".into()));
        }
        Ok(())
    }

    async fn node_operation(
        &self,
        task: Arc<AllocatedTask>,
        params: Value,
        state: Option<Value>,
    ) -> Result<()> {
        let params: ProgressParams = serde_json::from_value(params)?;
        let mut progress: ProgressState = match state {
            Some(state) => serde_json::from_value(state)?,
            None => ProgressState::default(),
        };

        if progress.completed_steps > 0 {
            tracing::info!(
                "Resuming [{}] at step {}/{}",
                task.persistent_task_id(),
                progress.completed_steps,
                params.steps
            );
        }

        while progress.completed_steps < params.steps {
            task.ensure_not_cancelled()?;
            tokio::select! {
                _ = task.cancelled() => return Err(TaskError::TaskCancelled.into()),
                _ = tokio::time::sleep(Duration::from_millis(params.step_millis)) => {}
            }
            progress.completed_steps += 1;
            task.update_persistent_task_state(serde_json::to_value(&progress)?)
                .await?;
        }

        tracing::info!("[{}] finished {} steps", task.persistent_task_id(), params.steps);
        Ok(())
    }
}
