//! The replicated map of persistent tasks.
//!
//! A `TaskRegistry` is an immutable snapshot. Every mutation goes through a
//! [`TaskRegistryBuilder`] and yields a new snapshot; records that were not touched
//! are shared with the previous snapshot through `Arc`, which keeps diffing cheap.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::types::{Assignment, CompletionPolicy, TaskId, TaskRecord};
use crate::error::TaskError;
use crate::membership::types::NodeId;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskRegistry {
    next_allocation_id: u64,
    tasks: BTreeMap<TaskId, Arc<TaskRecord>>,
}

impl TaskRegistry {
    pub fn get(&self, id: &TaskId) -> Option<&Arc<TaskRecord>> {
        self.tasks.get(id)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Arc<TaskRecord>> {
        self.tasks.values()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn next_allocation_id(&self) -> u64 {
        self.next_allocation_id
    }

    pub fn tasks_assigned_to<'a>(
        &'a self,
        node: &'a NodeId,
    ) -> impl Iterator<Item = &'a Arc<TaskRecord>> {
        self.tasks.values().filter(move |t| t.assignment.is_assigned_to(node))
    }

    pub fn builder(&self) -> TaskRegistryBuilder {
        TaskRegistryBuilder {
            next_allocation_id: self.next_allocation_id,
            tasks: self.tasks.clone(),
            changed: false,
        }
    }

    pub fn add_task(
        &self,
        id: TaskId,
        task_name: impl Into<String>,
        params: Value,
        assignment: Assignment,
    ) -> Result<TaskRegistry, TaskError> {
        let mut builder = self.builder();
        builder.add_task(id, task_name, params, assignment)?;
        Ok(builder.build())
    }

    pub fn reassign_task(
        &self,
        id: &TaskId,
        assignment: Assignment,
    ) -> Result<TaskRegistry, TaskError> {
        let mut builder = self.builder();
        builder.reassign_task(id, assignment)?;
        Ok(builder.build())
    }

    pub fn update_task_state(
        &self,
        id: &TaskId,
        allocation_id: u64,
        state: Option<Value>,
    ) -> Result<TaskRegistry, TaskError> {
        let mut builder = self.builder();
        builder.update_task_state(id, allocation_id, state)?;
        Ok(builder.build())
    }

    pub fn remove_task(&self, id: &TaskId) -> Result<TaskRegistry, TaskError> {
        let mut builder = self.builder();
        builder.remove_task(id)?;
        Ok(builder.build())
    }

    pub fn complete_task(
        &self,
        id: &TaskId,
        allocation_id: u64,
        failure: Option<String>,
        local_abort_reason: Option<String>,
        policy: CompletionPolicy,
    ) -> Result<TaskRegistry, TaskError> {
        let mut builder = self.builder();
        builder.complete_task(id, allocation_id, failure, local_abort_reason, policy)?;
        Ok(builder.build())
    }

    /// Records that differ from `previous`, plus ids that disappeared.
    pub fn diff(&self, previous: &TaskRegistry) -> RegistryDiff {
        let upserted = self
            .tasks
            .iter()
            .filter(|(id, record)| match previous.tasks.get(*id) {
                Some(old) => !Arc::ptr_eq(old, record) && old != *record,
                None => true,
            })
            .map(|(_, record)| record.clone())
            .collect();

        let removed = previous
            .tasks
            .keys()
            .filter(|id| !self.tasks.contains_key(*id))
            .cloned()
            .collect();

        RegistryDiff {
            next_allocation_id: self.next_allocation_id,
            upserted,
            removed,
        }
    }
}

/// Structural difference between two registry snapshots, keyed by task id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryDiff {
    pub next_allocation_id: u64,
    pub upserted: Vec<Arc<TaskRecord>>,
    pub removed: Vec<TaskId>,
}

impl RegistryDiff {
    pub fn is_empty(&self) -> bool {
        self.upserted.is_empty() && self.removed.is_empty()
    }

    pub fn apply(&self, base: &TaskRegistry) -> TaskRegistry {
        let mut tasks = base.tasks.clone();
        for id in &self.removed {
            tasks.remove(id);
        }
        for record in &self.upserted {
            tasks.insert(record.id.clone(), record.clone());
        }
        TaskRegistry {
            next_allocation_id: self.next_allocation_id,
            tasks,
        }
    }
}

/// Mutable staging area for a new registry snapshot.
///
/// Every operation validates that the task exists (or, for `add_task`, that it
/// does not) and flips `changed` when it actually modified something.
#[derive(Debug, Clone)]
pub struct TaskRegistryBuilder {
    next_allocation_id: u64,
    tasks: BTreeMap<TaskId, Arc<TaskRecord>>,
    changed: bool,
}

impl TaskRegistryBuilder {
    pub fn get(&self, id: &TaskId) -> Option<&Arc<TaskRecord>> {
        self.tasks.get(id)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Arc<TaskRecord>> {
        self.tasks.values()
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    fn allocate(&mut self) -> u64 {
        let id = self.next_allocation_id;
        self.next_allocation_id += 1;
        id
    }

    fn existing(&self, id: &TaskId) -> Result<&Arc<TaskRecord>, TaskError> {
        self.tasks.get(id).ok_or_else(|| TaskError::TaskNotFound(id.clone()))
    }

    fn validate_assignment(id: &TaskId, assignment: &Assignment) -> Result<(), TaskError> {
        if !assignment.is_assigned() && assignment.explanation.is_empty() {
            return Err(TaskError::InvalidRequest(format!(
                "unassigned persistent task [{id}] requires an explanation"
            )));
        }
        Ok(())
    }

    pub fn add_task(
        &mut self,
        id: TaskId,
        task_name: impl Into<String>,
        params: Value,
        assignment: Assignment,
    ) -> Result<&mut Self, TaskError> {
        if self.tasks.contains_key(&id) {
            return Err(TaskError::DuplicateTask(id));
        }
        Self::validate_assignment(&id, &assignment)?;

        let allocation_id = self.allocate();
        let record = TaskRecord {
            id: id.clone(),
            task_name: task_name.into(),
            params,
            state: None,
            assignment,
            allocation_id,
            allocation_id_on_last_state_update: None,
            failure: None,
        };
        self.tasks.insert(id, Arc::new(record));
        self.changed = true;
        Ok(self)
    }

    /// Moves the task to a new assignment under a fresh allocation id.
    pub fn reassign_task(
        &mut self,
        id: &TaskId,
        assignment: Assignment,
    ) -> Result<&mut Self, TaskError> {
        Self::validate_assignment(id, &assignment)?;
        let mut record = TaskRecord::clone(self.existing(id)?);

        record.assignment = assignment;
        record.allocation_id = self.allocate();
        self.tasks.insert(id.clone(), Arc::new(record));
        self.changed = true;
        Ok(self)
    }

    /// Does not check `allocation_id` against the record; callers do that.
    pub fn update_task_state(
        &mut self,
        id: &TaskId,
        allocation_id: u64,
        state: Option<Value>,
    ) -> Result<&mut Self, TaskError> {
        let current = self.existing(id)?;
        if current.state == state
            && current.allocation_id_on_last_state_update == Some(allocation_id)
        {
            return Ok(self);
        }

        let mut record = TaskRecord::clone(current);
        record.state = state;
        record.allocation_id_on_last_state_update = Some(allocation_id);
        self.tasks.insert(id.clone(), Arc::new(record));
        self.changed = true;
        Ok(self)
    }

    pub fn remove_task(&mut self, id: &TaskId) -> Result<&mut Self, TaskError> {
        if self.tasks.remove(id).is_none() {
            return Err(TaskError::TaskNotFound(id.clone()));
        }
        self.changed = true;
        Ok(self)
    }

    pub fn complete_task(
        &mut self,
        id: &TaskId,
        allocation_id: u64,
        failure: Option<String>,
        local_abort_reason: Option<String>,
        policy: CompletionPolicy,
    ) -> Result<&mut Self, TaskError> {
        if failure.is_some() && local_abort_reason.is_some() {
            return Err(TaskError::InvalidRequest(format!(
                "completion of persistent task [{id}] cannot carry both a failure and a local abort reason"
            )));
        }
        self.existing(id)?;

        match (failure, local_abort_reason) {
            (None, Some(reason)) => {
                tracing::debug!(task = %id, allocation_id, "task locally aborted: {}", reason);
                let explanation = format!("task locally aborted: {reason}");
                self.reassign_task(id, Assignment::unassigned(explanation))
            }
            (Some(failure), None) if policy == CompletionPolicy::RetainFailed => {
                tracing::debug!(task = %id, allocation_id, "task failed, retaining: {}", failure);
                let mut record = TaskRecord::clone(self.existing(id)?);
                record.assignment = Assignment::unassigned(format!("task failed: {failure}"));
                record.failure = Some(failure);
                record.allocation_id = self.allocate();
                self.tasks.insert(id.clone(), Arc::new(record));
                self.changed = true;
                Ok(self)
            }
            _ => self.remove_task(id),
        }
    }

    pub fn build(self) -> TaskRegistry {
        TaskRegistry {
            next_allocation_id: self.next_allocation_id,
            tasks: self.tasks,
        }
    }
}
