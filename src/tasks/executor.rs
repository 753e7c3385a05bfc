//! Persistent Task Executor Registry
//!
//! Maps task names (e.g., "progress") to the code that validates, places and runs
//! them. The table is assembled once at startup through [`ExecutorRegistryBuilder`]
//! and is read-only afterwards, so lookups need no synchronisation.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::allocated::AllocatedTask;
use super::types::{Assignment, NO_NODE_FOUND_EXPLANATION, TaskRecord};
use crate::cluster::nodes::DiscoveryNodes;
use crate::error::TaskError;
use crate::membership::types::NodeId;

/// Type-erased body of one running task.
pub type ExecutionFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Closure form of a node operation, for executors registered with `register_fn`.
pub type TaskHandlerFn =
    Arc<dyn Fn(Arc<AllocatedTask>, Value, Option<Value>) -> ExecutionFuture + Send + Sync>;

/// What an executor sees when choosing a node: the live nodes and how many tasks
/// each one currently holds.
pub struct AssignmentContext<'a> {
    pub nodes: &'a DiscoveryNodes,
    pub load: BTreeMap<NodeId, usize>,
}

impl<'a> AssignmentContext<'a> {
    pub fn new<'r>(
        nodes: &'a DiscoveryNodes,
        tasks: impl Iterator<Item = &'r Arc<TaskRecord>>,
    ) -> Self {
        let mut load: BTreeMap<NodeId, usize> = nodes.ids().map(|id| (id.clone(), 0)).collect();
        for task in tasks {
            if let Some(node) = &task.assignment.executor_node
                && let Some(count) = load.get_mut(node)
            {
                *count += 1;
            }
        }
        Self { nodes, load }
    }

    /// Node with the fewest tasks, lowest id on ties.
    pub fn least_loaded(&self) -> Option<NodeId> {
        self.load
            .iter()
            .min_by_key(|(_, count)| **count)
            .map(|(id, _)| id.clone())
    }
}

pub fn select_least_loaded_node(ctx: &AssignmentContext<'_>) -> Assignment {
    match ctx.least_loaded() {
        Some(node) => Assignment::to_node(node),
        None => Assignment::unassigned(NO_NODE_FOUND_EXPLANATION),
    }
}

/// One kind of persistent task.
#[async_trait]
pub trait PersistentTaskExecutor: Send + Sync {
    fn task_name(&self) -> &str;

    fn validate_params(&self, _params: &Value) -> Result<(), TaskError> {
        Ok(())
    }

    fn select_assignment(&self, _params: &Value, ctx: &AssignmentContext<'_>) -> Assignment {
        select_least_loaded_node(ctx)
    }

    /// Runs the task on its assigned node.
    ///
    /// Implementations must poll `task.ensure_not_cancelled()` (or select on
    /// `task.cancelled()`) between units of work; cancellation is never preemptive.
    /// Returning `Ok` completes the task, returning `Err` fails it.
    async fn node_operation(
        &self,
        task: Arc<AllocatedTask>,
        params: Value,
        state: Option<Value>,
    ) -> Result<()>;
}

struct FnExecutor {
    name: String,
    handler: TaskHandlerFn,
}

#[async_trait]
impl PersistentTaskExecutor for FnExecutor {
    fn task_name(&self) -> &str {
        &self.name
    }

    async fn node_operation(
        &self,
        task: Arc<AllocatedTask>,
        params: Value,
        state: Option<Value>,
    ) -> Result<()> {
        (self.handler)(task, params, state).await
    }
}

#[derive(Default)]
pub struct ExecutorRegistryBuilder {
    executors: HashMap<String, Arc<dyn PersistentTaskExecutor>>,
    duplicates: Vec<String>,
}

impl ExecutorRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, executor: impl PersistentTaskExecutor + 'static) -> Self {
        let name = executor.task_name().to_string();
        if self.executors.insert(name.clone(), Arc::new(executor)).is_some() {
            self.duplicates.push(name);
        }
        self
    }

    /// Registers a closure under `task_name`, with default validation and placement.
    pub fn register_fn<F, Fut>(self, task_name: &str, handler: F) -> Self
    where
        F: Fn(Arc<AllocatedTask>, Value, Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        // Box::pin erases the concrete future so different closures share one map.
        let handler: TaskHandlerFn = Arc::new(move |task, params, state| {
            Box::pin(handler(task, params, state)) as ExecutionFuture
        });
        self.register(FnExecutor {
            name: task_name.to_string(),
            handler,
        })
    }

    /// Freezes the table. Registering two executors under one name is an error.
    pub fn build(self) -> Result<Arc<ExecutorRegistry>> {
        if !self.duplicates.is_empty() {
            anyhow::bail!(
                "persistent task executors registered more than once: {:?}",
                self.duplicates
            );
        }
        for name in self.executors.keys() {
            tracing::info!("Registered persistent task executor: {}", name);
        }
        Ok(Arc::new(ExecutorRegistry {
            executors: self.executors,
        }))
    }
}

pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn PersistentTaskExecutor>>,
}

impl ExecutorRegistry {
    pub fn get(&self, task_name: &str) -> Result<&Arc<dyn PersistentTaskExecutor>, TaskError> {
        self.executors
            .get(task_name)
            .ok_or_else(|| TaskError::UnknownTaskName(task_name.to_string()))
    }

    pub fn validate_params(&self, task_name: &str, params: &Value) -> Result<(), TaskError> {
        self.get(task_name)?.validate_params(params)
    }

    /// Unknown task names can never be placed, so they stay unassigned.
    pub fn select_assignment(
        &self,
        task_name: &str,
        params: &Value,
        ctx: &AssignmentContext<'_>,
    ) -> Assignment {
        match self.get(task_name) {
            Ok(executor) => executor.select_assignment(params, ctx),
            Err(e) => Assignment::unassigned(e.to_string()),
        }
    }

    pub fn create_execution(
        &self,
        record: &TaskRecord,
        task: Arc<AllocatedTask>,
    ) -> Result<ExecutionFuture, TaskError> {
        let executor = self.get(&record.task_name)?.clone();
        let params = record.params.clone();
        let state = record.state.clone();

        tracing::debug!(
            "Creating execution for [{}] with executor '{}' (allocation {})",
            record.id,
            record.task_name,
            record.allocation_id
        );

        Ok(Box::pin(async move { executor.node_operation(task, params, state).await }))
    }

    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.executors.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_executor(&self, task_name: &str) -> bool {
        self.executors.contains_key(task_name)
    }

    pub fn len(&self) -> usize {
        self.executors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}
