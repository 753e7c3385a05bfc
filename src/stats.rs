//! Cluster-wide persistent task statistics.
//!
//! Computed from a cluster state snapshot through the single-object cache, so
//! concurrent requests for the same cluster version share one computation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::cache::single_object::{
    CancellableSingleObjectCache, CancellationCheck, SingleObjectRefresh,
};
use crate::cluster::state::ClusterState;
use crate::membership::types::NodeId;

/// Tasks examined between two cancellation checks.
const CHECK_EVERY: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub cluster_version: u64,
    pub total: usize,
    pub assigned: usize,
    pub unassigned: usize,
    pub failed: usize,
    pub per_node: BTreeMap<NodeId, usize>,
    pub per_task_name: BTreeMap<String, usize>,
}

/// Keyed by cluster state version: a newer version is never fresh for an older value.
#[derive(Debug, Default)]
pub struct TaskStatsRefresher;

#[async_trait]
impl SingleObjectRefresh for TaskStatsRefresher {
    type Input = Arc<ClusterState>;
    type Key = u64;
    type Value = TaskStats;

    fn key_of(&self, input: &Self::Input) -> u64 {
        input.version
    }

    async fn refresh(
        &self,
        state: Arc<ClusterState>,
        check: CancellationCheck,
    ) -> anyhow::Result<TaskStats> {
        let mut stats = TaskStats {
            cluster_version: state.version,
            ..TaskStats::default()
        };

        for (i, task) in state.tasks.tasks().enumerate() {
            if i % CHECK_EVERY == 0 {
                check.ensure_not_cancelled()?;
                tokio::task::yield_now().await;
            }

            stats.total += 1;
            *stats.per_task_name.entry(task.task_name.clone()).or_default() += 1;
            if task.is_failed() {
                stats.failed += 1;
            }
            match &task.assignment.executor_node {
                Some(node) => {
                    stats.assigned += 1;
                    *stats.per_node.entry(node.clone()).or_default() += 1;
                }
                None => stats.unassigned += 1,
            }
        }

        tracing::debug!(
            "Computed task stats for cluster version {}: {} tasks",
            stats.cluster_version,
            stats.total
        );
        Ok(stats)
    }
}

pub type TaskStatsCache = CancellableSingleObjectCache<TaskStatsRefresher>;

pub fn task_stats_cache() -> TaskStatsCache {
    CancellableSingleObjectCache::new(TaskStatsRefresher)
}
