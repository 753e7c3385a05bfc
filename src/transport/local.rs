use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};

use super::ClusterTransport;
use super::protocol::{CoordinatorRequest, CoordinatorResponse, LocalCancelRequest};
use crate::cluster::nodes::NodeInfo;
use crate::cluster::service::{ClusterStateService, PeerStateSource};
use crate::cluster::state::ClusterState;
use crate::error::TaskError;
use crate::membership::types::NodeId;
use crate::tasks::coordinator::CoordinatorService;
use crate::tasks::node_service::PersistentTasksNodeService;

/// Routes requests to services living in the same process.
///
/// Holds only `Weak` handles: services hold the transport, never the other way round.
#[derive(Default)]
pub struct InProcessTransport {
    coordinator: RwLock<Option<Weak<CoordinatorService>>>,
    nodes: DashMap<NodeId, Weak<PersistentTasksNodeService>>,
    states: DashMap<NodeId, Weak<ClusterStateService>>,
}

impl InProcessTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_coordinator(&self, coordinator: &Arc<CoordinatorService>) {
        *self.coordinator.write() = Some(Arc::downgrade(coordinator));
    }

    pub fn register_node(&self, service: &Arc<PersistentTasksNodeService>) {
        self.nodes
            .insert(service.local_node().clone(), Arc::downgrade(service));
    }

    /// Makes `cluster` readable as the state held by `node`.
    pub fn register_state(&self, node: NodeId, cluster: &Arc<ClusterStateService>) {
        self.states.insert(node, Arc::downgrade(cluster));
    }
}

#[async_trait]
impl PeerStateSource for InProcessTransport {
    async fn fetch_state(&self, node: &NodeInfo) -> Result<ClusterState, TaskError> {
        let cluster = self
            .states
            .get(&node.id)
            .and_then(|entry| entry.value().upgrade())
            .ok_or_else(|| TaskError::Transport(format!("node [{}] is not reachable", node.id)))?;
        Ok(ClusterState::clone(&cluster.state()))
    }
}

#[async_trait]
impl ClusterTransport for InProcessTransport {
    async fn send_to_coordinator(
        &self,
        request: CoordinatorRequest,
    ) -> Result<CoordinatorResponse, TaskError> {
        let coordinator = self
            .coordinator
            .read()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| TaskError::Transport("no coordinator registered".to_string()))?;
        coordinator.handle(request).await
    }

    async fn send_to_node(
        &self,
        node: &NodeId,
        request: LocalCancelRequest,
    ) -> Result<bool, TaskError> {
        let service = self
            .nodes
            .get(node)
            .and_then(|entry| entry.value().upgrade())
            .ok_or_else(|| TaskError::Transport(format!("node [{node}] is not reachable")))?;
        Ok(service.cancel_local(&request))
    }
}
