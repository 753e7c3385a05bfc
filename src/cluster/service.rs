use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::nodes::{ClusterMembership, DiscoveryNodes, NodeInfo};
use super::state::{ClusterState, ClusterStateDiff};
use crate::error::TaskError;
use crate::membership::types::NodeId;

/// Reads the cluster state another node currently holds.
///
/// A node taking over as master asks its peers first, so it continues from the
/// freshest registry rather than from its own snapshot.
#[async_trait]
pub trait PeerStateSource: Send + Sync {
    async fn fetch_state(&self, node: &NodeInfo) -> Result<ClusterState, TaskError>;
}

/// Holds the node's current cluster state and serialises every change to it.
///
/// On the coordinator, `submit_update` is the only writer. Followers receive
/// snapshots through `apply_published` / `apply_diff`. Either way, subscribers see
/// versions in one increasing order.
pub struct ClusterStateService {
    state_tx: watch::Sender<Arc<ClusterState>>,
    update_lock: Mutex<()>,
    closed: CancellationToken,
}

impl ClusterStateService {
    pub fn new() -> Arc<Self> {
        Self::with_state(ClusterState::default())
    }

    pub fn with_state(state: ClusterState) -> Arc<Self> {
        let (state_tx, _) = watch::channel(Arc::new(state));
        Arc::new(Self {
            state_tx,
            update_lock: Mutex::new(()),
            closed: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> Arc<ClusterState> {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ClusterState>> {
        self.state_tx.subscribe()
    }

    /// Applies `update` to the latest snapshot and publishes the result.
    ///
    /// The closure always runs against the newest committed state, so a mutation
    /// computed concurrently elsewhere can never be overwritten. An update that
    /// changes nothing returns the current snapshot without bumping the version.
    pub async fn submit_update<F>(
        &self,
        source: &str,
        update: F,
    ) -> Result<Arc<ClusterState>, TaskError>
    where
        F: FnOnce(&ClusterState) -> Result<ClusterState, TaskError> + Send,
    {
        if self.is_closed() {
            return Err(TaskError::NodeClosed);
        }
        let _guard = self.update_lock.lock().await;
        if self.is_closed() {
            return Err(TaskError::NodeClosed);
        }

        let current = self.state();
        let mut next = match update(&current) {
            Ok(next) => next,
            Err(e) => {
                debug!(source, "cluster state update rejected: {}", e);
                return Err(e);
            }
        };

        if next.same_content(&current) {
            trace!(source, version = current.version, "cluster state unchanged");
            return Ok(current);
        }

        // An adopted peer snapshot may already be ahead of the local one.
        next.version = current.version.max(next.version) + 1;
        let next = Arc::new(next);
        self.state_tx.send_replace(next.clone());
        debug!(source, version = next.version, "cluster state updated");
        Ok(next)
    }

    /// Installs a full snapshot received from the coordinator.
    ///
    /// A snapshot from a later term replaces the local one whatever its version;
    /// anything not newer by `(term, version)` is ignored.
    pub async fn apply_published(&self, state: ClusterState) -> bool {
        let _guard = self.update_lock.lock().await;
        let current = self.state();
        if state.freshness() <= current.freshness() {
            trace!(
                received = ?state.freshness(),
                local = ?current.freshness(),
                "ignoring old cluster state"
            );
            return false;
        }
        debug!(term = state.term, version = state.version, "applied published cluster state");
        self.state_tx.send_replace(Arc::new(state));
        true
    }

    /// Applies a diff on top of the local snapshot.
    ///
    /// Fails when the diff was computed against a different base; the publisher
    /// then falls back to a full snapshot.
    pub async fn apply_diff(&self, diff: ClusterStateDiff) -> Result<bool, TaskError> {
        let _guard = self.update_lock.lock().await;
        let current = self.state();
        if (diff.term, diff.to_version) <= current.freshness() {
            return Ok(false);
        }
        let next = diff.apply(&current)?;
        debug!(version = next.version, "applied cluster state diff");
        self.state_tx.send_replace(Arc::new(next));
        Ok(true)
    }

    /// Refreshes the node set from membership when the local node is the elected master.
    ///
    /// A node that was not master in its current snapshot starts a new term. It
    /// first adopts the freshest state held by any reachable peer, so the task
    /// registry survives the change of master.
    pub async fn sync_topology(
        &self,
        membership: &dyn ClusterMembership,
        peers: &dyn PeerStateSource,
    ) -> Result<Option<Arc<ClusterState>>, TaskError> {
        let local = membership.local_node_id();
        let nodes = DiscoveryNodes::new(membership.live_nodes());
        let master = nodes.elect_master();
        if master.as_ref() != Some(&local) {
            return Ok(None);
        }

        let recovered = if self.state().is_master(&local) {
            Vec::new()
        } else {
            collect_peer_states(peers, &nodes, &local).await
        };

        self.submit_update("sync-topology", move |state| {
            if state.is_master(&local) {
                return Ok(state.with_nodes(nodes, master));
            }
            let term = recovered.iter().fold(state.term, |term, peer| term.max(peer.term)) + 1;
            let freshest = recovered
                .into_iter()
                .filter(|peer| peer.freshness() > state.freshness())
                .max_by_key(ClusterState::freshness);
            if let Some(peer) = &freshest {
                info!(
                    term = peer.term,
                    version = peer.version,
                    tasks = peer.tasks.len(),
                    "adopting cluster state held by a peer"
                );
            }
            let base = freshest.as_ref().unwrap_or(state);
            info!(term, "[{}] taking over as master", local);
            Ok(ClusterState {
                term,
                ..base.with_nodes(nodes, master)
            })
        })
        .await
        .map(Some)
    }

    pub async fn run_topology_sync(
        self: Arc<Self>,
        membership: Arc<dyn ClusterMembership>,
        peers: Arc<dyn PeerStateSource>,
        every: Duration,
    ) {
        let mut interval = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = self.closed.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(e) = self.sync_topology(membership.as_ref(), peers.as_ref()).await {
                        debug!("topology sync skipped: {}", e);
                    }
                }
            }
        }
    }

    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            info!("Closing cluster state service");
        }
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub fn closed_token(&self) -> CancellationToken {
        self.closed.clone()
    }
}

async fn collect_peer_states(
    peers: &dyn PeerStateSource,
    nodes: &DiscoveryNodes,
    local: &NodeId,
) -> Vec<ClusterState> {
    let mut states = Vec::new();
    for node in nodes.iter().filter(|n| &n.id != local) {
        match peers.fetch_state(node).await {
            Ok(state) => states.push(state),
            Err(e) => warn!("Could not read cluster state from [{}]: {}", node.id, e),
        }
    }
    states
}
