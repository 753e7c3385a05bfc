use std::sync::Arc;
use tracing::{debug, trace};

use super::http::HttpTransport;
use super::protocol::PublishStateRequest;
use crate::cluster::service::ClusterStateService;
use crate::cluster::state::ClusterState;
use crate::membership::types::NodeId;

/// Pushes every new cluster state from the elected master to the other nodes.
///
/// Sends a diff against the previously published version and falls back to the
/// full state for followers that are on another base version.
pub async fn run_state_publisher(
    cluster: Arc<ClusterStateService>,
    transport: Arc<HttpTransport>,
    local: NodeId,
) {
    let mut rx = cluster.subscribe();
    let closed = cluster.closed_token();
    let mut previous = rx.borrow_and_update().clone();

    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            changed = rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = rx.borrow_and_update().clone();
                if current.is_master(&local) {
                    publish(&transport, &local, &previous, &current).await;
                }
                previous = current;
            }
        }
    }
}

async fn publish(
    transport: &HttpTransport,
    local: &NodeId,
    previous: &ClusterState,
    current: &ClusterState,
) {
    let diff = PublishStateRequest::Diff(current.diff(previous));
    let mut full = None;

    for node in current.nodes.iter().filter(|n| &n.id != local) {
        match transport.publish(node, &diff).await {
            Ok(true) => trace!("Published version {} to [{}]", current.version, node.id),
            Ok(false) => {
                let full = full.get_or_insert_with(|| PublishStateRequest::Full(current.clone()));
                if let Err(e) = transport.publish(node, full).await {
                    debug!("Full state publication to [{}] failed: {}", node.id, e);
                }
            }
            Err(e) => debug!("State publication to [{}] failed: {}", node.id, e),
        }
    }
}
