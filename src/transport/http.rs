use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use super::ClusterTransport;
use super::protocol::{
    CoordinatorRequest, CoordinatorResponse, ENDPOINT_COORDINATOR, ENDPOINT_LOCAL_CANCEL,
    ENDPOINT_PUBLISH_STATE, LocalCancelRequest, PublishStateRequest,
};
use crate::cluster::nodes::NodeInfo;
use crate::cluster::service::{ClusterStateService, PeerStateSource};
use crate::cluster::state::ClusterState;
use crate::error::TaskError;
use crate::membership::types::NodeId;

const DEFAULT_ATTEMPTS: usize = 3;

fn node_addr(node: &NodeInfo) -> Result<SocketAddr, TaskError> {
    node.http_addr.ok_or_else(|| {
        TaskError::Transport(format!("no HTTP address known for node [{}]", node.id))
    })
}

/// Sends requests to other nodes over HTTP, resolving addresses from the local
/// cluster state.
pub struct HttpTransport {
    http_client: reqwest::Client,
    cluster: Arc<ClusterStateService>,
    timeout: Duration,
    attempts: usize,
}

impl HttpTransport {
    pub fn new(cluster: Arc<ClusterStateService>, timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            http_client: reqwest::Client::new(),
            cluster,
            timeout,
            attempts: DEFAULT_ATTEMPTS,
        })
    }

    fn http_addr(&self, node: &NodeId) -> Result<SocketAddr, TaskError> {
        self.cluster
            .state()
            .nodes
            .get(node)
            .and_then(|n| n.http_addr)
            .ok_or_else(|| TaskError::Transport(format!("no HTTP address known for node [{node}]")))
    }

    async fn post_with_retry<T: serde::Serialize>(
        &self,
        url: String,
        payload: &T,
    ) -> Result<reqwest::Response, TaskError> {
        let mut delay_ms = 150u64;

        for attempt in 0..self.attempts {
            let response = self
                .http_client
                .post(url.clone())
                .json(payload)
                .timeout(self.timeout)
                .send()
                .await;

            match response {
                Ok(resp) => return Ok(resp),
                Err(e) => {
                    if attempt + 1 == self.attempts {
                        return Err(e.into());
                    }
                    tracing::debug!("POST {} failed (attempt {}): {}", url, attempt + 1, e);
                    // Jitter keeps retrying nodes from hitting the target in lockstep.
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(1200);
                }
            }
        }

        Err(TaskError::Transport("retry attempts exhausted".to_string()))
    }

    /// Decodes a `Result` body. Handlers send one for every status they produce.
    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, TaskError> {
        let status = response.status();
        match response.json::<Result<T, TaskError>>().await {
            Ok(result) => result,
            Err(e) => Err(TaskError::Transport(format!("undecodable response ({status}): {e}"))),
        }
    }

    /// Pushes a state change to a follower.
    ///
    /// Returns `false` when the follower rejected a diff because it is on a
    /// different base version; the caller should then send the full state.
    pub async fn publish(
        &self,
        node: &NodeInfo,
        request: &PublishStateRequest,
    ) -> Result<bool, TaskError> {
        let addr = node_addr(node)?;
        let response = self
            .post_with_retry(format!("http://{addr}{ENDPOINT_PUBLISH_STATE}"), request)
            .await?;

        match response.status() {
            status if status.is_success() => Ok(true),
            reqwest::StatusCode::CONFLICT => Ok(false),
            status => Err(TaskError::Transport(format!(
                "state publication to [{}] failed: {status}",
                node.id
            ))),
        }
    }
}

#[async_trait]
impl PeerStateSource for HttpTransport {
    async fn fetch_state(&self, node: &NodeInfo) -> Result<ClusterState, TaskError> {
        let addr = node_addr(node)?;
        let response = self
            .http_client
            .get(format!("http://{addr}{ENDPOINT_PUBLISH_STATE}"))
            .timeout(self.timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(TaskError::Transport(format!(
                "reading cluster state from [{}] failed: {}",
                node.id,
                response.status()
            )));
        }
        response.json().await.map_err(|e| {
            TaskError::Transport(format!("undecodable cluster state from [{}]: {e}", node.id))
        })
    }
}

#[async_trait]
impl ClusterTransport for HttpTransport {
    async fn send_to_coordinator(
        &self,
        request: CoordinatorRequest,
    ) -> Result<CoordinatorResponse, TaskError> {
        let master = self
            .cluster
            .state()
            .master_node
            .clone()
            .ok_or_else(|| TaskError::Transport("no elected coordinator".to_string()))?;
        let addr = self.http_addr(&master)?;

        let response = self
            .post_with_retry(format!("http://{addr}{ENDPOINT_COORDINATOR}"), &request)
            .await?;
        Self::decode(response).await
    }

    async fn send_to_node(
        &self,
        node: &NodeId,
        request: LocalCancelRequest,
    ) -> Result<bool, TaskError> {
        let addr = self.http_addr(node)?;
        let response = self
            .post_with_retry(format!("http://{addr}{ENDPOINT_LOCAL_CANCEL}"), &request)
            .await?;
        Self::decode(response).await
    }
}
