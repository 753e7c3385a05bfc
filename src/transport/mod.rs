//! Transport Module
//!
//! Routes persistent task requests between nodes.
//!
//! - **`protocol`**: DTOs and endpoint paths.
//! - **`local`**: In-process routing between services living in one process.
//! - **`http`**: `reqwest` client with retry, backoff and jitter.
//! - **`handlers`**: `axum` handlers serving the HTTP side.
//! - **`publisher`**: Pushes cluster state changes from the coordinator to followers.

use async_trait::async_trait;

use crate::error::TaskError;
use crate::membership::types::NodeId;

pub mod handlers;
pub mod http;
pub mod local;
pub mod protocol;
pub mod publisher;

use protocol::{CoordinatorRequest, CoordinatorResponse, LocalCancelRequest};

#[async_trait]
pub trait ClusterTransport: Send + Sync {
    /// Delivers a request to the elected coordinator.
    async fn send_to_coordinator(
        &self,
        request: CoordinatorRequest,
    ) -> Result<CoordinatorResponse, TaskError>;

    /// Delivers a local cancellation to `node`. Returns whether a running
    /// allocation was cancelled.
    async fn send_to_node(
        &self,
        node: &NodeId,
        request: LocalCancelRequest,
    ) -> Result<bool, TaskError>;
}

#[cfg(test)]
mod tests;
