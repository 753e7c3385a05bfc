//! Persistent Task Cluster Library
//!
//! Tracks long-running, resumable units of work ("persistent tasks") across a
//! cluster so they survive node failures, coordinator changes and topology churn.
//! It serves as the foundation for the binary executable (`main.rs`).
//!
//! ## Architecture Modules
//!
//! - **`membership`**: UDP gossip (SWIM-like) discovery and failure detection. Supplies
//!   the live node set and each node's protocol version.
//! - **`cluster`**: The versioned cluster state (nodes, elected master, task registry)
//!   and the single-writer service that publishes it to subscribers.
//! - **`tasks`**: Registry, coordinator, per-node execution handles, client façade,
//!   executor table and the per-node reconciler.
//! - **`transport`**: In-process and HTTP routing of coordinator requests, local
//!   cancellations and state publication.
//! - **`cache`**: Single-slot cancellable memoization used for task statistics.
//! - **`stats`**: Cluster-wide task statistics.
//! - **`config`** / **`error`**: Node configuration and the error taxonomy.

pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod membership;
pub mod stats;
pub mod tasks;
pub mod transport;
