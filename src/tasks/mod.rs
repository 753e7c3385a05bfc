//! Persistent Tasks Module
//!
//! Long-running, resumable units of work tracked in the cluster state so they
//! survive node failures and coordinator changes.
//!
//! ## Flow
//! 1. **Start**: a caller asks the `TaskClient` to start a task. The elected
//!    coordinator validates it, picks a node and adds a record to the `TaskRegistry`.
//! 2. **Run**: the assigned node's `PersistentTasksNodeService` sees the record,
//!    creates an `AllocatedTask` and runs the executor registered for the task name.
//! 3. **Checkpoint**: the task persists its state through the client. Each write
//!    carries the allocation id, so writes from a replaced allocation are rejected.
//! 4. **Finish**: the task completes, fails or is cancelled, and reports back once.
//!    When a node leaves, the coordinator moves its tasks elsewhere.
//!
//! ## Submodules
//! - **`types`** / **`registry`**: records and the immutable registry snapshot.
//! - **`coordinator`**: master-only mutation logic and reassignment.
//! - **`allocated`**: per-node execution handle and its state machine.
//! - **`client`**: request façade and change-driven waits.
//! - **`executor`**: startup-time table of executors keyed by task name.
//! - **`node_service`**: per-node reconciler.
//! - **`tracking`**: local task slots and their cancellation tokens.
//! - **`builtin`**: the resumable `progress` executor.

pub mod allocated;
pub mod builtin;
pub mod client;
pub mod coordinator;
pub mod executor;
pub mod node_service;
pub mod registry;
pub mod tracking;
pub mod types;
