//! Cluster State Module
//!
//! The versioned cluster document (nodes, elected master, persistent tasks) and the
//! service that serialises changes to it and notifies subscribers.

pub mod nodes;
pub mod service;
pub mod state;

#[cfg(test)]
mod tests;
