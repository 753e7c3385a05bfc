//! Membership & Discovery Module
//!
//! Gossip-based membership (inspired by SWIM) that supplies the set of live nodes the
//! persistent task coordinator assigns work to.
//!
//! ## Core Mechanisms
//! - **Gossip Protocol**: Nodes periodically exchange member lists via UDP.
//! - **Failure Detection**: "Suspect" -> "Dead" transitions driven by timeouts.
//! - **Protocol Versions**: Every member advertises the version it speaks so capability
//!   gates can look at the lowest version in the cluster.

pub mod service;
pub mod types;
