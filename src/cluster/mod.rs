//! Cluster membership recovery.
//!
//! The consensus log ([`raft`]) and the node registry ([`registry`]) each
//! hold a view of who is in the cluster.  [`manager::NodeManager`] reads
//! them, picks the survivor with [`resolve`], and collapses both views to
//! that single member.

pub mod manager;
pub mod node;
mod persist;
pub mod raft;
pub mod registry;
pub mod resolve;

pub use manager::{NodeManager, RecoveryAction, RecoveryOutcome};
pub use node::{NodeInfo, NodeRole};
