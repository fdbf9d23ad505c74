//! Backstop library: consensus cluster membership recovery.
//!
//! This crate collapses a controller cluster that lost quorum down to the
//! one member still running: it reads the membership held by the consensus
//! log, works out from network evidence which member this machine is, and
//! rewrites both the log and the local node registry to that single member.
//! It is a destructive, run-once tool for stopped clusters.

pub mod cluster;
pub mod config;
pub mod confirm;
pub mod errors;
pub mod net;
pub mod report;

pub use cluster::{NodeInfo, NodeManager, NodeRole, RecoveryAction, RecoveryOutcome};
pub use errors::{BackstopError, RecoveryStep};
