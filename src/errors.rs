//! Recovery error types.
//!
//! Every variant maps to one class of operator-facing failure.  Only
//! [`BackstopError::NotFound`] is recoverable by the caller; everything
//! else aborts the procedure.  Errors raised after the consensus log has
//! been collapsed are escalated to [`BackstopError::InconsistentState`].

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = BackstopError> = std::result::Result<T, E>;

/// The linear steps of a recovery run, used to label failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStep {
    EnsureDataDir,
    ReadMembership,
    ResolveSurvivor,
    CollapseConsensusLog,
    CollapseRegistry,
    RewriteNodeInfo,
}

impl RecoveryStep {
    /// Short label shown to the operator.
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStep::EnsureDataDir => "ensure data dir",
            RecoveryStep::ReadMembership => "read cluster membership",
            RecoveryStep::ResolveSurvivor => "resolve surviving node",
            RecoveryStep::CollapseConsensusLog => "force consensus log membership",
            RecoveryStep::CollapseRegistry => "write node registry",
            RecoveryStep::RewriteNodeInfo => "rewrite node info",
        }
    }
}

impl fmt::Display for RecoveryStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recovery errors expressed as a Rust enum.
#[derive(Debug, Error)]
pub enum BackstopError {
    /// Expected absence: no registry yet, no external address, no API details.
    #[error("{what} not found")]
    NotFound { what: String },

    /// Persisted data exists but cannot be parsed or fails its checksum.
    #[error("corrupt {resource}: {reason}")]
    Corruption { resource: String, reason: String },

    /// The consensus log cannot be opened.
    #[error("consensus log at {} is unavailable: {reason}", .path.display())]
    Unavailable { path: PathBuf, reason: String },

    /// The consensus log appears to be held by a running instance.
    #[error("consensus log at {} is in use by a running instance; stop the agent first", .path.display())]
    UnsafeState { path: PathBuf },

    /// No member of the cluster matched the addressing evidence.
    #[error("unable to find leader node: none of {members} members matched hosts [{}]", .evidence.join(", "))]
    LeaderNotFound { members: usize, evidence: Vec<String> },

    /// Addressing evidence points at more than one plausible survivor.
    #[error("refusing to collapse {members} members with {advertised} advertised API addresses; survivor is ambiguous")]
    AmbiguousTopology { members: usize, advertised: usize },

    /// A `host:port` string could not be split.
    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// The agent config declares a format version with no registered decoder.
    #[error("unsupported agent config format {version:?}")]
    UnsupportedFormat { version: String },

    /// The agent config parsed but failed validation.
    #[error("invalid agent config: {0}")]
    InvalidConfig(String),

    /// A step did not complete before its deadline.
    #[error("deadline exceeded")]
    DeadlineExceeded { step: RecoveryStep },

    /// Filesystem failure.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The consensus log was forced but a later write could not follow it.
    #[error("consensus log now holds only node {survivor} but a follow-up write failed; repair it by hand: {source}")]
    InconsistentState {
        survivor: u64,
        #[source]
        source: Box<BackstopError>,
    },

    /// A failure annotated with the recovery step that raised it.
    #[error("{step}: {source}")]
    StepFailed {
        step: RecoveryStep,
        #[source]
        source: Box<BackstopError>,
    },

    /// Catch-all for unexpected internal errors.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl BackstopError {
    /// Build an [`BackstopError::Io`] for `path`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BackstopError::Io {
            path: path.into(),
            source,
        }
    }

    /// Build a [`BackstopError::NotFound`].
    pub fn not_found(what: impl Into<String>) -> Self {
        BackstopError::NotFound { what: what.into() }
    }

    /// Build a [`BackstopError::Corruption`].
    pub fn corruption(resource: impl Into<String>, reason: impl ToString) -> Self {
        BackstopError::Corruption {
            resource: resource.into(),
            reason: reason.to_string(),
        }
    }

    /// Wrap `self` with the step that raised it.
    pub fn at(self, step: RecoveryStep) -> Self {
        BackstopError::StepFailed {
            step,
            source: Box::new(self),
        }
    }

    /// Strip step annotations, returning the underlying error.
    pub fn root(&self) -> &BackstopError {
        match self {
            BackstopError::StepFailed { source, .. } => source.root(),
            other => other,
        }
    }

    /// Stable error name for logs.
    pub fn code(&self) -> &'static str {
        match self {
            BackstopError::NotFound { .. } => "NotFound",
            BackstopError::Corruption { .. } => "Corruption",
            BackstopError::Unavailable { .. } => "Unavailable",
            BackstopError::UnsafeState { .. } => "UnsafeState",
            BackstopError::LeaderNotFound { .. } => "LeaderNotFound",
            BackstopError::AmbiguousTopology { .. } => "AmbiguousTopology",
            BackstopError::InvalidAddress { .. } => "InvalidAddress",
            BackstopError::UnsupportedFormat { .. } => "UnsupportedFormat",
            BackstopError::InvalidConfig(_) => "InvalidConfig",
            BackstopError::DeadlineExceeded { .. } => "DeadlineExceeded",
            BackstopError::Io { .. } => "IOError",
            BackstopError::InconsistentState { .. } => "InconsistentState",
            BackstopError::StepFailed { source, .. } => source.code(),
            BackstopError::Internal(_) => "Internal",
        }
    }

    /// Whether the whole procedure must stop. `NotFound` lets the caller
    /// choose another path.
    pub fn is_fatal(&self) -> bool {
        !matches!(self.root(), BackstopError::NotFound { .. })
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self.root() {
            BackstopError::InconsistentState { .. } => 2,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_unwraps_nested_steps() {
        let err = BackstopError::not_found("registry")
            .at(RecoveryStep::ReadMembership)
            .at(RecoveryStep::ResolveSurvivor);
        assert!(matches!(err.root(), BackstopError::NotFound { .. }));
        assert_eq!(err.code(), "NotFound");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_step_context_in_message() {
        let err = BackstopError::AmbiguousTopology {
            members: 3,
            advertised: 3,
        }
        .at(RecoveryStep::ResolveSurvivor);
        let msg = err.to_string();
        assert!(msg.starts_with("resolve surviving node: "));
        assert!(msg.contains("3 members"));
    }

    #[test]
    fn test_inconsistent_state_exit_code() {
        let err = BackstopError::InconsistentState {
            survivor: 1,
            source: Box::new(BackstopError::io(
                "/tmp/cluster.yaml",
                std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
            )),
        }
        .at(RecoveryStep::CollapseRegistry);
        assert_eq!(err.exit_code(), 2);
        assert_eq!(err.code(), "InconsistentState");
        assert!(err.is_fatal());
    }

    #[test]
    fn test_leader_not_found_lists_evidence() {
        let err = BackstopError::LeaderNotFound {
            members: 2,
            evidence: vec!["10.0.0.9".to_string()],
        };
        assert!(err.to_string().contains("10.0.0.9"));
        assert_eq!(err.exit_code(), 1);
    }
}
