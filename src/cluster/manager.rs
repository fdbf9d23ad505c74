//! Recovery orchestration for a single consensus node.
//!
//! [`NodeManager`] interrogates the node's consensus data directory and,
//! when asked, collapses the cluster down to the one member that is still
//! alive.  Steps run strictly in order:
//!
//! ```text
//! EnsureDataDir -> ReadMembership -> ResolveSurvivor
//!               -> CollapseConsensusLog -> CollapseRegistry
//!               [-> RewriteNodeInfo]
//! ```
//!
//! Everything before `CollapseConsensusLog` only reads, so a failure there
//! leaves persisted state untouched.  A registry failure after the log was
//! forced is reported as [`BackstopError::InconsistentState`]; the forced
//! log membership is never rolled back.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use super::node::{host_of, NodeInfo, NodeRole};
use super::raft::{ConsensusLog, FileRaftLog};
use super::registry::{NodeStore, YamlNodeStore};
use super::resolve::resolve_survivor;
use crate::config::AgentConfig;
use crate::errors::{BackstopError, RecoveryStep, Result};
use crate::net::{AddressSource, LocalInterfaces};

/// Subdirectory of the agent data dir owned by the consensus library.
pub const RAFT_DATA_DIR: &str = "raft";

/// Port the consensus library binds.
pub const RAFT_PORT: u16 = 17666;

/// Address a freshly bootstrapped node binds before it is clustered.
pub const BOOTSTRAP_BIND_IP: &str = "127.0.0.1";

/// Default bound on any single read step.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(10);

/// What recovery decided to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// The log already holds a single member; nothing to repair.
    AlreadySingleMember(NodeInfo),
    /// Collapse the cluster to `survivor`.
    Collapse { survivor: NodeInfo },
}

/// Result of [`NodeManager::plan`] or [`NodeManager::recover`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryOutcome {
    /// Membership the consensus log held before recovery.
    pub previous: Vec<NodeInfo>,
    /// Registry view, when `cluster.yaml` was readable.
    pub registry: Option<Vec<NodeInfo>>,
    pub action: RecoveryAction,
    /// Whether the collapse was written.
    pub applied: bool,
}

impl RecoveryOutcome {
    /// Membership after recovery (or after it would be applied).
    ///
    /// A collapsed survivor always votes; it could not elect itself otherwise.
    pub fn new_membership(&self) -> Vec<NodeInfo> {
        match &self.action {
            RecoveryAction::AlreadySingleMember(member) => vec![member.clone()],
            RecoveryAction::Collapse { survivor } => vec![NodeInfo {
                role: NodeRole::Voter,
                ..survivor.clone()
            }],
        }
    }

    /// Whether the registry disagreed with the consensus log.
    pub fn registry_diverged(&self) -> bool {
        matches!(&self.registry, Some(registry) if registry != &self.previous)
    }
}

/// Interrogates and repairs one consensus node's membership state.
pub struct NodeManager {
    dir: PathBuf,
    port: u16,
    step_timeout: Duration,
    log: Arc<dyn ConsensusLog>,
    store: Arc<dyn NodeStore>,
    local: Arc<dyn AddressSource>,
}

impl NodeManager {
    /// Manager for the consensus directory under `base_data_dir`.
    pub fn new(base_data_dir: impl AsRef<Path>) -> Self {
        let dir = base_data_dir.as_ref().join(RAFT_DATA_DIR);
        Self {
            log: Arc::new(FileRaftLog::new(&dir)),
            store: Arc::new(YamlNodeStore::new(&dir)),
            local: Arc::new(LocalInterfaces),
            dir,
            port: RAFT_PORT,
            step_timeout: DEFAULT_STEP_TIMEOUT,
        }
    }

    /// Manager for the agent described by `config`.
    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(config.data_dir())
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn with_consensus_log(mut self, log: Arc<dyn ConsensusLog>) -> Self {
        self.log = log;
        self
    }

    pub fn with_node_store(mut self, store: Arc<dyn NodeStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_address_source(mut self, local: Arc<dyn AddressSource>) -> Self {
        self.local = local;
        self
    }

    /// Consensus data directory (may not exist yet).
    pub fn data_dir(&self) -> &Path {
        &self.dir
    }

    /// `ip:port` for the consensus library on `ip`.
    pub fn address_for(&self, ip: &str) -> String {
        format!("{}:{}", ip, self.port)
    }

    /// Address a bootstrapped, unclustered node binds.
    pub fn loopback_address(&self) -> String {
        self.address_for(BOOTSTRAP_BIND_IP)
    }

    /// Create the consensus data directory if it is missing.
    pub fn ensure_data_dir(&self) -> Result<&Path> {
        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(0o700);
        }
        builder
            .create(&self.dir)
            .map_err(|e| BackstopError::io(&self.dir, e))?;
        Ok(&self.dir)
    }

    /// Whether a consensus node has ever run here (data dir non-empty).
    pub fn is_existing_node(&self) -> Result<bool> {
        self.ensure_data_dir()?;
        let mut entries = std::fs::read_dir(&self.dir).map_err(|e| BackstopError::io(&self.dir, e))?;
        match entries.next() {
            None => Ok(false),
            Some(Ok(_)) => Ok(true),
            Some(Err(e)) => Err(BackstopError::io(&self.dir, e)),
        }
    }

    /// Whether this is the node the cluster was first bootstrapped on and it
    /// has not been reconfigured since: one member, bound to loopback.
    pub async fn is_bootstrapped_node(&self, deadline: Instant) -> Result<bool> {
        if !self.is_existing_node()? {
            return Ok(false);
        }
        let servers = self.cluster_servers(deadline).await?;
        match servers.as_slice() {
            [only] => Ok(host_of(&only.address).is_ok_and(|host| host == BOOTSTRAP_BIND_IP)),
            _ => Ok(false),
        }
    }

    /// Membership as recorded by the consensus log.
    pub async fn cluster_servers(&self, deadline: Instant) -> Result<Vec<NodeInfo>> {
        self.bounded(RecoveryStep::ReadMembership, deadline, self.log.read_membership())
            .await
    }

    /// Membership as recorded by the node registry.
    pub async fn registry_servers(&self) -> Result<Vec<NodeInfo>> {
        self.store.get().await
    }

    /// Write `servers` to the consensus log and then to the registry.
    ///
    /// Only call this on a stopped node.
    pub async fn set_cluster_servers(&self, servers: &[NodeInfo], deadline: Instant) -> Result<()> {
        check_deadline(RecoveryStep::CollapseConsensusLog, deadline)?;
        self.log
            .force_membership(servers)
            .await
            .map_err(|e| e.at(RecoveryStep::CollapseConsensusLog))?;

        // The log is committed from here on; never bail on the deadline.
        self.store.set(servers).await.map_err(|e| {
            BackstopError::InconsistentState {
                survivor: servers.first().map(|s| s.id).unwrap_or_default(),
                source: Box::new(e),
            }
            .at(RecoveryStep::CollapseRegistry)
        })
    }

    /// Rewrite this node's own record in `info.yaml`.
    ///
    /// Only call this on a stopped node.
    pub async fn set_node_info(&self, info: NodeInfo) -> Result<()> {
        self.store.set_self(info).await
    }

    /// Point `info.yaml` at the survivor of an applied collapse.
    ///
    /// Does nothing unless `outcome` was applied.  The log is already
    /// collapsed by then, so a failure is [`BackstopError::InconsistentState`].
    pub async fn rewrite_node_info(&self, outcome: &RecoveryOutcome) -> Result<()> {
        if !outcome.applied {
            return Ok(());
        }
        let Some(survivor) = outcome.new_membership().into_iter().next() else {
            return Ok(());
        };
        let id = survivor.id;
        self.set_node_info(survivor).await.map_err(|e| {
            BackstopError::InconsistentState {
                survivor: id,
                source: Box::new(e),
            }
            .at(RecoveryStep::RewriteNodeInfo)
        })?;
        info!(id, "rewrote node info to the surviving member");
        Ok(())
    }

    /// Decide what recovery would do, without writing anything.
    pub async fn plan(&self, advertised: &[String], deadline: Instant) -> Result<RecoveryOutcome> {
        self.ensure_data_dir()
            .map_err(|e| e.at(RecoveryStep::EnsureDataDir))?;

        let previous = self
            .cluster_servers(deadline)
            .await
            .map_err(|e| e.at(RecoveryStep::ReadMembership))?;
        let registry = self.registry_view().await;

        let action = match previous.as_slice() {
            [] => {
                return Err(BackstopError::not_found("members in consensus log")
                    .at(RecoveryStep::ReadMembership))
            }
            [only] => {
                info!(id = only.id, address = %only.address, "cluster already has a single member");
                RecoveryAction::AlreadySingleMember(only.clone())
            }
            members => {
                if advertised.len() > 1 || advertised.len() == members.len() {
                    return Err(BackstopError::AmbiguousTopology {
                        members: members.len(),
                        advertised: advertised.len(),
                    }
                    .at(RecoveryStep::ResolveSurvivor));
                }
                let survivor = resolve_survivor(members, advertised, self.local.as_ref())
                    .map_err(|e| e.at(RecoveryStep::ResolveSurvivor))?;
                if survivor.role != NodeRole::Voter {
                    warn!(id = survivor.id, role = %survivor.role, "survivor is not a voter; promoting it");
                }
                info!(id = survivor.id, address = %survivor.address, "resolved surviving node");
                RecoveryAction::Collapse { survivor }
            }
        };

        Ok(RecoveryOutcome {
            previous,
            registry,
            action,
            applied: false,
        })
    }

    /// Collapse the cluster to its survivor.
    pub async fn recover(&self, advertised: &[String], deadline: Instant) -> Result<RecoveryOutcome> {
        let mut outcome = self.plan(advertised, deadline).await?;
        if let RecoveryAction::Collapse { survivor } = &outcome.action {
            self.set_cluster_servers(&outcome.new_membership(), deadline)
                .await?;
            info!(id = survivor.id, "cluster collapsed to a single member");
            outcome.applied = true;
        }
        Ok(outcome)
    }

    async fn registry_view(&self) -> Option<Vec<NodeInfo>> {
        match self.registry_servers().await {
            Ok(servers) => Some(servers),
            Err(BackstopError::NotFound { .. }) => None,
            Err(e) => {
                warn!(error = %e, "ignoring unreadable node registry");
                None
            }
        }
    }

    async fn bounded<T>(
        &self,
        step: RecoveryStep,
        deadline: Instant,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let limit = deadline.min(Instant::now() + self.step_timeout);
        tokio::time::timeout_at(limit, fut)
            .await
            .unwrap_or(Err(BackstopError::DeadlineExceeded { step }))
    }
}

fn check_deadline(step: RecoveryStep, deadline: Instant) -> Result<()> {
    if Instant::now() >= deadline {
        return Err(BackstopError::DeadlineExceeded { step }.at(step));
    }
    Ok(())
}
