//! Consensus log membership adapter.
//!
//! The replicated log itself (replication, elections, compaction) belongs to
//! the consensus library that the controller agent runs.  Recovery only needs
//! two primitives from it: read the membership the log currently believes in,
//! and force a new membership onto a stopped log.  [`ConsensusLog`] is that
//! boundary; [`FileRaftLog`] speaks the log's on-disk membership record.
//!
//! On disk the log directory holds:
//!
//! - `membership.json`: the last applied membership as an openraft
//!   [`StoredMembership`], wrapped with a SHA-256 checksum;
//! - `raft.lock`: held with an exclusive advisory lock by a running instance.
//!
//! Voters map to the membership's voter set; standby and spare members are
//! learners.  The log reports members in node-id order.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use fs2::FileExt;
use openraft::{BasicNode, CommittedLeaderId, LogId, Membership, StoredMembership};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use super::node::{NodeInfo, NodeRole};
use super::persist::write_atomic;
use crate::errors::{BackstopError, Result};

/// File name of the membership record.
pub const MEMBERSHIP_FILE_NAME: &str = "membership.json";

/// File name of the instance lock.
pub const LOCK_FILE_NAME: &str = "raft.lock";

/// Version of the membership record layout.
const RECORD_FORMAT: u32 = 1;

/// Boundary to the consensus library's membership storage.
pub trait ConsensusLog: Send + Sync {
    /// Directory the log lives in.
    fn data_dir(&self) -> &Path;

    /// Membership as recorded by the log.
    fn read_membership(&self) -> Pin<Box<dyn Future<Output = Result<Vec<NodeInfo>>> + Send + '_>>;

    /// Overwrite the log's membership without going through consensus.
    ///
    /// Only safe against a fully stopped log.
    fn force_membership(
        &self,
        servers: &[NodeInfo],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Persisted membership entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MembershipRecord {
    format: u32,
    #[serde(default)]
    forced: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    forced_at: Option<String>,
    membership: StoredMembership<u64, BasicNode>,
    checksum: String,
}

impl MembershipRecord {
    fn new(log_id: LogId<u64>, servers: &[NodeInfo]) -> Result<Self> {
        let membership = StoredMembership::new(Some(log_id), to_membership(servers)?);
        let checksum = membership_checksum(&membership)?;
        Ok(Self {
            format: RECORD_FORMAT,
            forced: false,
            forced_at: None,
            membership,
            checksum,
        })
    }

    fn log_id(&self) -> Option<LogId<u64>> {
        *self.membership.log_id()
    }

    fn servers(&self) -> Vec<NodeInfo> {
        from_membership(self.membership.membership())
    }
}

fn membership_checksum(membership: &StoredMembership<u64, BasicNode>) -> Result<String> {
    let encoded = serde_json::to_vec(membership).map_err(anyhow::Error::from)?;
    Ok(hex::encode(Sha256::digest(&encoded)))
}

/// Voters form the single config; everyone is listed as a node.
fn to_membership(servers: &[NodeInfo]) -> Result<Membership<u64, BasicNode>> {
    let voters: BTreeSet<u64> = servers
        .iter()
        .filter(|s| s.role == NodeRole::Voter)
        .map(|s| s.id)
        .collect();
    if voters.is_empty() {
        return Err(anyhow::anyhow!("membership needs at least one voter").into());
    }
    let nodes: BTreeMap<u64, BasicNode> = servers
        .iter()
        .map(|s| (s.id, BasicNode::new(&s.address)))
        .collect();
    Ok(Membership::new(vec![voters], nodes))
}

fn from_membership(membership: &Membership<u64, BasicNode>) -> Vec<NodeInfo> {
    let voters: BTreeSet<u64> = membership.voter_ids().collect();
    membership
        .nodes()
        .map(|(id, node)| NodeInfo {
            id: *id,
            address: node.addr.clone(),
            role: if voters.contains(id) {
                NodeRole::Voter
            } else {
                NodeRole::Standby
            },
        })
        .collect()
}

/// Log id of a forced entry: same leader, next index.
fn next_log_id(previous: Option<LogId<u64>>, fallback_leader: u64) -> LogId<u64> {
    match previous {
        Some(log_id) => LogId::new(log_id.leader_id, log_id.index + 1),
        None => LogId::new(CommittedLeaderId::new(0, fallback_leader), 1),
    }
}

/// Membership record of an on-disk raft log directory.
#[derive(Debug, Clone)]
pub struct FileRaftLog {
    dir: PathBuf,
}

impl FileRaftLog {
    /// Bind to the log in `dir`. Nothing is opened until first use.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn record_path(&self) -> PathBuf {
        self.dir.join(MEMBERSHIP_FILE_NAME)
    }

    fn lock_path(&self) -> PathBuf {
        self.dir.join(LOCK_FILE_NAME)
    }

    fn unavailable(&self, reason: impl Into<String>) -> BackstopError {
        BackstopError::Unavailable {
            path: self.dir.clone(),
            reason: reason.into(),
        }
    }

    /// Try to take the instance lock without blocking.
    ///
    /// `Ok(None)` means another process holds it.  When `create` is false
    /// and no lock file exists, no instance has run here and an unlocked
    /// placeholder is returned as `Ok(Some(None))`.
    fn try_lock(&self, create: bool) -> Result<Option<Option<File>>> {
        let path = self.lock_path();
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if !create && e.kind() == ErrorKind::NotFound => return Ok(Some(None)),
            Err(e) => return Err(BackstopError::io(&path, e)),
        };

        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(Some(file))),
            Err(e)
                if e.kind() == ErrorKind::WouldBlock
                    || e.raw_os_error() == fs2::lock_contended_error().raw_os_error() =>
            {
                Ok(None)
            }
            Err(e) => Err(BackstopError::io(&path, e)),
        }
    }

    fn read_record(&self) -> Result<MembershipRecord> {
        let path = self.record_path();
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(self.unavailable("no membership record in log"))
            }
            Err(e) => return Err(BackstopError::io(&path, e)),
        };

        let resource = path.display().to_string();
        let record: MembershipRecord = serde_json::from_slice(&data)
            .map_err(|e| BackstopError::corruption(resource.as_str(), e))?;
        if record.format != RECORD_FORMAT {
            return Err(BackstopError::corruption(
                resource,
                format!("unknown record format {}", record.format),
            ));
        }
        if membership_checksum(&record.membership)? != record.checksum {
            return Err(BackstopError::corruption(resource, "checksum mismatch"));
        }
        Ok(record)
    }

    fn read_blocking(&self) -> Result<Vec<NodeInfo>> {
        if !self.dir.is_dir() {
            return Err(self.unavailable("data directory does not exist"));
        }
        // Held only for the duration of the read.
        let _guard = self
            .try_lock(false)?
            .ok_or_else(|| self.unavailable("lock held by a running instance"))?;
        Ok(self.read_record()?.servers())
    }

    fn force_blocking(&self, servers: Vec<NodeInfo>) -> Result<()> {
        if servers.is_empty() {
            return Err(anyhow::anyhow!("refusing to force an empty membership").into());
        }
        if !self.dir.is_dir() {
            return Err(self.unavailable("data directory does not exist"));
        }
        // Released when dropped at the end of the write.
        let _lock = self
            .try_lock(true)?
            .flatten()
            .ok_or_else(|| BackstopError::UnsafeState {
                path: self.dir.clone(),
            })?;

        let previous = match self.read_record() {
            Ok(previous) => previous.log_id(),
            Err(BackstopError::Unavailable { .. }) => {
                warn!(dir = %self.dir.display(), "no prior membership record; writing a fresh one");
                None
            }
            Err(e) => return Err(e),
        };

        let log_id = next_log_id(previous, servers[0].id);
        let mut record = MembershipRecord::new(log_id, &servers)?;
        record.forced = true;
        record.forced_at = Some(chrono::Utc::now().to_rfc3339());

        let data = serde_json::to_vec_pretty(&record).map_err(anyhow::Error::from)?;
        write_atomic(&self.record_path(), &data)?;

        info!(
            dir = %self.dir.display(),
            log_id = %log_id,
            members = servers.len(),
            "forced consensus log membership"
        );
        Ok(())
    }
}

impl ConsensusLog for FileRaftLog {
    fn data_dir(&self) -> &Path {
        &self.dir
    }

    fn read_membership(&self) -> Pin<Box<dyn Future<Output = Result<Vec<NodeInfo>>> + Send + '_>> {
        let log = self.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || log.read_blocking())
                .await
                .map_err(anyhow::Error::from)?
        })
    }

    fn force_membership(
        &self,
        servers: &[NodeInfo],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let log = self.clone();
        let servers = servers.to_vec();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || log.force_blocking(servers))
                .await
                .map_err(anyhow::Error::from)?
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn two_members() -> Vec<NodeInfo> {
        vec![
            NodeInfo::new(1, "10.0.0.1:17666"),
            NodeInfo::new(2, "10.0.0.2:17666"),
        ]
    }

    fn seed_log(dir: &Path, term: u64, index: u64, servers: Vec<NodeInfo>) {
        let log_id = LogId::new(CommittedLeaderId::new(term, servers[0].id), index);
        let record = MembershipRecord::new(log_id, &servers).unwrap();
        std::fs::write(
            dir.join(MEMBERSHIP_FILE_NAME),
            serde_json::to_vec(&record).unwrap(),
        )
        .unwrap();
    }

    fn read_raw(dir: &Path) -> MembershipRecord {
        serde_json::from_slice(&std::fs::read(dir.join(MEMBERSHIP_FILE_NAME)).unwrap()).unwrap()
    }

    fn hold_lock(dir: &Path) -> File {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.join(LOCK_FILE_NAME))
            .unwrap();
        file.try_lock_exclusive().unwrap();
        file
    }

    #[tokio::test]
    async fn test_read_membership() {
        let tmp = TempDir::new().unwrap();
        seed_log(tmp.path(), 4, 120, two_members());
        let log = FileRaftLog::new(tmp.path());
        assert_eq!(log.read_membership().await.unwrap(), two_members());
    }

    #[tokio::test]
    async fn test_read_does_not_create_lock_file() {
        let tmp = TempDir::new().unwrap();
        seed_log(tmp.path(), 1, 1, two_members());
        FileRaftLog::new(tmp.path()).read_membership().await.unwrap();
        assert!(!tmp.path().join(LOCK_FILE_NAME).exists());
    }

    #[tokio::test]
    async fn test_read_missing_dir_is_unavailable() {
        let tmp = TempDir::new().unwrap();
        let log = FileRaftLog::new(tmp.path().join("raft"));
        let err = log.read_membership().await.unwrap_err();
        assert_eq!(err.code(), "Unavailable");
    }

    #[tokio::test]
    async fn test_read_missing_record_is_unavailable() {
        let tmp = TempDir::new().unwrap();
        let err = FileRaftLog::new(tmp.path())
            .read_membership()
            .await
            .unwrap_err();
        assert_eq!(err.code(), "Unavailable");
    }

    #[tokio::test]
    async fn test_read_while_locked_is_unavailable() {
        let tmp = TempDir::new().unwrap();
        seed_log(tmp.path(), 1, 1, two_members());
        let _held = hold_lock(tmp.path());
        let err = FileRaftLog::new(tmp.path())
            .read_membership()
            .await
            .unwrap_err();
        assert_eq!(err.code(), "Unavailable");
        assert!(err.to_string().contains("running instance"));
    }

    #[tokio::test]
    async fn test_tampered_record_is_corruption() {
        let tmp = TempDir::new().unwrap();
        seed_log(tmp.path(), 1, 1, two_members());
        let path = tmp.path().join(MEMBERSHIP_FILE_NAME);
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, text.replace("10.0.0.2:17666", "10.9.9.9:17666")).unwrap();

        let err = FileRaftLog::new(tmp.path())
            .read_membership()
            .await
            .unwrap_err();
        assert_eq!(err.code(), "Corruption");
        assert!(err.to_string().contains("checksum"));
    }

    #[tokio::test]
    async fn test_force_membership_advances_index() {
        let tmp = TempDir::new().unwrap();
        seed_log(tmp.path(), 7, 300, two_members());
        let log = FileRaftLog::new(tmp.path());

        log.force_membership(&two_members()[..1]).await.unwrap();

        let record = read_raw(tmp.path());
        let log_id = record.log_id().unwrap();
        assert_eq!(log_id.leader_id, CommittedLeaderId::new(7, 1));
        assert_eq!(log_id.index, 301);
        assert!(record.forced);
        assert!(record.forced_at.is_some());
        assert_eq!(
            log.read_membership().await.unwrap(),
            vec![NodeInfo::new(1, "10.0.0.1:17666")]
        );
    }

    #[tokio::test]
    async fn test_force_while_locked_is_unsafe_state() {
        let tmp = TempDir::new().unwrap();
        seed_log(tmp.path(), 1, 1, two_members());
        let _held = hold_lock(tmp.path());

        let err = FileRaftLog::new(tmp.path())
            .force_membership(&two_members()[..1])
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UnsafeState");
        assert_eq!(read_raw(tmp.path()).servers(), two_members());
    }

    #[tokio::test]
    async fn test_force_rejects_empty_membership() {
        let tmp = TempDir::new().unwrap();
        seed_log(tmp.path(), 1, 1, two_members());
        assert!(FileRaftLog::new(tmp.path())
            .force_membership(&[])
            .await
            .is_err());
        assert_eq!(read_raw(tmp.path()).servers().len(), 2);
    }

    #[tokio::test]
    async fn test_roles_map_to_voters_and_learners() {
        let tmp = TempDir::new().unwrap();
        let mut members = two_members();
        members[1].role = NodeRole::Standby;
        seed_log(tmp.path(), 2, 10, members.clone());

        let record = read_raw(tmp.path());
        let voters: Vec<u64> = record.membership.membership().voter_ids().collect();
        let learners: Vec<u64> = record.membership.membership().learner_ids().collect();
        assert_eq!(voters, vec![1]);
        assert_eq!(learners, vec![2]);
        assert_eq!(
            FileRaftLog::new(tmp.path()).read_membership().await.unwrap(),
            members
        );
    }

    #[tokio::test]
    async fn test_force_without_voter_is_rejected() {
        let tmp = TempDir::new().unwrap();
        seed_log(tmp.path(), 1, 1, two_members());
        let mut standby = NodeInfo::new(2, "10.0.0.2:17666");
        standby.role = NodeRole::Standby;

        assert!(FileRaftLog::new(tmp.path())
            .force_membership(&[standby])
            .await
            .is_err());
        assert_eq!(read_raw(tmp.path()).servers(), two_members());
    }

    #[tokio::test]
    async fn test_first_force_starts_a_fresh_log_id() {
        let tmp = TempDir::new().unwrap();
        let log = FileRaftLog::new(tmp.path());
        log.force_membership(&two_members()[..1]).await.unwrap();

        let log_id = read_raw(tmp.path()).log_id().unwrap();
        assert_eq!(log_id.leader_id, CommittedLeaderId::new(0, 1));
        assert_eq!(log_id.index, 1);
    }
}
