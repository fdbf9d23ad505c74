//! File-backed node registry.
//!
//! The registry is a local cache of the last known membership
//! (`cluster.yaml`) plus this machine's own record (`info.yaml`), both kept
//! in the consensus data directory.  It has no reconciliation logic; the
//! [`NodeManager`](super::manager::NodeManager) decides what to write.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;

use tracing::debug;

use super::node::NodeInfo;
use super::persist::{read_existing, write_atomic};
use crate::errors::{BackstopError, Result};

/// File name of the membership list.
pub const CLUSTER_FILE_NAME: &str = "cluster.yaml";

/// File name of this node's own record.
pub const INFO_FILE_NAME: &str = "info.yaml";

/// Async node registry contract.
pub trait NodeStore: Send + Sync {
    /// Read the last persisted membership.
    fn get(&self) -> Pin<Box<dyn Future<Output = Result<Vec<NodeInfo>>> + Send + '_>>;

    /// Replace the persisted membership.
    fn set(
        &self,
        servers: &[NodeInfo],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Read this machine's own record.
    fn get_self(&self) -> Pin<Box<dyn Future<Output = Result<NodeInfo>> + Send + '_>>;

    /// Replace this machine's own record.
    fn set_self(&self, info: NodeInfo) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// YAML files under the consensus data directory.
#[derive(Debug, Clone)]
pub struct YamlNodeStore {
    cluster_path: PathBuf,
    info_path: PathBuf,
}

impl YamlNodeStore {
    /// Create a store rooted at `dir`. Nothing is read until first use.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            cluster_path: dir.join(CLUSTER_FILE_NAME),
            info_path: dir.join(INFO_FILE_NAME),
        }
    }

    /// Path of `cluster.yaml`.
    pub fn cluster_path(&self) -> &Path {
        &self.cluster_path
    }

    /// Path of `info.yaml`.
    pub fn info_path(&self) -> &Path {
        &self.info_path
    }
}

impl NodeStore for YamlNodeStore {
    fn get(&self) -> Pin<Box<dyn Future<Output = Result<Vec<NodeInfo>>> + Send + '_>> {
        Box::pin(async move {
            let data = read_existing(&self.cluster_path, "node registry")?;
            let servers: Vec<NodeInfo> = serde_yaml::from_slice(&data).map_err(|e| {
                BackstopError::corruption(self.cluster_path.display().to_string(), e)
            })?;
            debug!(path = %self.cluster_path.display(), count = servers.len(), "read node registry");
            Ok(servers)
        })
    }

    fn set(
        &self,
        servers: &[NodeInfo],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let servers = servers.to_vec();
        Box::pin(async move {
            let data = serde_yaml::to_string(&servers).map_err(anyhow::Error::from)?;
            write_atomic(&self.cluster_path, data.as_bytes())?;
            debug!(path = %self.cluster_path.display(), count = servers.len(), "wrote node registry");
            Ok(())
        })
    }

    fn get_self(&self) -> Pin<Box<dyn Future<Output = Result<NodeInfo>> + Send + '_>> {
        Box::pin(async move {
            let data = read_existing(&self.info_path, "node info")?;
            serde_yaml::from_slice(&data)
                .map_err(|e| BackstopError::corruption(self.info_path.display().to_string(), e))
        })
    }

    fn set_self(&self, info: NodeInfo) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let data = serde_yaml::to_string(&info).map_err(anyhow::Error::from)?;
            write_atomic(&self.info_path, data.as_bytes())?;
            debug!(path = %self.info_path.display(), id = info.id, "wrote node info");
            Ok(())
        })
    }
}
