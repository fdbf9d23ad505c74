//! Cluster member records.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{BackstopError, Result};

/// Voting role of a member as last recorded by the consensus log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    #[default]
    Voter,
    Standby,
    Spare,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NodeRole::Voter => "voter",
            NodeRole::Standby => "standby",
            NodeRole::Spare => "spare",
        })
    }
}

/// One member of the consensus cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Stable identifier assigned when the node first joined.
    pub id: u64,
    /// `host:port` used for consensus traffic.
    pub address: String,
    /// Voting role.
    #[serde(default)]
    pub role: NodeRole,
}

impl NodeInfo {
    /// Create a voter record.
    pub fn new(id: u64, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            role: NodeRole::Voter,
        }
    }

    /// Host component of `address`, without the port.
    pub fn host(&self) -> Result<&str> {
        split_host_port(&self.address).map(|(host, _)| host)
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {})", self.id, self.address, self.role)
    }
}

/// Split `host:port` (or `[v6-host]:port`) into its parts.
pub fn split_host_port(address: &str) -> Result<(&str, &str)> {
    let invalid = |reason: &str| BackstopError::InvalidAddress {
        address: address.to_string(),
        reason: reason.to_string(),
    };

    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| invalid("missing ']' in address"))?;
        let port = tail
            .strip_prefix(':')
            .ok_or_else(|| invalid("missing port in address"))?;
        if port.contains(':') {
            return Err(invalid("too many colons in address"));
        }
        return Ok((host, port));
    }

    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| invalid("missing port in address"))?;
    if host.contains(':') {
        return Err(invalid("too many colons in address"));
    }
    Ok((host, port))
}

/// Host portion of an evidence address; bare hosts are returned unchanged.
pub fn host_of(address: &str) -> Result<&str> {
    if address.contains(':') {
        if let Ok(std::net::IpAddr::V6(_)) = address.parse::<std::net::IpAddr>() {
            return Ok(address);
        }
        split_host_port(address).map(|(host, _)| host)
    } else {
        Ok(address)
    }
}
