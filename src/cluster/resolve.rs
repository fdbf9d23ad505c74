//! Survivor resolution.
//!
//! After a catastrophic failure the advertised API addresses may have
//! shrunk to fewer entries than the consensus membership.  Resolution
//! decides, from that indirect evidence, which recorded member is the
//! machine running the tool.
//!
//! When several members match, the first in membership order wins.  Order
//! reflects join order, so the earliest-joined matching member is kept.

use std::collections::BTreeSet;

use tracing::debug;

use super::node::{host_of, NodeInfo};
use crate::errors::{BackstopError, Result};
use crate::net::AddressSource;

/// Pick the single legitimate survivor from `members`.
pub fn resolve_survivor(
    members: &[NodeInfo],
    advertised: &[String],
    local: &dyn AddressSource,
) -> Result<NodeInfo> {
    // One member, or several advertised addresses: addressing alone cannot
    // say which machine we are, so ask the interfaces.
    let evidence: BTreeSet<String> = if members.len() == 1 || advertised.len() > 1 {
        debug!("addressing is ambiguous; using local interface addresses");
        local.external_addresses().map_err(|e| match e {
            BackstopError::NotFound { .. } => {
                BackstopError::not_found("external IP address to identify this node")
            }
            other => other,
        })?
    } else {
        advertised.iter().cloned().collect()
    };

    let hosts = evidence
        .iter()
        .map(|addr| host_of(addr).map(str::to_string))
        .collect::<Result<BTreeSet<String>>>()?;
    debug!(hosts = ?hosts, "resolution evidence");

    for member in members {
        if hosts.contains(member.host()?) {
            debug!(id = member.id, address = %member.address, "matched survivor");
            return Ok(member.clone());
        }
    }

    Err(BackstopError::LeaderNotFound {
        members: members.len(),
        evidence: hosts.into_iter().collect(),
    })
}
