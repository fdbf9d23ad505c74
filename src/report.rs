//! Human-readable recovery report.

use std::fmt::Write as _;

use crate::cluster::{NodeInfo, RecoveryAction, RecoveryOutcome};

/// systemd unit that runs the agent for `tag`.
pub fn service_name(tag: &str) -> String {
    format!("controller-agent-{tag}.service")
}

fn write_members(out: &mut String, title: &str, members: &[NodeInfo]) {
    let _ = writeln!(out, "{title}:");
    for member in members {
        let _ = writeln!(out, "  - {member}");
    }
    out.push('\n');
}

/// Render `outcome` for the operator running recovery for agent `tag`.
pub fn render(outcome: &RecoveryOutcome, tag: &str) -> String {
    let mut out = String::new();

    write_members(&mut out, "consensus log membership", &outcome.previous);
    if outcome.registry_diverged() {
        if let Some(registry) = &outcome.registry {
            write_members(&mut out, "node registry membership (diverged)", registry);
        }
    }

    match &outcome.action {
        RecoveryAction::AlreadySingleMember(member) => {
            let _ = writeln!(
                out,
                "cluster already has a single member ({}); nothing to do",
                member.address
            );
            return out;
        }
        RecoveryAction::Collapse { survivor } => {
            let _ = writeln!(out, "surviving node: {survivor}\n");
        }
    }

    let yaml = serde_yaml::to_string(&outcome.new_membership())
        .unwrap_or_else(|e| format!("<unrenderable membership: {e}>\n"));

    if !outcome.applied {
        out.push_str("dry run: cluster.yaml would become\n\n");
        out.push_str(&yaml);
        return out;
    }

    out.push_str("updated cluster.yaml\n\n");
    out.push_str(&yaml);
    out.push('\n');
    out.push_str("backstop action complete\n");
    out.push_str("please restart the controller machine agents using:\n\n");
    let _ = writeln!(out, "\tsystemctl restart {}\n", service_name(tag));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(action: RecoveryAction, applied: bool) -> RecoveryOutcome {
        RecoveryOutcome {
            previous: vec![
                NodeInfo::new(1, "10.0.0.1:17666"),
                NodeInfo::new(2, "10.0.0.2:17666"),
            ],
            registry: None,
            action,
            applied,
        }
    }

    #[test]
    fn test_applied_report_has_restart_instruction() {
        let text = render(
            &outcome(
                RecoveryAction::Collapse {
                    survivor: NodeInfo::new(1, "10.0.0.1:17666"),
                },
                true,
            ),
            "machine-0",
        );
        assert!(text.contains("  - 2 (10.0.0.2:17666, voter)"));
        assert!(text.contains("surviving node: 1 (10.0.0.1:17666, voter)"));
        assert!(text.contains("updated cluster.yaml"));
        assert!(text.contains("- id: 1"));
        assert!(text.contains("systemctl restart controller-agent-machine-0.service"));
    }

    #[test]
    fn test_dry_run_report_has_no_restart() {
        let text = render(
            &outcome(
                RecoveryAction::Collapse {
                    survivor: NodeInfo::new(2, "10.0.0.2:17666"),
                },
                false,
            ),
            "machine-1",
        );
        assert!(text.contains("dry run"));
        assert!(!text.contains("systemctl"));
    }

    #[test]
    fn test_noop_report() {
        let mut o = outcome(
            RecoveryAction::AlreadySingleMember(NodeInfo::new(1, "127.0.0.1:17666")),
            false,
        );
        o.previous.truncate(1);
        let text = render(&o, "machine-0");
        assert!(text.contains("nothing to do"));
        assert!(!text.contains("systemctl"));
    }

    #[test]
    fn test_diverged_registry_is_shown() {
        let mut o = outcome(
            RecoveryAction::Collapse {
                survivor: NodeInfo::new(1, "10.0.0.1:17666"),
            },
            true,
        );
        o.registry = Some(vec![NodeInfo::new(3, "10.0.0.3:17666")]);
        let text = render(&o, "machine-0");
        assert!(text.contains("diverged"));
        assert!(text.contains("10.0.0.3:17666"));
    }
}
