/// Cluster health: topology probing, replication verification, metrics and
/// the pluggable policy that turns them into a classification
pub mod metrics;
pub mod monitor;
pub mod replication;
pub mod topology;

use serde::Serialize;
use std::fmt;

pub use metrics::{MetricsCollector, MetricsReport, SideMetrics};
pub use monitor::{HealthMonitor, HealthReport};
pub use replication::{ReplicationProbeResult, ReplicationStatus, ReplicationVerifier};
pub use topology::{MemberRole, MemberStatus, TopologyProbe, TopologySnapshot, TopologySource};

/// Classification of the cluster as a whole
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ClusterHealth {
    Healthy,
    Degraded { reason: String },
    /// The probe failed; nothing is known about the cluster
    Unknown { reason: String },
}

impl fmt::Display for ClusterHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterHealth::Healthy => write!(f, "Healthy"),
            ClusterHealth::Degraded { reason } => write!(f, "Degraded: {}", reason),
            ClusterHealth::Unknown { reason } => write!(f, "Unknown: {}", reason),
        }
    }
}

impl ClusterHealth {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ClusterHealth::Healthy)
    }
}

/// Decides how a probe result is classified
pub trait HealthPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    fn classify(
        &self,
        topology: &TopologySnapshot,
        replication: Option<&ReplicationProbeResult>,
    ) -> ClusterHealth;
}

/// Healthy when enough members are healthy, a primary exists and writes
/// replicate. Synthesized single-node snapshots only need a primary.
#[derive(Debug, Clone)]
pub struct QuorumPolicy {
    pub min_healthy: usize,
}

impl Default for QuorumPolicy {
    fn default() -> Self {
        Self { min_healthy: 2 }
    }
}

impl HealthPolicy for QuorumPolicy {
    fn name(&self) -> &'static str {
        "quorum"
    }

    fn classify(
        &self,
        topology: &TopologySnapshot,
        replication: Option<&ReplicationProbeResult>,
    ) -> ClusterHealth {
        if topology.primary().is_none() {
            return ClusterHealth::Degraded {
                reason: "no primary member".to_string(),
            };
        }

        let healthy = topology.healthy_members();
        if topology.source == TopologySource::ReplicaSet && healthy < self.min_healthy {
            return ClusterHealth::Degraded {
                reason: format!(
                    "{} of {} members healthy, {} required",
                    healthy,
                    topology.members.len(),
                    self.min_healthy
                ),
            };
        }

        match replication.map(|r| r.status) {
            Some(ReplicationStatus::Failed) => ClusterHealth::Degraded {
                reason: "replication sentinel not observed".to_string(),
            },
            Some(ReplicationStatus::Warning) => ClusterHealth::Degraded {
                reason: "replication lag above threshold".to_string(),
            },
            _ => ClusterHealth::Healthy,
        }
    }
}

/// Any successful probe is healthy
#[derive(Debug, Clone, Default)]
pub struct ReachablePolicy;

impl HealthPolicy for ReachablePolicy {
    fn name(&self) -> &'static str {
        "reachable"
    }

    fn classify(
        &self,
        topology: &TopologySnapshot,
        _replication: Option<&ReplicationProbeResult>,
    ) -> ClusterHealth {
        if topology.healthy {
            ClusterHealth::Healthy
        } else {
            ClusterHealth::Unknown {
                reason: "probe did not succeed".to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::replica_status_document;

    fn snapshot(members: &[(&str, i32, bool)]) -> TopologySnapshot {
        TopologySnapshot::from_status(&replica_status_document("rs0", members)).unwrap()
    }

    fn replication(status: ReplicationStatus) -> ReplicationProbeResult {
        let mut result = ReplicationProbeResult::failed("s".to_string(), "x".to_string());
        result.status = status;
        result
    }

    #[test]
    fn test_cluster_health_display() {
        assert_eq!(ClusterHealth::Healthy.to_string(), "Healthy");
        assert_eq!(
            ClusterHealth::Degraded {
                reason: "test".to_string()
            }
            .to_string(),
            "Degraded: test"
        );
        assert!(!ClusterHealth::Unknown {
            reason: "x".to_string()
        }
        .is_healthy());
    }

    #[test]
    fn test_quorum_policy() {
        let policy = QuorumPolicy::default();

        let full = snapshot(&[("a", 1, true), ("b", 2, true)]);
        assert!(policy.classify(&full, None).is_healthy());
        assert!(policy
            .classify(&full, Some(&replication(ReplicationStatus::Healthy)))
            .is_healthy());
        assert!(!policy
            .classify(&full, Some(&replication(ReplicationStatus::Failed)))
            .is_healthy());

        let short = snapshot(&[("a", 1, true), ("b", 2, false)]);
        assert!(matches!(
            policy.classify(&short, None),
            ClusterHealth::Degraded { .. }
        ));

        let headless = snapshot(&[("a", 2, true), ("b", 2, true)]);
        assert!(!policy.classify(&headless, None).is_healthy());
    }

    #[test]
    fn test_single_node_is_not_an_alarm() {
        let single = TopologySnapshot::single_node("localhost:27017");
        assert!(QuorumPolicy::default().classify(&single, None).is_healthy());
        assert!(ReachablePolicy.classify(&single, None).is_healthy());
    }

    #[test]
    fn test_reachable_policy_ignores_member_count() {
        let short = snapshot(&[("a", 1, true), ("b", 2, false)]);
        assert!(ReachablePolicy.classify(&short, None).is_healthy());
    }
}
