/// Periodic health checking against the routing facade
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::{timeout, Interval, MissedTickBehavior};

use super::{ClusterHealth, HealthPolicy, QuorumPolicy, ReplicationProbeResult, TopologySnapshot};
use crate::config::HealthConfig;
use crate::core::StrategyKind;
use crate::routing::ConnectionManager;

/// Result of one health check round
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub health: ClusterHealth,
    pub policy: String,
    pub strategy: Option<StrategyKind>,
    pub topology: Option<TopologySnapshot>,
    pub replication: Option<ReplicationProbeResult>,
    pub checked_at: DateTime<Utc>,
}

impl HealthReport {
    fn unknown(policy: &str, reason: String) -> Self {
        Self {
            health: ClusterHealth::Unknown { reason },
            policy: policy.to_string(),
            strategy: None,
            topology: None,
            replication: None,
            checked_at: Utc::now(),
        }
    }
}

pub struct HealthMonitor {
    manager: Arc<ConnectionManager>,
    policy: Box<dyn HealthPolicy>,
    interval: Duration,
    check_timeout: Duration,
    last: RwLock<Option<HealthReport>>,
}

impl HealthMonitor {
    pub fn new(
        manager: Arc<ConnectionManager>,
        policy: Box<dyn HealthPolicy>,
        interval: Duration,
        check_timeout: Duration,
    ) -> Self {
        Self {
            manager,
            policy,
            interval,
            check_timeout,
            last: RwLock::new(None),
        }
    }

    pub fn from_config(manager: Arc<ConnectionManager>, config: &HealthConfig) -> Self {
        let check_timeout = manager
            .operation_timeout()
            .saturating_mul(2)
            .saturating_add(manager.verifier().budget());
        let policy = QuorumPolicy {
            min_healthy: config.min_healthy_members,
        };
        Self::new(manager, Box::new(policy), config.interval(), check_timeout)
    }

    /// Perform one check with timeout
    pub async fn check(&self) -> HealthReport {
        let report = match timeout(self.check_timeout, self.run_checks()).await {
            Ok(report) => report,
            Err(_) => {
                HealthReport::unknown(self.policy.name(), "health check timed out".to_string())
            }
        };
        *self.last.write().await = Some(report.clone());
        report
    }

    async fn run_checks(&self) -> HealthReport {
        let set = match self.manager.establish().await {
            Ok(set) => set,
            Err(e) => return HealthReport::unknown(self.policy.name(), e.to_string()),
        };

        let replication = self.manager.verify_replication().await;
        let (health, topology) = match self.manager.topology().await {
            Ok(snapshot) => (
                self.policy.classify(&snapshot, Some(&replication)),
                Some(snapshot),
            ),
            Err(e) => (
                ClusterHealth::Unknown {
                    reason: e.to_string(),
                },
                None,
            ),
        };

        HealthReport {
            health,
            policy: self.policy.name().to_string(),
            strategy: Some(set.strategy()),
            topology,
            replication: Some(replication),
            checked_at: Utc::now(),
        }
    }

    /// The most recent report, if any check has run
    pub async fn last_report(&self) -> Option<HealthReport> {
        self.last.read().await.clone()
    }

    /// Ticks once per interval. A check overrunning the interval delays the
    /// next tick instead of queueing catch-up checks.
    fn ticker(&self) -> Interval {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    }

    /// Run continuous health checking. Failures are logged, never fatal.
    pub async fn run(&self) {
        let mut interval = self.ticker();

        loop {
            interval.tick().await;

            let report = self.check().await;
            if let Some(e) = report.replication.as_ref().and_then(|r| r.unverified()) {
                tracing::warn!("{}", e);
            }

            match &report.health {
                ClusterHealth::Healthy => {
                    tracing::debug!("Cluster is healthy ({:?})", report.strategy);
                }
                ClusterHealth::Degraded { reason } => {
                    tracing::warn!("Cluster is degraded: {}", reason);
                }
                ClusterHealth::Unknown { reason } => {
                    tracing::warn!("Cluster status unknown: {}", reason);
                }
            }
        }
    }
}
