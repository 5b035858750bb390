pub mod bootstrap;
pub mod config;
pub mod error;
/// Vigia - connection and health manager for primary/secondary MongoDB replica sets
///
/// Vigia establishes connections through an ordered ladder of strategies,
/// bootstraps required collections, indexes and a privileged account, and
/// continuously verifies that writes actually replicate:
/// 1. Connection Establisher: direct, full-topology and forced-direct rungs
/// 2. Store Bootstrapper: idempotent schema and account setup
/// 3. Topology Probe and Replication Verifier: on-demand cluster diagnostics
/// 4. Routing Facade: stable write/read handles for application code
pub mod core;
pub mod health;
pub mod routing;
pub mod utils;

use std::sync::Arc;
use tracing::info;

pub use crate::config::Config;
pub use crate::core::{ConnectionSet, StoreConnector, StoreHandle, StrategyKind};
pub use crate::error::{StoreError, VigiaError, VigiaResult};
pub use crate::health::{
    ClusterHealth, HealthMonitor, HealthReport, MetricsReport, ReplicationProbeResult,
    TopologySnapshot,
};
pub use crate::routing::{ConnectionManager, RoutedDatabase};

use crate::core::mongo::MongoConnector;

/// Process-wide context: one manager and one monitor, passed to collaborators
pub struct Vigia {
    config: Config,
    manager: Arc<ConnectionManager>,
    monitor: Arc<HealthMonitor>,
}

impl Vigia {
    /// Create a context backed by the MongoDB driver
    pub fn new(config: Config) -> VigiaResult<Self> {
        Self::with_connector(config, Arc::new(MongoConnector::new()))
    }

    /// Create a context with a custom connector
    pub fn with_connector(config: Config, connector: Arc<dyn StoreConnector>) -> VigiaResult<Self> {
        config.validate()?;

        let manager = Arc::new(ConnectionManager::new(connector, &config));
        let monitor = Arc::new(HealthMonitor::from_config(
            Arc::clone(&manager),
            &config.health,
        ));

        Ok(Self {
            config,
            manager,
            monitor,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn monitor(&self) -> &Arc<HealthMonitor> {
        &self.monitor
    }

    /// Establish connections and bootstrap. `ConnectionExhausted` is fatal.
    pub async fn start(&self) -> VigiaResult<Arc<ConnectionSet>> {
        info!("Starting vigia v{}", env!("CARGO_PKG_VERSION"));
        let set = self.manager.establish().await?;
        info!(
            "Connected to {} via {} strategy",
            set.config().seed_list(),
            set.strategy()
        );
        Ok(set)
    }

    /// Run the health monitor until the future is dropped
    pub async fn run_health_checks(&self) {
        info!(
            "Starting health checks every {}",
            utils::format_duration(self.config.health.interval())
        );
        self.monitor.run().await;
    }

    /// Close all connections
    pub async fn shutdown(&self) {
        self.manager.close().await;
        info!("Vigia shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::{MemoryConnector, MemoryStore};

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = Config::default();
        config.store.database = String::new();
        let connector = Arc::new(MemoryConnector::new(MemoryStore::new()));
        let result = Vigia::with_connector(config, connector);
        assert!(matches!(result, Err(VigiaError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let connector = Arc::new(MemoryConnector::new(MemoryStore::new()));
        let vigia = Vigia::with_connector(Config::default(), connector.clone()).unwrap();

        let set = vigia.start().await.unwrap();
        assert_eq!(set.strategy(), StrategyKind::DirectSimple);
        assert_eq!(connector.live_handles(), 1);

        vigia.shutdown().await;
        vigia.shutdown().await;
        assert_eq!(connector.live_handles(), 0);
        assert!(!vigia.manager().is_established().await);
    }

    #[tokio::test]
    async fn test_start_fails_when_exhausted() {
        let connector = Arc::new(
            MemoryConnector::new(MemoryStore::new())
                .unreachable(StrategyKind::DirectSimple)
                .unreachable(StrategyKind::FullTopology)
                .unreachable(StrategyKind::DirectForced),
        );
        let vigia = Vigia::with_connector(Config::default(), connector).unwrap();
        let err = vigia.start().await.unwrap_err();
        assert!(err.is_fatal());
    }
}
