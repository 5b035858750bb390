/// Routing facade
///
/// `ConnectionManager` hands out write and read handles backed by whichever
/// connection set the establisher last committed. The first caller without a
/// live set runs the ladder and bootstrap under a lock; concurrent callers
/// wait for it and reuse the result.
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::bootstrap::{BootstrapState, Bootstrapper};
use crate::config::Config;
use crate::core::{
    ConnectionSet, ConnectionStrategy, Establisher, Role, StoreConnector, StoreHandle, StrategyKind,
};
use crate::error::VigiaResult;
use crate::health::{
    MetricsCollector, MetricsReport, ReplicationProbeResult, ReplicationVerifier, TopologyProbe,
    TopologySnapshot,
};
use crate::utils::generate_id;

/// A handle resolved for one role
#[derive(Clone)]
pub struct RoutedDatabase {
    role: Role,
    set: Arc<ConnectionSet>,
}

impl RoutedDatabase {
    pub fn role(&self) -> Role {
        self.role
    }

    pub fn strategy(&self) -> StrategyKind {
        self.set.strategy()
    }

    pub fn handle(&self) -> &Arc<dyn StoreHandle> {
        match self.role {
            Role::Primary => self.set.write(),
            Role::Secondary => self.set.read(),
            Role::FullTopology => self.set.diagnostic(),
        }
    }

    pub fn connection_set(&self) -> &Arc<ConnectionSet> {
        &self.set
    }
}

impl Deref for RoutedDatabase {
    type Target = dyn StoreHandle;

    fn deref(&self) -> &Self::Target {
        self.handle().as_ref()
    }
}

impl fmt::Debug for RoutedDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutedDatabase")
            .field("role", &self.role)
            .field("strategy", &self.set.strategy())
            .field("database", &self.handle().database_name())
            .finish()
    }
}

/// Process-wide owner of the live connection set
pub struct ConnectionManager {
    establisher: Establisher,
    bootstrapper: Option<Bootstrapper>,
    probe: TopologyProbe,
    verifier: ReplicationVerifier,
    metrics: MetricsCollector,
    op_timeout: Duration,
    current: RwLock<Option<Arc<ConnectionSet>>>,
    establishing: Mutex<()>,
    bootstrap_state: Mutex<BootstrapState>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn StoreConnector>, config: &Config) -> Self {
        let op_timeout = config.connection.operation_timeout();
        let bootstrapper = config
            .bootstrap
            .enabled
            .then(|| Bootstrapper::from_config(&config.bootstrap, op_timeout));

        Self {
            establisher: Establisher::new(connector, ConnectionStrategy::ladder(config)),
            bootstrapper,
            probe: TopologyProbe::new(op_timeout),
            verifier: ReplicationVerifier::from_config(&config.health, op_timeout),
            metrics: MetricsCollector::new(op_timeout),
            op_timeout,
            current: RwLock::new(None),
            establishing: Mutex::new(()),
            bootstrap_state: Mutex::new(BootstrapState::default()),
        }
    }

    /// Time budget of a single store operation
    pub fn operation_timeout(&self) -> Duration {
        self.op_timeout
    }

    pub fn verifier(&self) -> &ReplicationVerifier {
        &self.verifier
    }

    /// The live connection set, establishing one if needed
    pub async fn establish(&self) -> VigiaResult<Arc<ConnectionSet>> {
        if let Some(set) = self.current.read().await.as_ref() {
            return Ok(Arc::clone(set));
        }

        let _guard = self.establishing.lock().await;
        if let Some(set) = self.current.read().await.as_ref() {
            debug!("Connection established by a concurrent caller");
            return Ok(Arc::clone(set));
        }

        let set = Arc::new(self.establisher.establish().await?);
        self.run_bootstrap(&set).await;
        *self.current.write().await = Some(Arc::clone(&set));
        Ok(set)
    }

    async fn run_bootstrap(&self, set: &ConnectionSet) {
        let Some(bootstrapper) = &self.bootstrapper else {
            return;
        };

        let mut state = self.bootstrap_state.lock().await;
        if state.is_confirmed(bootstrapper.plan()) {
            debug!("Bootstrap already confirmed, skipping");
            return;
        }

        let report = bootstrapper.bootstrap(set.write().as_ref()).await;
        state.record(&report);
        if let Err(e) = report.into_result() {
            warn!("{} (continuing)", e);
        }
    }

    /// Handle for writes
    pub async fn for_write(&self) -> VigiaResult<RoutedDatabase> {
        Ok(RoutedDatabase {
            role: Role::Primary,
            set: self.establish().await?,
        })
    }

    /// Handle for reads. May alias the write connection.
    pub async fn for_read(&self) -> VigiaResult<RoutedDatabase> {
        Ok(RoutedDatabase {
            role: Role::Secondary,
            set: self.establish().await?,
        })
    }

    /// The live set without establishing
    pub async fn current(&self) -> Option<Arc<ConnectionSet>> {
        self.current.read().await.clone()
    }

    pub async fn is_established(&self) -> bool {
        self.current.read().await.is_some()
    }

    /// Drop and close the live set; the next lookup runs the full ladder again
    pub async fn reset(&self) -> bool {
        let _guard = self.establishing.lock().await;
        let previous = self.current.write().await.take();
        match previous {
            Some(set) => {
                info!("Resetting {} connection set", set.strategy());
                set.close().await;
                true
            }
            None => false,
        }
    }

    /// Close all connections. Safe to call repeatedly.
    pub async fn close(&self) {
        self.reset().await;
    }

    pub async fn topology(&self) -> VigiaResult<TopologySnapshot> {
        let set = self.establish().await?;
        self.probe.probe(&set).await
    }

    /// Never fails; an unreachable store yields a failed result
    pub async fn verify_replication(&self) -> ReplicationProbeResult {
        match self.establish().await {
            Ok(set) => {
                self.verifier
                    .verify(set.write().as_ref(), set.read().as_ref())
                    .await
            }
            Err(e) => ReplicationProbeResult::failed(
                generate_id(crate::bootstrap::REPLICATION_TEST),
                e.to_string(),
            ),
        }
    }

    /// Never fails; each side reports its own availability
    pub async fn metrics(&self) -> MetricsReport {
        match self.establish().await {
            Ok(set) => self.metrics.collect(&set).await,
            Err(e) => MetricsReport::unavailable(&e.to_string()),
        }
    }

    pub async fn bootstrap_state(&self) -> BootstrapState {
        self.bootstrap_state.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::USERS;
    use crate::core::memory::{MemoryConnector, MemoryStore};
    use crate::error::VigiaError;
    use crate::health::ReplicationStatus;
    use mongodb::bson::doc;

    fn manager(connector: Arc<MemoryConnector>) -> ConnectionManager {
        ConnectionManager::new(connector, &Config::default())
    }

    #[tokio::test]
    async fn test_lazy_establishment() {
        let store = MemoryStore::new();
        let connector = Arc::new(MemoryConnector::new(Arc::clone(&store)));
        let manager = manager(Arc::clone(&connector));
        assert!(!manager.is_established().await);

        let write = manager.for_write().await.unwrap();
        write.insert_one("videos", doc! { "title": "clip" }).await.unwrap();
        let read = manager.for_read().await.unwrap();

        assert!(manager.is_established().await);
        assert!(Arc::ptr_eq(write.connection_set(), read.connection_set()));
        assert_eq!(read.role(), Role::Secondary);
        assert_eq!(read.count_documents("videos", doc! {}).await.unwrap(), 1);
        assert_eq!(connector.opened(), vec![StrategyKind::DirectSimple]);
        assert_eq!(store.documents(USERS).len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_set() {
        let store = MemoryStore::new();
        let connector = Arc::new(
            MemoryConnector::new(Arc::clone(&store)).with_open_delay(Duration::from_millis(50)),
        );
        let manager = Arc::new(manager(Arc::clone(&connector)));

        let mut tasks = Vec::new();
        for i in 0..8 {
            let manager = Arc::clone(&manager);
            tasks.push(tokio::spawn(async move {
                let routed = if i % 2 == 0 {
                    manager.for_write().await
                } else {
                    manager.for_read().await
                };
                Arc::clone(routed.unwrap().connection_set())
            }));
        }

        let mut sets = Vec::new();
        for task in tasks {
            sets.push(task.await.unwrap());
        }

        assert!(sets.iter().all(|s| Arc::ptr_eq(s, &sets[0])));
        assert_eq!(connector.opened().len(), 1);
        assert_eq!(connector.live_handles(), 1);
        assert_eq!(manager.bootstrap_state().await.runs, 1);
        assert_eq!(store.documents(USERS).len(), 1);
    }

    #[tokio::test]
    async fn test_reset_runs_ladder_again_and_skips_bootstrap() {
        let store = MemoryStore::new();
        let connector = Arc::new(MemoryConnector::new(Arc::clone(&store)));
        let manager = manager(Arc::clone(&connector));

        let first = manager.establish().await.unwrap();
        assert!(manager.reset().await);
        assert!(!manager.reset().await);
        assert_eq!(connector.live_handles(), 0);

        let second = manager.establish().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(connector.opened().len(), 2);
        assert_eq!(manager.bootstrap_state().await.runs, 1);
    }

    #[tokio::test]
    async fn test_exhausted_ladder_leaves_nothing_live() {
        let store = MemoryStore::new();
        let connector = Arc::new(
            MemoryConnector::new(store)
                .unreachable(StrategyKind::DirectSimple)
                .unreachable(StrategyKind::FullTopology)
                .unreachable(StrategyKind::DirectForced),
        );
        let manager = manager(Arc::clone(&connector));

        let err = manager.for_write().await.unwrap_err();
        assert!(matches!(err, VigiaError::ConnectionExhausted { .. }));
        assert!(err.is_fatal());
        assert!(!manager.is_established().await);
        assert_eq!(connector.live_handles(), 0);

        let replication = manager.verify_replication().await;
        assert_eq!(replication.status, ReplicationStatus::Failed);
        assert!(!manager.metrics().await.primary.is_available());
    }

    #[tokio::test]
    async fn test_single_node_topology_through_facade() {
        let store = MemoryStore::new();
        let connector = Arc::new(MemoryConnector::new(store));
        let manager = manager(connector);

        let snapshot = manager.topology().await.unwrap();
        assert_eq!(snapshot.members.len(), 1);
        assert!(snapshot.members[0].is_primary());

        let replication = manager.verify_replication().await;
        assert!(replication.observed);

        let metrics = manager.metrics().await;
        assert!(metrics.primary.is_available());
        assert!(metrics.secondary.is_available());
    }

    #[test]
    fn test_out_of_range_lag_threshold_does_not_panic() {
        let mut config = Config::default();
        config.health.replication_lag_threshold_sec = 1e30;
        assert!(config.validate().is_err());

        let connector = Arc::new(MemoryConnector::new(MemoryStore::new()));
        let manager = ConnectionManager::new(connector, &config);
        assert_eq!(manager.operation_timeout(), Duration::from_millis(5000));
    }

    #[tokio::test]
    async fn test_bootstrap_disabled() {
        let store = MemoryStore::new();
        let connector = Arc::new(MemoryConnector::new(Arc::clone(&store)));
        let mut config = Config::default();
        config.bootstrap.enabled = false;
        let manager = ConnectionManager::new(connector, &config);

        manager.establish().await.unwrap();
        assert_eq!(manager.bootstrap_state().await.runs, 0);
        assert!(store.documents(USERS).is_empty());
    }
}
