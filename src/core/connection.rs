/// Connection establishment
///
/// The establisher walks an ordered ladder of strategies. Each rung opens a
/// pool, issues a liveness check, and either commits (the same connection
/// then backs the write, read and diagnostic roles) or closes what it opened
/// and falls through to the next rung.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::store::{with_timeout, StoreConnector, StoreHandle};
use super::{ConnectionConfig, Credentials, GuaranteeFlags, HostAddr, ReadPreferenceMode, Role};
use crate::config::Config;
use crate::error::{StoreError, VigiaError, VigiaResult};

/// One rung of the establishment ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Single node, short timeout, no replica-set parameter
    DirectSimple,
    /// Seed list with replica-set name and explicit write guarantees
    FullTopology,
    /// Single primary with topology discovery disabled
    DirectForced,
    /// Single node without credentials
    DirectUnauthenticated,
}

impl StrategyKind {
    /// Strategies that address a single node rather than the replica set
    pub fn is_single_node(&self) -> bool {
        !matches!(self, StrategyKind::FullTopology)
    }

    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::DirectSimple => "direct-simple",
            StrategyKind::FullTopology => "full-topology",
            StrategyKind::DirectForced => "direct-forced",
            StrategyKind::DirectUnauthenticated => "direct-unauthenticated",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A strategy descriptor: addressing, guarantees and time budget
#[derive(Debug, Clone)]
pub struct ConnectionStrategy {
    pub kind: StrategyKind,
    pub config: ConnectionConfig,
    pub timeout: Duration,
}

impl ConnectionStrategy {
    /// Build the ordered strategy ladder from configuration
    pub fn ladder(config: &Config) -> Vec<ConnectionStrategy> {
        let store = &config.store;
        let settings = &config.connection;
        let primary = HostAddr::new(store.primary_host.clone(), store.primary_port);
        let secondary = HostAddr::new(store.secondary_host.clone(), store.secondary_port);
        let credentials = match (&store.username, &store.password) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
                auth_source: store.auth_source.clone(),
            }),
            _ => None,
        };

        let single_node = |kind: StrategyKind,
                           credentials: Option<Credentials>,
                           direct_connection: Option<bool>,
                           timeout: Duration| ConnectionStrategy {
            kind,
            config: ConnectionConfig {
                role: Role::Primary,
                hosts: vec![primary.clone()],
                credentials,
                database: store.database.clone(),
                replica_set: None,
                flags: GuaranteeFlags {
                    direct_connection,
                    max_pool_size: Some(settings.max_pool_size),
                    ..Default::default()
                },
            },
            timeout,
        };

        let mut ladder = vec![single_node(
            StrategyKind::DirectSimple,
            credentials.clone(),
            None,
            settings.direct_timeout(),
        )];

        match &store.replica_set {
            Some(replica_set) => ladder.push(ConnectionStrategy {
                kind: StrategyKind::FullTopology,
                config: ConnectionConfig {
                    role: Role::FullTopology,
                    hosts: vec![primary.clone(), secondary],
                    credentials: credentials.clone(),
                    database: store.database.clone(),
                    replica_set: Some(replica_set.clone()),
                    flags: GuaranteeFlags {
                        write_majority: settings.write_majority,
                        journal: settings.journal,
                        retry_writes: Some(false),
                        retry_reads: Some(false),
                        direct_connection: None,
                        read_preference: Some(ReadPreferenceMode::PrimaryPreferred),
                        max_pool_size: Some(settings.max_pool_size),
                    },
                },
                timeout: settings.topology_timeout(),
            }),
            None => debug!("No replica set configured, skipping full-topology strategy"),
        }

        ladder.push(single_node(
            StrategyKind::DirectForced,
            credentials.clone(),
            Some(true),
            settings.forced_timeout(),
        ));

        if settings.allow_unauthenticated_fallback && credentials.is_some() {
            ladder.push(single_node(
                StrategyKind::DirectUnauthenticated,
                None,
                None,
                settings.direct_timeout(),
            ));
        }

        ladder
    }
}

/// Tagged outcome of one establishment attempt
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    Connected,
    OpenFailed(StoreError),
    PingFailed(StoreError),
}

/// Record of one rung of the ladder
#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub strategy: StrategyKind,
    pub outcome: AttemptOutcome,
    pub elapsed: Duration,
}

impl AttemptReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Connected)
    }

    fn cause(&self) -> Option<&StoreError> {
        match &self.outcome {
            AttemptOutcome::Connected => None,
            AttemptOutcome::OpenFailed(cause) | AttemptOutcome::PingFailed(cause) => Some(cause),
        }
    }
}

/// The committed (write, read, diagnostic) handle triple
pub struct ConnectionSet {
    write: Arc<dyn StoreHandle>,
    read: Arc<dyn StoreHandle>,
    diagnostic: Arc<dyn StoreHandle>,
    strategy: StrategyKind,
    config: ConnectionConfig,
    attempts: Vec<AttemptReport>,
    established_at: DateTime<Utc>,
}

impl ConnectionSet {
    /// Overlay all three roles on one physical connection
    pub fn single(
        handle: Arc<dyn StoreHandle>,
        strategy: &ConnectionStrategy,
        attempts: Vec<AttemptReport>,
    ) -> Self {
        Self {
            write: Arc::clone(&handle),
            read: Arc::clone(&handle),
            diagnostic: handle,
            strategy: strategy.kind,
            config: strategy.config.clone(),
            attempts,
            established_at: Utc::now(),
        }
    }

    pub fn write(&self) -> &Arc<dyn StoreHandle> {
        &self.write
    }

    pub fn read(&self) -> &Arc<dyn StoreHandle> {
        &self.read
    }

    pub fn diagnostic(&self) -> &Arc<dyn StoreHandle> {
        &self.diagnostic
    }

    pub fn strategy(&self) -> StrategyKind {
        self.strategy
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn attempts(&self) -> &[AttemptReport] {
        &self.attempts
    }

    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }

    /// Close every role. Handles tolerate repeated closes.
    pub async fn close(&self) {
        self.write.close().await;
        self.read.close().await;
        self.diagnostic.close().await;
        info!("Closed {} connection set", self.strategy);
    }
}

impl fmt::Debug for ConnectionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSet")
            .field("strategy", &self.strategy)
            .field("hosts", &self.config.seed_list())
            .field("database", &self.write.database_name())
            .field("established_at", &self.established_at)
            .finish()
    }
}

/// Runs the strategy ladder against a connector
pub struct Establisher {
    connector: Arc<dyn StoreConnector>,
    strategies: Vec<ConnectionStrategy>,
}

impl Establisher {
    pub fn new(connector: Arc<dyn StoreConnector>, strategies: Vec<ConnectionStrategy>) -> Self {
        Self {
            connector,
            strategies,
        }
    }

    pub fn strategies(&self) -> &[ConnectionStrategy] {
        &self.strategies
    }

    /// Try each strategy in order and commit to the first live one
    pub async fn establish(&self) -> VigiaResult<ConnectionSet> {
        let mut attempts = Vec::with_capacity(self.strategies.len());

        for strategy in &self.strategies {
            info!(
                "Trying {} connection to {}",
                strategy.kind,
                strategy.config.seed_list()
            );

            let (report, handle) = self.attempt(strategy).await;
            let succeeded = report.succeeded();
            attempts.push(report);

            if let (true, Some(handle)) = (succeeded, handle) {
                info!(
                    "Connected via {} after {} attempt(s)",
                    strategy.kind,
                    attempts.len()
                );
                return Ok(ConnectionSet::single(handle, strategy, attempts));
            }
        }

        let last_cause = attempts
            .iter()
            .rev()
            .find_map(|a| a.cause().cloned())
            .unwrap_or_else(|| StoreError::other("no connection strategies configured"));
        error!("All connection strategies failed: {}", last_cause);
        Err(VigiaError::connection_exhausted(last_cause))
    }

    /// Run one rung; on failure nothing it opened is left open
    async fn attempt(
        &self,
        strategy: &ConnectionStrategy,
    ) -> (AttemptReport, Option<Arc<dyn StoreHandle>>) {
        let started = Instant::now();

        let opened = with_timeout(
            strategy.timeout,
            "open",
            self.connector.open(strategy),
        )
        .await;

        let handle = match opened {
            Ok(handle) => handle,
            Err(cause) => {
                warn!("{} connection failed to open: {}", strategy.kind, cause);
                return (
                    AttemptReport {
                        strategy: strategy.kind,
                        outcome: AttemptOutcome::OpenFailed(cause),
                        elapsed: started.elapsed(),
                    },
                    None,
                );
            }
        };

        match with_timeout(strategy.timeout, "ping", handle.ping()).await {
            Ok(()) => (
                AttemptReport {
                    strategy: strategy.kind,
                    outcome: AttemptOutcome::Connected,
                    elapsed: started.elapsed(),
                },
                Some(handle),
            ),
            Err(cause) => {
                warn!("{} connection failed liveness check: {}", strategy.kind, cause);
                handle.close().await;
                (
                    AttemptReport {
                        strategy: strategy.kind,
                        outcome: AttemptOutcome::PingFailed(cause),
                        elapsed: started.elapsed(),
                    },
                    None,
                )
            }
        }
    }
}
