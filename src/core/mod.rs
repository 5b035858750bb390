/// Core abstractions shared by the establisher, bootstrapper and probes
pub mod connection;
#[cfg(any(test, feature = "testing"))]
pub mod memory;
pub mod mongo;
pub mod store;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use connection::{
    AttemptOutcome, AttemptReport, ConnectionSet, ConnectionStrategy, Establisher, StrategyKind,
};
pub use store::{IndexSpec, StoreConnector, StoreHandle};

/// Which side of the replica set a configuration addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Primary,
    Secondary,
    FullTopology,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Primary => write!(f, "primary"),
            Role::Secondary => write!(f, "secondary"),
            Role::FullTopology => write!(f, "full-topology"),
        }
    }
}

/// A `host:port` pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostAddr {
    pub host: String,
    pub port: u16,
}

impl HostAddr {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Store credentials
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub auth_source: String,
}

// Keeps passwords out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .field("auth_source", &self.auth_source)
            .finish()
    }
}

/// Read routing intent applied on top of whichever connection succeeded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadPreferenceMode {
    Primary,
    PrimaryPreferred,
    SecondaryPreferred,
}

impl ReadPreferenceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadPreferenceMode::Primary => "primary",
            ReadPreferenceMode::PrimaryPreferred => "primaryPreferred",
            ReadPreferenceMode::SecondaryPreferred => "secondaryPreferred",
        }
    }
}

/// Consistency and write-guarantee flags of a connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuaranteeFlags {
    pub write_majority: bool,
    pub journal: bool,
    pub retry_writes: Option<bool>,
    pub retry_reads: Option<bool>,
    /// `Some(true)` disables topology auto-detection
    pub direct_connection: Option<bool>,
    pub read_preference: Option<ReadPreferenceMode>,
    pub max_pool_size: Option<u32>,
}

/// Immutable description of one way to reach the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub role: Role,
    pub hosts: Vec<HostAddr>,
    pub credentials: Option<Credentials>,
    pub database: String,
    pub replica_set: Option<String>,
    pub flags: GuaranteeFlags,
}

impl ConnectionConfig {
    /// Address reported for this configuration in single-node mode
    pub fn primary_address(&self) -> String {
        self.hosts
            .first()
            .map(|h| h.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Host list joined as a seed list
    pub fn seed_list(&self) -> String {
        self.hosts
            .iter()
            .map(|h| h.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}
