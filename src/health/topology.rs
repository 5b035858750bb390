/// Replica-set topology probe
///
/// Normalizes the raw `replSetGetStatus` reply into a `TopologySnapshot`.
/// Snapshots are produced fresh on every probe and never cached.
use chrono::{DateTime, Utc};
use mongodb::bson::{Bson, Document};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::core::store::with_timeout;
use crate::core::{ConnectionSet, StoreHandle};
use crate::error::{StoreError, VigiaError, VigiaResult};
use crate::utils::{bson_datetime, bson_number};

/// Role flag of a member. Variants are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberRole {
    Primary,
    Secondary,
    Arbiter,
    Other,
}

impl MemberRole {
    pub fn from_state(state: i64) -> Self {
        match state {
            1 => MemberRole::Primary,
            2 => MemberRole::Secondary,
            7 => MemberRole::Arbiter,
            _ => MemberRole::Other,
        }
    }

    fn from_state_str(state: &str) -> Self {
        match state {
            "PRIMARY" => MemberRole::Primary,
            "SECONDARY" => MemberRole::Secondary,
            "ARBITER" => MemberRole::Arbiter,
            _ => MemberRole::Other,
        }
    }
}

impl fmt::Display for MemberRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemberRole::Primary => write!(f, "primary"),
            MemberRole::Secondary => write!(f, "secondary"),
            MemberRole::Arbiter => write!(f, "arbiter"),
            MemberRole::Other => write!(f, "other"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemberStatus {
    pub address: String,
    pub role: MemberRole,
    pub state: String,
    pub healthy: bool,
    pub ping_ms: Option<f64>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl MemberStatus {
    pub fn is_primary(&self) -> bool {
        self.role == MemberRole::Primary
    }

    pub fn is_secondary(&self) -> bool {
        self.role == MemberRole::Secondary
    }

    pub fn is_arbiter(&self) -> bool {
        self.role == MemberRole::Arbiter
    }
}

/// Where a snapshot came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TopologySource {
    /// Reply of the replica-set status command
    ReplicaSet,
    /// Synthesized for a single-node connection
    SingleNode,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TopologySnapshot {
    pub set_name: Option<String>,
    pub members: Vec<MemberStatus>,
    /// Address of the primary member, if any
    pub primary: Option<String>,
    /// True when the probe itself succeeded
    pub healthy: bool,
    pub source: TopologySource,
    pub server_time: Option<DateTime<Utc>>,
    pub fetched_at: DateTime<Utc>,
}

impl TopologySnapshot {
    /// Parse a `replSetGetStatus` reply
    pub fn from_status(status: &Document) -> Result<Self, StoreError> {
        let raw_members = status
            .get_array("members")
            .map_err(|_| StoreError::other("status reply has no members array"))?;

        let members: Vec<MemberStatus> = raw_members
            .iter()
            .filter_map(|member| match member {
                Bson::Document(member) => Some(parse_member(member)),
                _ => None,
            })
            .collect();

        let primary = members
            .iter()
            .find(|m| m.is_primary())
            .map(|m| m.address.clone());

        Ok(Self {
            set_name: status.get_str("set").ok().map(str::to_string),
            members,
            primary,
            healthy: true,
            source: TopologySource::ReplicaSet,
            server_time: status.get("date").and_then(bson_datetime),
            fetched_at: Utc::now(),
        })
    }

    /// One healthy primary member at `address`
    pub fn single_node(address: &str) -> Self {
        Self {
            set_name: None,
            members: vec![MemberStatus {
                address: address.to_string(),
                role: MemberRole::Primary,
                state: "PRIMARY".to_string(),
                healthy: true,
                ping_ms: None,
                last_heartbeat: None,
            }],
            primary: Some(address.to_string()),
            healthy: true,
            source: TopologySource::SingleNode,
            server_time: None,
            fetched_at: Utc::now(),
        }
    }

    pub fn healthy_members(&self) -> usize {
        self.members.iter().filter(|m| m.healthy).count()
    }

    pub fn primary(&self) -> Option<&MemberStatus> {
        self.members.iter().find(|m| m.is_primary())
    }

    pub fn secondaries(&self) -> impl Iterator<Item = &MemberStatus> {
        self.members.iter().filter(|m| m.is_secondary())
    }
}

fn parse_member(member: &Document) -> MemberStatus {
    let state_str = member.get_str("stateStr").unwrap_or("UNKNOWN");
    let role = match member.get("state").and_then(bson_number) {
        Some(state) => MemberRole::from_state(state as i64),
        None => MemberRole::from_state_str(state_str),
    };

    MemberStatus {
        address: member.get_str("name").unwrap_or("unknown").to_string(),
        role,
        state: state_str.to_string(),
        healthy: member
            .get("health")
            .and_then(bson_number)
            .map(|h| h >= 1.0)
            .unwrap_or(false),
        ping_ms: member.get("pingMs").and_then(bson_number),
        last_heartbeat: member.get("lastHeartbeat").and_then(bson_datetime),
    }
}

/// Issues the status command against the diagnostic handle
#[derive(Debug, Clone)]
pub struct TopologyProbe {
    op_timeout: Duration,
}

impl TopologyProbe {
    pub fn new(op_timeout: Duration) -> Self {
        Self { op_timeout }
    }

    /// Raw probe against one handle. Fails with `TopologyUnavailable`.
    pub async fn probe_handle(&self, handle: &dyn StoreHandle) -> VigiaResult<TopologySnapshot> {
        let status = with_timeout(self.op_timeout, "replSetGetStatus", handle.replica_set_status())
            .await
            .map_err(VigiaError::topology_unavailable)?;
        TopologySnapshot::from_status(&status).map_err(VigiaError::topology_unavailable)
    }

    /// Probe a committed connection set. Single-node strategies fall back to
    /// a synthesized snapshot instead of failing.
    pub async fn probe(&self, set: &ConnectionSet) -> VigiaResult<TopologySnapshot> {
        match self.probe_handle(set.diagnostic().as_ref()).await {
            Ok(snapshot) => Ok(snapshot),
            Err(e) if set.strategy().is_single_node() => {
                debug!("Synthesizing single-node topology after: {}", e);
                Ok(TopologySnapshot::single_node(&set.config().primary_address()))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::core::memory::{replica_status_document, MemoryStore};
    use crate::core::{ConnectionStrategy, StrategyKind};
    use mongodb::bson::doc;

    fn strategy(kind: StrategyKind) -> ConnectionStrategy {
        ConnectionStrategy::ladder(&Config::default())
            .into_iter()
            .find(|s| s.kind == kind)
            .unwrap()
    }

    fn set_for(store: &std::sync::Arc<MemoryStore>, kind: StrategyKind) -> ConnectionSet {
        ConnectionSet::single(store.handle("app"), &strategy(kind), Vec::new())
    }

    #[test]
    fn test_parse_status() {
        let status = replica_status_document(
            "rs0",
            &[("db-a:27017", 1, true), ("db-b:27017", 2, true), ("db-c:27017", 7, false)],
        );
        let snapshot = TopologySnapshot::from_status(&status).unwrap();

        assert_eq!(snapshot.set_name.as_deref(), Some("rs0"));
        assert_eq!(snapshot.source, TopologySource::ReplicaSet);
        assert_eq!(snapshot.primary.as_deref(), Some("db-a:27017"));
        assert_eq!(snapshot.healthy_members(), 2);
        assert!(snapshot.members[1].is_secondary());
        assert!(snapshot.members[2].is_arbiter());
        assert!(!snapshot.members[2].healthy);
        assert!(snapshot.members[0].ping_ms.is_none());
        assert!(snapshot.members[1].ping_ms.is_some());
        assert!(snapshot.members[1].last_heartbeat.is_some());
        assert!(snapshot.server_time.is_some());
    }

    #[test]
    fn test_role_flags_are_exclusive() {
        for state in [0, 1, 2, 3, 7, 8] {
            let member = parse_member(&doc! { "name": "n", "state": state, "health": 1 });
            let flags = [member.is_primary(), member.is_secondary(), member.is_arbiter()];
            assert!(flags.iter().filter(|f| **f).count() <= 1);
        }
    }

    #[test]
    fn test_state_str_fallback_and_integer_health() {
        let member = parse_member(&doc! { "name": "n", "stateStr": "SECONDARY", "health": 1i32 });
        assert_eq!(member.role, MemberRole::Secondary);
        assert!(member.healthy);
    }

    #[test]
    fn test_missing_members_is_an_error() {
        assert!(TopologySnapshot::from_status(&doc! { "ok": 1.0 }).is_err());
    }

    #[tokio::test]
    async fn test_single_node_strategy_synthesizes() {
        let store = MemoryStore::new();
        let probe = TopologyProbe::new(Duration::from_secs(1));

        for kind in [StrategyKind::DirectSimple, StrategyKind::DirectForced] {
            let snapshot = probe.probe(&set_for(&store, kind)).await.unwrap();
            assert_eq!(snapshot.source, TopologySource::SingleNode);
            assert_eq!(snapshot.members.len(), 1);
            assert!(snapshot.members[0].is_primary());
            assert!(snapshot.members[0].healthy);
            assert_eq!(snapshot.primary.as_deref(), Some("localhost:27017"));
        }
    }

    #[tokio::test]
    async fn test_direct_strategy_prefers_real_status() {
        let store = MemoryStore::replica_set("rs0", &[("a:1", 1, true), ("b:2", 2, true)]);
        let probe = TopologyProbe::new(Duration::from_secs(1));
        let snapshot = probe
            .probe(&set_for(&store, StrategyKind::DirectSimple))
            .await
            .unwrap();
        assert_eq!(snapshot.source, TopologySource::ReplicaSet);
        assert_eq!(snapshot.members.len(), 2);
    }

    #[tokio::test]
    async fn test_full_topology_failure_is_unavailable() {
        let store = MemoryStore::new();
        let probe = TopologyProbe::new(Duration::from_secs(1));
        let err = probe
            .probe(&set_for(&store, StrategyKind::FullTopology))
            .await
            .unwrap_err();
        assert!(matches!(err, VigiaError::TopologyUnavailable { .. }));
        assert!(!err.is_fatal());
    }
}
