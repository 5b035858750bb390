/// Database statistics gathered per side of the replica set
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

use crate::bootstrap::{USERS, VIDEOS, VIDEO_VIEWS};
use crate::core::store::with_timeout;
use crate::core::{ConnectionSet, ReadPreferenceMode, StoreHandle};
use crate::error::StoreResult;
use crate::utils::{bytes_to_mb, number_field};
use mongodb::bson::doc;

const COUNTED_COLLECTIONS: [&str; 3] = [USERS, VIDEOS, VIDEO_VIEWS];

/// Statistics of one side, or why they could not be read
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SideMetrics {
    Available {
        data_size_mb: f64,
        storage_size_mb: f64,
        index_size_mb: f64,
        collections: u64,
        objects: u64,
        document_counts: BTreeMap<String, u64>,
        connection_role: String,
        read_preference: String,
    },
    Unavailable {
        error: String,
    },
}

impl SideMetrics {
    pub fn is_available(&self) -> bool {
        matches!(self, SideMetrics::Available { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsReport {
    pub primary: SideMetrics,
    pub secondary: SideMetrics,
    pub replica_set_name: Option<String>,
    pub collected_at: DateTime<Utc>,
}

impl MetricsReport {
    /// Both sides unavailable for the same reason
    pub fn unavailable(error: &str) -> Self {
        Self {
            primary: SideMetrics::Unavailable {
                error: error.to_string(),
            },
            secondary: SideMetrics::Unavailable {
                error: error.to_string(),
            },
            replica_set_name: None,
            collected_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsCollector {
    op_timeout: Duration,
}

impl MetricsCollector {
    pub fn new(op_timeout: Duration) -> Self {
        Self { op_timeout }
    }

    pub async fn collect(&self, set: &ConnectionSet) -> MetricsReport {
        let read_preference = set
            .config()
            .flags
            .read_preference
            .unwrap_or(ReadPreferenceMode::Primary);
        self.collect_from(
            set.write().as_ref(),
            set.read().as_ref(),
            set.config().replica_set.clone(),
            read_preference,
        )
        .await
    }

    /// Gather both sides concurrently; one side failing leaves the other intact
    pub async fn collect_from(
        &self,
        write: &dyn StoreHandle,
        read: &dyn StoreHandle,
        replica_set_name: Option<String>,
        read_preference: ReadPreferenceMode,
    ) -> MetricsReport {
        let (primary, secondary) = futures::join!(
            self.side(write, "primary", ReadPreferenceMode::Primary),
            self.side(read, "secondary", read_preference),
        );

        MetricsReport {
            primary,
            secondary,
            replica_set_name,
            collected_at: Utc::now(),
        }
    }

    async fn side(
        &self,
        handle: &dyn StoreHandle,
        role: &str,
        read_preference: ReadPreferenceMode,
    ) -> SideMetrics {
        match self.gather(handle, role, read_preference).await {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!("Metrics unavailable for {} side: {}", role, e);
                SideMetrics::Unavailable {
                    error: e.to_string(),
                }
            }
        }
    }

    async fn gather(
        &self,
        handle: &dyn StoreHandle,
        role: &str,
        read_preference: ReadPreferenceMode,
    ) -> StoreResult<SideMetrics> {
        let stats = with_timeout(self.op_timeout, "dbStats", handle.database_stats()).await?;
        let existing =
            with_timeout(self.op_timeout, "listCollections", handle.list_collection_names())
                .await?;

        let mut document_counts = BTreeMap::new();
        for collection in COUNTED_COLLECTIONS {
            let count = if existing.iter().any(|name| name == collection) {
                with_timeout(
                    self.op_timeout,
                    "count",
                    handle.count_documents(collection, doc! {}),
                )
                .await?
            } else {
                0
            };
            document_counts.insert(collection.to_string(), count);
        }

        Ok(SideMetrics::Available {
            data_size_mb: bytes_to_mb(number_field(&stats, "dataSize")),
            storage_size_mb: bytes_to_mb(number_field(&stats, "storageSize")),
            index_size_mb: bytes_to_mb(number_field(&stats, "indexSize")),
            collections: number_field(&stats, "collections") as u64,
            objects: number_field(&stats, "objects") as u64,
            document_counts,
            connection_role: role.to_string(),
            read_preference: read_preference.as_str().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory::MemoryStore;

    #[tokio::test]
    async fn test_counts_present_and_absent_collections() {
        let store = MemoryStore::new();
        store.seed(USERS, doc! { "username": "ana" });
        store.seed(USERS, doc! { "username": "bo" });
        store.seed(VIDEOS, doc! { "title": "clip" });
        let handle = store.handle("app");

        let report = MetricsCollector::new(Duration::from_secs(1))
            .collect_from(
                handle.as_ref(),
                handle.as_ref(),
                Some("rs0".to_string()),
                ReadPreferenceMode::SecondaryPreferred,
            )
            .await;

        match &report.primary {
            SideMetrics::Available {
                document_counts,
                objects,
                collections,
                connection_role,
                ..
            } => {
                assert_eq!(document_counts[USERS], 2);
                assert_eq!(document_counts[VIDEOS], 1);
                assert_eq!(document_counts[VIDEO_VIEWS], 0);
                assert_eq!(*objects, 3);
                assert_eq!(*collections, 2);
                assert_eq!(connection_role, "primary");
            }
            other => panic!("primary unavailable: {:?}", other),
        }
        match &report.secondary {
            SideMetrics::Available {
                read_preference, ..
            } => assert_eq!(read_preference, "secondaryPreferred"),
            other => panic!("secondary unavailable: {:?}", other),
        }
        assert_eq!(report.replica_set_name.as_deref(), Some("rs0"));
    }

    #[tokio::test]
    async fn test_failing_secondary_keeps_primary() {
        let store = MemoryStore::new();
        store.seed(USERS, doc! { "username": "ana" });
        let write = store.handle("app");
        let read = store.failing_handle("app");

        let report = MetricsCollector::new(Duration::from_secs(1))
            .collect_from(
                write.as_ref(),
                read.as_ref(),
                None,
                ReadPreferenceMode::PrimaryPreferred,
            )
            .await;

        assert!(report.primary.is_available());
        assert!(matches!(report.secondary, SideMetrics::Unavailable { .. }));
    }

    #[test]
    fn test_report_serializes_with_status_tag() {
        let report = MetricsReport::unavailable("no connection");
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["primary"]["status"], "unavailable");
        assert_eq!(json["secondary"]["error"], "no connection");
    }
}
