/// Store handle and connector traits
///
/// A `StoreHandle` is an opaque, pooled connection scoped to one database.
/// Every operation the manager needs from the replicated store goes through
/// it, so the real driver and the in-memory store are interchangeable.
use async_trait::async_trait;
use mongodb::bson::{doc, Bson, Document};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use super::connection::ConnectionStrategy;
use crate::error::{StoreError, StoreResult};

/// Key direction of one indexed field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKey {
    Ascending,
    Text,
}

/// Definition of an index to ensure on a collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub collection: String,
    pub keys: Vec<(String, IndexKey)>,
    pub unique: bool,
}

impl IndexSpec {
    /// Single ascending field index
    pub fn ascending(collection: &str, field: &str) -> Self {
        Self {
            collection: collection.to_string(),
            keys: vec![(field.to_string(), IndexKey::Ascending)],
            unique: false,
        }
    }

    /// Compound ascending index over several fields
    pub fn compound(collection: &str, fields: &[&str]) -> Self {
        Self {
            collection: collection.to_string(),
            keys: fields
                .iter()
                .map(|f| (f.to_string(), IndexKey::Ascending))
                .collect(),
            unique: false,
        }
    }

    /// Text index over several fields
    pub fn text(collection: &str, fields: &[&str]) -> Self {
        Self {
            collection: collection.to_string(),
            keys: fields.iter().map(|f| (f.to_string(), IndexKey::Text)).collect(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Index name following the server's default naming
    pub fn name(&self) -> String {
        self.keys
            .iter()
            .map(|(field, key)| match key {
                IndexKey::Ascending => format!("{}_1", field),
                IndexKey::Text => format!("{}_text", field),
            })
            .collect::<Vec<_>>()
            .join("_")
    }

    /// Key document as sent in `createIndexes`
    pub fn key_document(&self) -> Document {
        let mut keys = Document::new();
        for (field, key) in &self.keys {
            match key {
                IndexKey::Ascending => keys.insert(field.clone(), 1i32),
                IndexKey::Text => keys.insert(field.clone(), "text"),
            };
        }
        keys
    }

    /// Index description for the `indexes` array of `createIndexes`
    pub fn to_command_entry(&self) -> Document {
        let mut entry = doc! {
            "key": self.key_document(),
            "name": self.name(),
        };
        if self.unique {
            entry.insert("unique", Bson::Boolean(true));
        }
        entry
    }
}

/// Opaque connection handle scoped to one database
#[async_trait]
pub trait StoreHandle: Send + Sync {
    /// Database every operation is scoped to
    fn database_name(&self) -> &str;

    /// Liveness command
    async fn ping(&self) -> StoreResult<()>;

    /// Raw `replSetGetStatus` reply
    async fn replica_set_status(&self) -> StoreResult<Document>;

    /// Raw `dbStats` reply
    async fn database_stats(&self) -> StoreResult<Document>;

    async fn list_collection_names(&self) -> StoreResult<Vec<String>>;

    /// Fails with `StoreError::AlreadyExists` when the collection is present
    async fn create_collection(&self, name: &str) -> StoreResult<()>;

    async fn create_index(&self, index: &IndexSpec) -> StoreResult<()>;

    async fn insert_one(&self, collection: &str, document: Document) -> StoreResult<()>;

    async fn find_one(&self, collection: &str, filter: Document) -> StoreResult<Option<Document>>;

    /// Returns the number of matched documents
    async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
    ) -> StoreResult<u64>;

    /// Returns the number of deleted documents
    async fn delete_one(&self, collection: &str, filter: Document) -> StoreResult<u64>;

    async fn count_documents(&self, collection: &str, filter: Document) -> StoreResult<u64>;

    /// Release all resources. Safe to call more than once.
    async fn close(&self);
}

/// Opens handles for connection strategies
#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn open(&self, strategy: &ConnectionStrategy) -> StoreResult<Arc<dyn StoreHandle>>;
}

/// Bound a store operation by `limit`, mapping expiry to `StoreError::Timeout`
pub async fn with_timeout<T, F>(limit: Duration, operation: &str, future: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::timeout(operation)),
    }
}
