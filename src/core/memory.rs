/// In-process store implementing the handle and connector traits
///
/// Supports equality filters, `$set`/`$unset` updates and unique indexes,
/// plus fault injection: strategies that cannot be opened or pinged, readers
/// that observe writes late or never, failing handles, handles that cannot
/// delete and a standalone (non-replica-set) mode.
use async_trait::async_trait;
use mongodb::bson::{doc, Bson, Document};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::connection::{ConnectionStrategy, StrategyKind};
use super::store::{IndexSpec, StoreConnector, StoreHandle};
use crate::error::{StoreError, StoreResult};

/// When a reader handle starts observing documents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadVisibility {
    Immediate,
    /// Lookups return nothing until the n-th `find_one` call
    AfterPolls(u32),
    Never,
}

#[derive(Default)]
struct StoreState {
    collections: BTreeMap<String, Vec<Document>>,
    indexes: BTreeMap<String, Vec<IndexSpec>>,
    replica_status: Option<Document>,
}

/// Shared in-memory data behind every handle
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    /// Standalone store: the replica-set status command fails
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Store answering the status command for the given members.
    /// Each member is `(address, state code, healthy)`.
    pub fn replica_set(name: &str, members: &[(&str, i32, bool)]) -> Arc<Self> {
        let store = Self::new();
        store.set_replica_status(Some(replica_status_document(name, members)));
        store
    }

    pub fn set_replica_status(&self, status: Option<Document>) {
        self.lock().replica_status = status;
    }

    /// Handle that sees writes immediately
    pub fn handle(self: &Arc<Self>, database: &str) -> Arc<MemoryHandle> {
        Arc::new(MemoryHandle::new(Arc::clone(self), database, None))
    }

    /// Handle whose lookups observe writes according to `visibility`
    pub fn reader(self: &Arc<Self>, database: &str, visibility: ReadVisibility) -> Arc<MemoryHandle> {
        let mut handle = MemoryHandle::new(Arc::clone(self), database, None);
        handle.visibility = visibility;
        Arc::new(handle)
    }

    /// Handle on which every operation fails as if the node were gone
    pub fn failing_handle(self: &Arc<Self>, database: &str) -> Arc<MemoryHandle> {
        let mut handle = MemoryHandle::new(Arc::clone(self), database, None);
        handle.failing = true;
        Arc::new(handle)
    }

    /// Handle whose deletes fail while everything else works
    pub fn failing_deletes(self: &Arc<Self>, database: &str) -> Arc<MemoryHandle> {
        let mut handle = MemoryHandle::new(Arc::clone(self), database, None);
        handle.delete_fails = true;
        Arc::new(handle)
    }

    /// Insert bypassing index checks, for seeding fixtures
    pub fn seed(&self, collection: &str, document: Document) {
        self.lock()
            .collections
            .entry(collection.to_string())
            .or_default()
            .push(document);
    }

    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.lock()
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.lock().collections.keys().cloned().collect()
    }

    pub fn index_names(&self, collection: &str) -> Vec<String> {
        self.lock()
            .indexes
            .get(collection)
            .map(|specs| specs.iter().map(|s| s.name()).collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        // Poisoning is ignored; state stays usable after a panicking test.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Build a `replSetGetStatus`-shaped reply
pub fn replica_status_document(name: &str, members: &[(&str, i32, bool)]) -> Document {
    let members: Vec<Bson> = members
        .iter()
        .enumerate()
        .map(|(id, (address, state, healthy))| {
            let state_str = match state {
                1 => "PRIMARY",
                2 => "SECONDARY",
                7 => "ARBITER",
                8 => "(not reachable/healthy)",
                _ => "UNKNOWN",
            };
            let health = if *healthy { 1.0 } else { 0.0 };
            let mut member = doc! {
                "_id": id as i32,
                "name": *address,
                "health": health,
                "state": *state,
                "stateStr": state_str,
            };
            if id > 0 {
                member.insert("pingMs", 1i64 + id as i64);
                member.insert("lastHeartbeat", mongodb::bson::DateTime::now());
            } else {
                member.insert("self", true);
            }
            Bson::Document(member)
        })
        .collect();

    doc! {
        "set": name,
        "date": mongodb::bson::DateTime::now(),
        "myState": 1,
        "members": members,
        "ok": 1.0,
    }
}

fn matches(document: &Document, filter: &Document) -> bool {
    filter
        .iter()
        .all(|(key, expected)| document.get(key) == Some(expected))
}

fn unique_key(document: &Document, fields: &[String]) -> Document {
    let mut key = Document::new();
    for field in fields {
        key.insert(field.clone(), document.get(field).cloned().unwrap_or(Bson::Null));
    }
    key
}

fn apply_update(document: &mut Document, update: &Document) -> StoreResult<()> {
    for (operator, fields) in update {
        let fields = match fields {
            Bson::Document(fields) => fields,
            _ => {
                return Err(StoreError::Command {
                    code: 9,
                    message: format!("{} requires a document", operator),
                })
            }
        };
        match operator.as_str() {
            "$set" => {
                for (key, value) in fields {
                    document.insert(key.clone(), value.clone());
                }
            }
            "$unset" => {
                for key in fields.keys() {
                    document.remove(key);
                }
            }
            other => {
                return Err(StoreError::Command {
                    code: 9,
                    message: format!("unsupported update operator {}", other),
                })
            }
        }
    }
    Ok(())
}

/// Handle over a `MemoryStore`
pub struct MemoryHandle {
    store: Arc<MemoryStore>,
    database: String,
    visibility: ReadVisibility,
    failing: bool,
    ping_fails: bool,
    delete_fails: bool,
    finds: AtomicU32,
    closed: AtomicBool,
    live: Option<Arc<AtomicUsize>>,
}

impl MemoryHandle {
    fn new(store: Arc<MemoryStore>, database: &str, live: Option<Arc<AtomicUsize>>) -> Self {
        if let Some(live) = &live {
            live.fetch_add(1, Ordering::SeqCst);
        }
        Self {
            store,
            database: database.to_string(),
            visibility: ReadVisibility::Immediate,
            failing: false,
            ping_fails: false,
            delete_fails: false,
            finds: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            live,
        }
    }

    /// Number of `find_one` calls served so far
    pub fn find_count(&self) -> u32 {
        self.finds.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check(&self) -> StoreResult<()> {
        if self.is_closed() {
            return Err(StoreError::Closed);
        }
        if self.failing {
            return Err(StoreError::unreachable(format!(
                "memory node for {} is down",
                self.database
            )));
        }
        Ok(())
    }

    fn namespace(&self, collection: &str) -> String {
        format!("{}.{}", self.database, collection)
    }
}

#[async_trait]
impl StoreHandle for MemoryHandle {
    fn database_name(&self) -> &str {
        &self.database
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check()?;
        if self.ping_fails {
            return Err(StoreError::timeout("ping"));
        }
        Ok(())
    }

    async fn replica_set_status(&self) -> StoreResult<Document> {
        self.check()?;
        self.store
            .lock()
            .replica_status
            .clone()
            .ok_or_else(|| StoreError::Command {
                code: 76,
                message: "not running with --replSet".to_string(),
            })
    }

    async fn database_stats(&self) -> StoreResult<Document> {
        self.check()?;
        let state = self.store.lock();
        let mut objects = 0i64;
        let mut data_size = 0usize;
        for documents in state.collections.values() {
            objects += documents.len() as i64;
            for document in documents {
                let mut buffer = Vec::new();
                if document.to_writer(&mut buffer).is_ok() {
                    data_size += buffer.len();
                }
            }
        }
        let index_count: usize = state.indexes.values().map(|specs| specs.len()).sum();

        Ok(doc! {
            "db": self.database.clone(),
            "collections": state.collections.len() as i32,
            "objects": objects,
            "dataSize": data_size as f64,
            "storageSize": data_size as f64,
            "indexes": index_count as i32,
            "indexSize": (index_count * 4096) as f64,
            "ok": 1.0,
        })
    }

    async fn list_collection_names(&self) -> StoreResult<Vec<String>> {
        self.check()?;
        Ok(self.store.collection_names())
    }

    async fn create_collection(&self, name: &str) -> StoreResult<()> {
        self.check()?;
        let mut state = self.store.lock();
        if state.collections.contains_key(name) {
            return Err(StoreError::AlreadyExists {
                namespace: self.namespace(name),
            });
        }
        state.collections.insert(name.to_string(), Vec::new());
        Ok(())
    }

    async fn create_index(&self, index: &IndexSpec) -> StoreResult<()> {
        self.check()?;
        let mut state = self.store.lock();
        state
            .collections
            .entry(index.collection.clone())
            .or_default();
        let specs = state.indexes.entry(index.collection.clone()).or_default();

        match specs.iter().find(|existing| existing.name() == index.name()) {
            Some(existing) if existing == index => return Ok(()),
            Some(_) => {
                return Err(StoreError::IndexConflict {
                    message: format!("index {} exists with different options", index.name()),
                })
            }
            None => {}
        }

        if index.unique {
            let fields: Vec<String> = index.keys.iter().map(|(field, _)| field.clone()).collect();
            let documents = state
                .collections
                .get(&index.collection)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let mut seen: Vec<Document> = Vec::new();
            for document in documents {
                let key = unique_key(document, &fields);
                if seen.contains(&key) {
                    return Err(StoreError::DuplicateKey {
                        message: format!(
                            "{} index {} dup key: {}",
                            self.namespace(&index.collection),
                            index.name(),
                            key
                        ),
                    });
                }
                seen.push(key);
            }
        }

        state
            .indexes
            .entry(index.collection.clone())
            .or_default()
            .push(index.clone());
        Ok(())
    }

    async fn insert_one(&self, collection: &str, document: Document) -> StoreResult<()> {
        self.check()?;
        let mut state = self.store.lock();

        let unique_keys: Vec<Vec<String>> = state
            .indexes
            .get(collection)
            .map(|specs| {
                specs
                    .iter()
                    .filter(|spec| spec.unique)
                    .map(|spec| spec.keys.iter().map(|(field, _)| field.clone()).collect())
                    .collect()
            })
            .unwrap_or_default();

        let documents = state.collections.entry(collection.to_string()).or_default();
        for fields in &unique_keys {
            let key = unique_key(&document, fields);
            if documents.iter().any(|existing| matches(existing, &key)) {
                return Err(StoreError::DuplicateKey {
                    message: format!("{} dup key: {}", self.namespace(collection), key),
                });
            }
        }

        documents.push(document);
        Ok(())
    }

    async fn find_one(&self, collection: &str, filter: Document) -> StoreResult<Option<Document>> {
        self.check()?;
        let polls = self.finds.fetch_add(1, Ordering::SeqCst) + 1;
        let visible = match self.visibility {
            ReadVisibility::Immediate => true,
            ReadVisibility::AfterPolls(n) => polls >= n,
            ReadVisibility::Never => false,
        };
        if !visible {
            return Ok(None);
        }

        let state = self.store.lock();
        Ok(state
            .collections
            .get(collection)
            .and_then(|documents| documents.iter().find(|d| matches(d, &filter)).cloned()))
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
    ) -> StoreResult<u64> {
        self.check()?;
        let mut state = self.store.lock();
        let target = state
            .collections
            .get_mut(collection)
            .and_then(|documents| documents.iter_mut().find(|d| matches(d, &filter)));

        match target {
            Some(document) => {
                apply_update(document, &update)?;
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn delete_one(&self, collection: &str, filter: Document) -> StoreResult<u64> {
        self.check()?;
        if self.delete_fails {
            return Err(StoreError::Command {
                code: 13,
                message: format!("not authorized to remove from {}", self.namespace(collection)),
            });
        }
        let mut state = self.store.lock();
        let Some(documents) = state.collections.get_mut(collection) else {
            return Ok(0);
        };
        match documents.iter().position(|d| matches(d, &filter)) {
            Some(index) => {
                documents.remove(index);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn count_documents(&self, collection: &str, filter: Document) -> StoreResult<u64> {
        self.check()?;
        let state = self.store.lock();
        Ok(state
            .collections
            .get(collection)
            .map(|documents| documents.iter().filter(|d| matches(d, &filter)).count() as u64)
            .unwrap_or(0))
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            if let Some(live) = &self.live {
                live.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

/// Connector opening `MemoryHandle`s, with per-strategy fault injection
pub struct MemoryConnector {
    store: Arc<MemoryStore>,
    unreachable: HashSet<StrategyKind>,
    unresponsive: HashSet<StrategyKind>,
    open_delay: Option<Duration>,
    live: Arc<AtomicUsize>,
    opened: Mutex<Vec<StrategyKind>>,
}

impl MemoryConnector {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            unreachable: HashSet::new(),
            unresponsive: HashSet::new(),
            open_delay: None,
            live: Arc::new(AtomicUsize::new(0)),
            opened: Mutex::new(Vec::new()),
        }
    }

    /// Opening this strategy fails outright
    pub fn unreachable(mut self, kind: StrategyKind) -> Self {
        self.unreachable.insert(kind);
        self
    }

    /// Opening succeeds but the liveness check fails
    pub fn unresponsive(mut self, kind: StrategyKind) -> Self {
        self.unresponsive.insert(kind);
        self
    }

    /// Delay every open, so concurrent callers overlap
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    /// Handles opened and not yet closed
    pub fn live_handles(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Strategies for which a handle was actually opened, in order
    pub fn opened(&self) -> Vec<StrategyKind> {
        self.opened
            .lock()
            .map(|opened| opened.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl StoreConnector for MemoryConnector {
    async fn open(&self, strategy: &ConnectionStrategy) -> StoreResult<Arc<dyn StoreHandle>> {
        if let Some(delay) = self.open_delay {
            tokio::time::sleep(delay).await;
        }
        if self.unreachable.contains(&strategy.kind) {
            return Err(StoreError::unreachable(format!(
                "no reachable servers for {}",
                strategy.config.seed_list()
            )));
        }

        let mut handle = MemoryHandle::new(
            Arc::clone(&self.store),
            &strategy.config.database,
            Some(Arc::clone(&self.live)),
        );
        handle.ping_fails = self.unresponsive.contains(&strategy.kind);

        if let Ok(mut opened) = self.opened.lock() {
            opened.push(strategy.kind);
        }
        Ok(Arc::new(handle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_find_update_delete() {
        let store = MemoryStore::new();
        let handle = store.handle("app");

        handle
            .insert_one("users", doc! { "username": "ana", "is_admin": false })
            .await
            .unwrap();
        let found = handle
            .find_one("users", doc! { "username": "ana" })
            .await
            .unwrap()
            .unwrap();
        assert!(!found.get_bool("is_admin").unwrap());

        let matched = handle
            .update_one(
                "users",
                doc! { "username": "ana" },
                doc! { "$set": { "is_admin": true }, "$unset": { "temp_password": 1 } },
            )
            .await
            .unwrap();
        assert_eq!(matched, 1);
        assert_eq!(handle.count_documents("users", doc! { "is_admin": true }).await.unwrap(), 1);

        assert_eq!(handle.delete_one("users", doc! { "username": "ana" }).await.unwrap(), 1);
        assert_eq!(handle.count_documents("users", doc! {}).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unique_index_rejects_duplicates() {
        let store = MemoryStore::new();
        let handle = store.handle("app");
        handle
            .create_index(&IndexSpec::ascending("users", "username").unique())
            .await
            .unwrap();

        handle.insert_one("users", doc! { "username": "ana" }).await.unwrap();
        let err = handle
            .insert_one("users", doc! { "username": "ana" })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));
    }

    #[tokio::test]
    async fn test_unique_index_over_duplicates_is_not_built() {
        let store = MemoryStore::new();
        store.seed("users", doc! { "username": "ana" });
        store.seed("users", doc! { "username": "ana" });
        let handle = store.handle("app");

        let err = handle
            .create_index(&IndexSpec::ascending("users", "username").unique())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateKey { .. }));
        assert!(store.index_names("users").is_empty());

        handle
            .create_index(&IndexSpec::ascending("users", "username"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_failing_deletes_leave_other_operations_working() {
        let store = MemoryStore::new();
        let handle = store.failing_deletes("app");
        handle.insert_one("videos", doc! { "title": "clip" }).await.unwrap();

        assert!(handle.delete_one("videos", doc! { "title": "clip" }).await.is_err());
        assert_eq!(handle.count_documents("videos", doc! {}).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_create_collection_twice_reports_already_exists() {
        let store = MemoryStore::new();
        let handle = store.handle("app");
        handle.create_collection("videos").await.unwrap();
        let err = handle.create_collection("videos").await.unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_standalone_store_has_no_replica_status() {
        let store = MemoryStore::new();
        let err = store.handle("app").replica_set_status().await.unwrap_err();
        assert!(matches!(err, StoreError::Command { code: 76, .. }));
    }

    #[tokio::test]
    async fn test_reader_visibility() {
        let store = MemoryStore::new();
        store.seed("replication_test", doc! { "test_id": "t1" });
        let reader = store.reader("app", ReadVisibility::AfterPolls(2));

        let filter = doc! { "test_id": "t1" };
        assert!(reader.find_one("replication_test", filter.clone()).await.unwrap().is_none());
        assert!(reader.find_one("replication_test", filter).await.unwrap().is_some());
        assert_eq!(reader.find_count(), 2);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_blocks_operations() {
        let store = MemoryStore::new();
        let handle = store.handle("app");
        handle.close().await;
        handle.close().await;
        assert!(handle.is_closed());
        assert_eq!(handle.ping().await, Err(StoreError::Closed));
    }
}
