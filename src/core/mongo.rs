/// MongoDB driver implementation of the store traits
use async_trait::async_trait;
use mongodb::bson::{doc, Document};
use mongodb::error::{Error as DriverError, ErrorKind, WriteFailure};
use mongodb::options::{
    Acknowledgment, ClientOptions, Credential, ReadPreference, SelectionCriteria, ServerAddress,
    WriteConcern,
};
use mongodb::{Client, Database};
use std::future::IntoFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::connection::ConnectionStrategy;
use super::store::{IndexSpec, StoreConnector, StoreHandle};
use super::{ConnectionConfig, ReadPreferenceMode};
use crate::error::{StoreError, StoreResult};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Driver options for a strategy, built field by field
pub fn client_options(config: &ConnectionConfig, timeout: Duration) -> ClientOptions {
    let hosts: Vec<ServerAddress> = config
        .hosts
        .iter()
        .map(|h| ServerAddress::Tcp {
            host: h.host.clone(),
            port: Some(h.port),
        })
        .collect();
    let mut options = ClientOptions::builder().hosts(hosts).build();

    options.app_name = Some(env!("CARGO_PKG_NAME").to_string());
    options.default_database = Some(config.database.clone());
    options.server_selection_timeout = Some(timeout);
    options.connect_timeout = Some(timeout);
    options.repl_set_name = config.replica_set.clone();

    if let Some(credentials) = &config.credentials {
        options.credential = Some(
            Credential::builder()
                .username(credentials.username.clone())
                .password(credentials.password.clone())
                .source(credentials.auth_source.clone())
                .build(),
        );
    }

    let flags = &config.flags;
    options.direct_connection = flags.direct_connection;
    options.retry_writes = flags.retry_writes;
    options.retry_reads = flags.retry_reads;
    options.max_pool_size = flags.max_pool_size;
    if flags.write_majority || flags.journal {
        let mut concern = WriteConcern::default();
        if flags.write_majority {
            concern.w = Some(Acknowledgment::Majority);
        }
        if flags.journal {
            concern.journal = Some(true);
        }
        options.write_concern = Some(concern);
    }
    options.selection_criteria = flags
        .read_preference
        .map(|mode| SelectionCriteria::ReadPreference(read_preference(mode)));

    options
}

fn read_preference(mode: ReadPreferenceMode) -> ReadPreference {
    match mode {
        ReadPreferenceMode::Primary => ReadPreference::Primary,
        ReadPreferenceMode::PrimaryPreferred => ReadPreference::PrimaryPreferred {
            options: Default::default(),
        },
        ReadPreferenceMode::SecondaryPreferred => ReadPreference::SecondaryPreferred {
            options: Default::default(),
        },
    }
}

/// One-line description of a strategy's target, without secrets
pub fn describe(config: &ConnectionConfig) -> String {
    let mut parts = vec![format!("hosts={}", config.seed_list()), format!("db={}", config.database)];
    if let Some(credentials) = &config.credentials {
        parts.push(format!(
            "user={}@{}",
            credentials.username, credentials.auth_source
        ));
    }
    if let Some(replica_set) = &config.replica_set {
        parts.push(format!("replicaSet={}", replica_set));
    }
    if let Some(direct) = config.flags.direct_connection {
        parts.push(format!("direct={}", direct));
    }
    if let Some(mode) = config.flags.read_preference {
        parts.push(format!("readPreference={}", mode.as_str()));
    }
    parts.join(" ")
}

/// Map a server error code onto the store taxonomy
pub fn classify_code(code: i32, message: String) -> StoreError {
    match code {
        48 => StoreError::AlreadyExists { namespace: message },
        11000 => StoreError::DuplicateKey { message },
        85 | 86 => StoreError::IndexConflict { message },
        50 => StoreError::Timeout { operation: message },
        _ => StoreError::Command { code, message },
    }
}

fn map_error(err: DriverError) -> StoreError {
    let message = err.to_string();
    match err.kind.as_ref() {
        ErrorKind::Command(command) => classify_code(command.code, message),
        ErrorKind::Write(WriteFailure::WriteError(write)) => classify_code(write.code, message),
        ErrorKind::ServerSelection { .. } => StoreError::Unreachable { message },
        ErrorKind::Io(_) | ErrorKind::ConnectionPoolCleared { .. } => {
            StoreError::Unreachable { message }
        }
        ErrorKind::Authentication { .. } => StoreError::Authentication { message },
        _ => StoreError::Other { message },
    }
}

/// Opens driver-backed handles
#[derive(Debug, Default, Clone)]
pub struct MongoConnector;

impl MongoConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StoreConnector for MongoConnector {
    async fn open(&self, strategy: &ConnectionStrategy) -> StoreResult<Arc<dyn StoreHandle>> {
        debug!("Opening {} pool: {}", strategy.kind, describe(&strategy.config));

        let options = client_options(&strategy.config, strategy.timeout);
        let client = Client::with_options(options).map_err(map_error)?;

        Ok(Arc::new(MongoHandle::new(client, &strategy.config.database)))
    }
}

/// Driver client plus the database it is scoped to
pub struct MongoHandle {
    client: Client,
    database: Database,
    name: String,
    closed: AtomicBool,
}

impl MongoHandle {
    pub fn new(client: Client, database: &str) -> Self {
        Self {
            database: client.database(database),
            client,
            name: database.to_string(),
            closed: AtomicBool::new(false),
        }
    }

    fn check(&self) -> StoreResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StoreHandle for MongoHandle {
    fn database_name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check()?;
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn replica_set_status(&self) -> StoreResult<Document> {
        self.check()?;
        self.client
            .database("admin")
            .run_command(doc! { "replSetGetStatus": 1 })
            .await
            .map_err(map_error)
    }

    async fn database_stats(&self) -> StoreResult<Document> {
        self.check()?;
        self.database
            .run_command(doc! { "dbStats": 1 })
            .await
            .map_err(map_error)
    }

    async fn list_collection_names(&self) -> StoreResult<Vec<String>> {
        self.check()?;
        self.database
            .list_collection_names()
            .await
            .map_err(map_error)
    }

    async fn create_collection(&self, name: &str) -> StoreResult<()> {
        self.check()?;
        self.database
            .create_collection(name)
            .await
            .map_err(map_error)
    }

    async fn create_index(&self, index: &IndexSpec) -> StoreResult<()> {
        self.check()?;
        self.database
            .run_command(doc! {
                "createIndexes": index.collection.clone(),
                "indexes": [index.to_command_entry()],
            })
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn insert_one(&self, collection: &str, document: Document) -> StoreResult<()> {
        self.check()?;
        self.database
            .collection::<Document>(collection)
            .insert_one(document)
            .await
            .map(|_| ())
            .map_err(map_error)
    }

    async fn find_one(&self, collection: &str, filter: Document) -> StoreResult<Option<Document>> {
        self.check()?;
        self.database
            .collection::<Document>(collection)
            .find_one(filter)
            .await
            .map_err(map_error)
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: Document,
        update: Document,
    ) -> StoreResult<u64> {
        self.check()?;
        self.database
            .collection::<Document>(collection)
            .update_one(filter, update)
            .await
            .map(|result| result.matched_count)
            .map_err(map_error)
    }

    async fn delete_one(&self, collection: &str, filter: Document) -> StoreResult<u64> {
        self.check()?;
        self.database
            .collection::<Document>(collection)
            .delete_one(filter)
            .await
            .map(|result| result.deleted_count)
            .map_err(map_error)
    }

    async fn count_documents(&self, collection: &str, filter: Document) -> StoreResult<u64> {
        self.check()?;
        self.database
            .collection::<Document>(collection)
            .count_documents(filter)
            .await
            .map_err(map_error)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let shutdown = self.client.clone().shutdown().into_future();
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, shutdown).await.is_err() {
            warn!("Timed out shutting down client for {}", self.name);
        }
    }
}
