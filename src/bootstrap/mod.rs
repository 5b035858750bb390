/// Idempotent schema and privileged account setup
///
/// Every step absorbs "already exists" outcomes. Failures are collected into
/// the report instead of aborting, so a partially seeded store stays usable.
pub mod credentials;

use mongodb::bson::{doc, DateTime as BsonDateTime, Document};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::BootstrapConfig;
use crate::core::store::with_timeout;
use crate::core::{IndexSpec, StoreHandle};
use crate::error::{StoreError, VigiaError, VigiaResult};

pub const USERS: &str = "users";
pub const VIDEOS: &str = "videos";
pub const VIDEO_VIEWS: &str = "video_views";
pub const REPLICATION_TEST: &str = "replication_test";

/// Collections and indexes that must exist
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaPlan {
    pub collections: Vec<String>,
    pub indexes: Vec<IndexSpec>,
}

impl Default for SchemaPlan {
    fn default() -> Self {
        Self {
            collections: [USERS, VIDEOS, VIDEO_VIEWS, REPLICATION_TEST]
                .iter()
                .map(|c| c.to_string())
                .collect(),
            indexes: vec![
                IndexSpec::ascending(USERS, "username").unique(),
                IndexSpec::ascending(USERS, "email"),
                IndexSpec::ascending(USERS, "created_at"),
                IndexSpec::ascending(VIDEOS, "title"),
                IndexSpec::ascending(VIDEOS, "user_id"),
                IndexSpec::ascending(VIDEOS, "upload_date"),
                IndexSpec::ascending(VIDEOS, "status"),
                IndexSpec::text(VIDEOS, &["title", "description"]),
                IndexSpec::ascending(VIDEO_VIEWS, "video_id"),
                IndexSpec::ascending(VIDEO_VIEWS, "user_id"),
                IndexSpec::ascending(VIDEO_VIEWS, "view_date"),
                IndexSpec::compound(VIDEO_VIEWS, &["video_id", "user_id"]),
                IndexSpec::ascending(REPLICATION_TEST, "test_id"),
            ],
        }
    }
}

impl SchemaPlan {
    /// Qualified `collection.index` names, as tracked in `BootstrapState`
    pub fn index_keys(&self) -> Vec<String> {
        self.indexes.iter().map(index_key).collect()
    }
}

fn index_key(index: &IndexSpec) -> String {
    format!("{}.{}", index.collection, index.name())
}

/// What bootstrap did to the privileged account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountAction {
    /// The account was absent and has been inserted
    Created,
    /// A placeholder credential was replaced with a hash
    Rotated,
    /// The account was well formed; only the privilege flag was set again
    Reasserted,
}

impl fmt::Display for AccountAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccountAction::Created => write!(f, "created"),
            AccountAction::Rotated => write!(f, "rotated"),
            AccountAction::Reasserted => write!(f, "reasserted"),
        }
    }
}

/// Outcome of one bootstrap run
#[derive(Debug, Clone, Default, Serialize)]
pub struct BootstrapReport {
    pub collections_created: Vec<String>,
    pub collections_present: Vec<String>,
    pub indexes_ensured: Vec<String>,
    pub account_action: Option<AccountAction>,
    /// Final read-back found the account with the privilege flag set
    pub account_verified: bool,
    pub issues: Vec<String>,
}

impl BootstrapReport {
    pub fn is_complete(&self) -> bool {
        self.issues.is_empty() && self.account_verified
    }

    pub fn into_result(self) -> VigiaResult<Self> {
        if self.issues.is_empty() {
            Ok(self)
        } else {
            Err(VigiaError::BootstrapIncomplete {
                issues: self.issues,
            })
        }
    }

    fn issue(&mut self, message: String) {
        warn!("Bootstrap: {}", message);
        self.issues.push(message);
    }
}

/// What has been confirmed present during this process lifetime
#[derive(Debug, Clone, Default, Serialize)]
pub struct BootstrapState {
    pub runs: u32,
    pub collections: BTreeSet<String>,
    pub indexes: BTreeSet<String>,
    pub account_confirmed: bool,
}

impl BootstrapState {
    /// Everything in `plan` has been confirmed already
    pub fn is_confirmed(&self, plan: &SchemaPlan) -> bool {
        self.account_confirmed
            && plan.collections.iter().all(|c| self.collections.contains(c))
            && plan.index_keys().iter().all(|i| self.indexes.contains(i))
    }

    pub fn record(&mut self, report: &BootstrapReport) {
        self.runs += 1;
        self.collections
            .extend(report.collections_created.iter().cloned());
        self.collections
            .extend(report.collections_present.iter().cloned());
        self.indexes.extend(report.indexes_ensured.iter().cloned());
        self.account_confirmed |= report.account_verified;
    }
}

/// The privileged account to seed
#[derive(Clone, PartialEq, Eq)]
pub struct AdminAccount {
    pub username: String,
    pub email: String,
    pub password: String,
}

impl fmt::Debug for AdminAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminAccount")
            .field("username", &self.username)
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}

impl From<&BootstrapConfig> for AdminAccount {
    fn from(config: &BootstrapConfig) -> Self {
        Self {
            username: config.admin_username.clone(),
            email: config.admin_email.clone(),
            password: config.admin_password.clone(),
        }
    }
}

/// Runs the setup steps against a write handle
#[derive(Debug, Clone)]
pub struct Bootstrapper {
    plan: SchemaPlan,
    admin: AdminAccount,
    op_timeout: Duration,
}

impl Bootstrapper {
    pub fn new(plan: SchemaPlan, admin: AdminAccount, op_timeout: Duration) -> Self {
        Self {
            plan,
            admin,
            op_timeout,
        }
    }

    pub fn from_config(config: &BootstrapConfig, op_timeout: Duration) -> Self {
        Self::new(SchemaPlan::default(), AdminAccount::from(config), op_timeout)
    }

    pub fn plan(&self) -> &SchemaPlan {
        &self.plan
    }

    /// Ensure collections, indexes and the privileged account. Never fails;
    /// problems end up in `BootstrapReport::issues`.
    pub async fn bootstrap(&self, write: &dyn StoreHandle) -> BootstrapReport {
        let mut report = BootstrapReport::default();

        self.ensure_collections(write, &mut report).await;
        self.ensure_indexes(write, &mut report).await;
        self.ensure_account(write, &mut report).await;
        self.verify_account(write, &mut report).await;

        if report.is_complete() {
            info!(
                "Bootstrap complete: {} collection(s) created, {} index(es) ensured, account {}",
                report.collections_created.len(),
                report.indexes_ensured.len(),
                report
                    .account_action
                    .map(|a| a.to_string())
                    .unwrap_or_else(|| "untouched".to_string())
            );
        } else {
            warn!("Bootstrap finished with {} issue(s)", report.issues.len());
        }
        report
    }

    async fn ensure_collections(&self, write: &dyn StoreHandle, report: &mut BootstrapReport) {
        let existing: BTreeSet<String> =
            match with_timeout(self.op_timeout, "listCollections", write.list_collection_names())
                .await
            {
                Ok(names) => names.into_iter().collect(),
                Err(e) => {
                    debug!("Could not list collections, creating blindly: {}", e);
                    BTreeSet::new()
                }
            };

        for name in &self.plan.collections {
            if existing.contains(name) {
                report.collections_present.push(name.clone());
                continue;
            }
            match with_timeout(self.op_timeout, "create", write.create_collection(name)).await {
                Ok(()) => {
                    info!("Created collection {}", name);
                    report.collections_created.push(name.clone());
                }
                Err(e) if e.is_already_exists() => report.collections_present.push(name.clone()),
                Err(e) => report.issue(format!("collection {}: {}", name, e)),
            }
        }
    }

    async fn ensure_indexes(&self, write: &dyn StoreHandle, report: &mut BootstrapReport) {
        for index in &self.plan.indexes {
            let key = index_key(index);
            match with_timeout(self.op_timeout, "createIndexes", write.create_index(index)).await {
                Ok(()) => report.indexes_ensured.push(key),
                Err(StoreError::IndexConflict { message }) => {
                    warn!("Index {} exists with different options: {}", key, message);
                    report.indexes_ensured.push(key);
                }
                Err(e) if e.is_already_exists() => report.indexes_ensured.push(key),
                Err(StoreError::DuplicateKey { message }) if index.unique => report.issue(format!(
                    "unique index {} not built, existing documents collide: {}",
                    key, message
                )),
                Err(e) => report.issue(format!("index {}: {}", key, e)),
            }
        }
    }

    fn account_filter(&self) -> Document {
        doc! { "username": self.admin.username.clone() }
    }

    async fn ensure_account(&self, write: &dyn StoreHandle, report: &mut BootstrapReport) {
        let existing = match with_timeout(
            self.op_timeout,
            "find",
            write.find_one(USERS, self.account_filter()),
        )
        .await
        {
            Ok(existing) => existing,
            Err(e) => {
                report.issue(format!("account lookup: {}", e));
                return;
            }
        };

        let existing = match existing {
            Some(account) => account,
            None => match self.create_account(write).await {
                Ok(()) => {
                    info!("Created privileged account {}", self.admin.username);
                    report.account_action = Some(AccountAction::Created);
                    return;
                }
                Err(AccountError::Store(StoreError::DuplicateKey { .. })) => {
                    debug!("Account {} was seeded concurrently", self.admin.username);
                    match with_timeout(
                        self.op_timeout,
                        "find",
                        write.find_one(USERS, self.account_filter()),
                    )
                    .await
                    {
                        Ok(Some(account)) => account,
                        Ok(None) => {
                            report.issue(format!(
                                "account {} reported duplicate but not found",
                                self.admin.username
                            ));
                            return;
                        }
                        Err(e) => {
                            report.issue(format!("account lookup: {}", e));
                            return;
                        }
                    }
                }
                Err(e) => {
                    report.issue(format!("account creation: {}", e));
                    return;
                }
            },
        };

        match self.correct_account(write, &existing).await {
            Ok(action) => {
                info!("Privileged account {} {}", self.admin.username, action);
                report.account_action = Some(action);
            }
            Err(e) => report.issue(format!("account correction: {}", e)),
        }
    }

    async fn create_account(&self, write: &dyn StoreHandle) -> Result<(), AccountError> {
        let hash = credentials::hash_password(&self.admin.password)?;
        let now = BsonDateTime::now();
        let account = doc! {
            "username": self.admin.username.clone(),
            "email": self.admin.email.clone(),
            "password": hash,
            "is_admin": true,
            "created_at": now,
            "updated_at": now,
        };
        with_timeout(self.op_timeout, "insert", write.insert_one(USERS, account)).await?;
        Ok(())
    }

    async fn correct_account(
        &self,
        write: &dyn StoreHandle,
        existing: &Document,
    ) -> Result<AccountAction, AccountError> {
        let (update, action) = if credentials::is_placeholder(existing) {
            let hash = credentials::hash_password(&self.admin.password)?;
            (
                doc! {
                    "$set": {
                        "password": hash,
                        "is_admin": true,
                        "updated_at": BsonDateTime::now(),
                    },
                    "$unset": { "temp_password": "" },
                },
                AccountAction::Rotated,
            )
        } else {
            (doc! { "$set": { "is_admin": true } }, AccountAction::Reasserted)
        };

        let matched = with_timeout(
            self.op_timeout,
            "update",
            write.update_one(USERS, self.account_filter(), update),
        )
        .await?;
        if matched == 0 {
            return Err(AccountError::Store(StoreError::other(
                "account disappeared during correction",
            )));
        }
        Ok(action)
    }

    async fn verify_account(&self, write: &dyn StoreHandle, report: &mut BootstrapReport) {
        match with_timeout(
            self.op_timeout,
            "find",
            write.find_one(USERS, self.account_filter()),
        )
        .await
        {
            Ok(Some(account)) if account.get_bool("is_admin").unwrap_or(false) => {
                report.account_verified = true;
            }
            Ok(Some(_)) => report.issue(format!(
                "account {} lacks the privilege flag after setup",
                self.admin.username
            )),
            Ok(None) => report.issue(format!(
                "account {} missing after setup",
                self.admin.username
            )),
            Err(e) => report.issue(format!("account verification: {}", e)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum AccountError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Hash(#[from] VigiaError),
}

#[cfg(test)]
mod tests {
    use super::credentials::{verify_password, PLACEHOLDER_PASSWORD};
    use super::*;
    use crate::core::memory::{MemoryStore, ReadVisibility};

    fn bootstrapper() -> Bootstrapper {
        Bootstrapper::from_config(&BootstrapConfig::default(), Duration::from_secs(1))
    }

    fn admins(store: &MemoryStore) -> Vec<Document> {
        store
            .documents(USERS)
            .into_iter()
            .filter(|d| d.get_str("username").map(|n| n == "admin").unwrap_or(false))
            .collect()
    }

    #[tokio::test]
    async fn test_bootstrap_fresh_store() {
        let store = MemoryStore::new();
        let handle = store.handle("app");

        let report = bootstrapper().bootstrap(handle.as_ref()).await;

        assert!(report.is_complete(), "issues: {:?}", report.issues);
        assert_eq!(report.collections_created.len(), 4);
        assert_eq!(report.indexes_ensured.len(), SchemaPlan::default().indexes.len());
        assert_eq!(report.account_action, Some(AccountAction::Created));
        assert!(store.index_names(USERS).contains(&"username_1".to_string()));

        let accounts = admins(&store);
        assert_eq!(accounts.len(), 1);
        assert!(accounts[0].get_bool("is_admin").unwrap());
        assert!(verify_password("admin", accounts[0].get_str("password").unwrap()));
    }

    #[tokio::test]
    async fn test_bootstrap_twice_keeps_one_account() {
        let store = MemoryStore::new();
        let handle = store.handle("app");
        let bootstrapper = bootstrapper();

        let first = bootstrapper.bootstrap(handle.as_ref()).await;
        let second = bootstrapper.bootstrap(handle.as_ref()).await;

        assert!(first.into_result().is_ok());
        assert!(second.issues.is_empty());
        assert!(second.collections_created.is_empty());
        assert_eq!(second.collections_present.len(), 4);
        assert_eq!(second.account_action, Some(AccountAction::Reasserted));
        assert_eq!(admins(&store).len(), 1);
    }

    #[tokio::test]
    async fn test_placeholder_credential_is_rotated() {
        let store = MemoryStore::new();
        store.seed(
            USERS,
            doc! {
                "username": "admin",
                "email": "admin@example.com",
                "password": PLACEHOLDER_PASSWORD,
                "temp_password": "admin",
                "is_admin": false,
            },
        );
        let handle = store.handle("app");

        let report = bootstrapper().bootstrap(handle.as_ref()).await;

        assert_eq!(report.account_action, Some(AccountAction::Rotated));
        assert!(report.account_verified);
        let accounts = admins(&store);
        assert_eq!(accounts.len(), 1);
        assert!(accounts[0].get("temp_password").is_none());
        assert!(accounts[0].get_bool("is_admin").unwrap());
        let password = accounts[0].get_str("password").unwrap();
        assert_ne!(password, PLACEHOLDER_PASSWORD);
        assert!(verify_password("admin", password));
    }

    #[tokio::test]
    async fn test_tampered_privilege_flag_is_reasserted() {
        let store = MemoryStore::new();
        let hash = credentials::hash_password("kept").unwrap();
        store.seed(
            USERS,
            doc! { "username": "admin", "password": hash.clone(), "is_admin": false },
        );
        let handle = store.handle("app");

        let report = bootstrapper().bootstrap(handle.as_ref()).await;

        assert_eq!(report.account_action, Some(AccountAction::Reasserted));
        let accounts = admins(&store);
        assert!(accounts[0].get_bool("is_admin").unwrap());
        assert_eq!(accounts[0].get_str("password").unwrap(), hash);
    }

    #[tokio::test]
    async fn test_concurrent_seed_falls_through_to_correction() {
        let store = MemoryStore::new();
        store.seed(
            USERS,
            doc! { "username": "admin", "password": PLACEHOLDER_PASSWORD, "is_admin": false },
        );
        // First lookup misses, as if another process inserted right after it.
        let handle = store.reader("app", ReadVisibility::AfterPolls(2));

        let report = bootstrapper().bootstrap(handle.as_ref()).await;

        assert!(report.issues.is_empty(), "issues: {:?}", report.issues);
        assert_eq!(report.account_action, Some(AccountAction::Rotated));
        assert!(report.account_verified);
        assert_eq!(admins(&store).len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_accounts_block_unique_index() {
        let store = MemoryStore::new();
        let hash = credentials::hash_password("kept").unwrap();
        for _ in 0..2 {
            store.seed(
                USERS,
                doc! { "username": "admin", "password": hash.clone(), "is_admin": true },
            );
        }
        let handle = store.handle("app");
        let bootstrapper = bootstrapper();

        let report = bootstrapper.bootstrap(handle.as_ref()).await;

        assert!(!report.is_complete());
        assert!(!report.indexes_ensured.contains(&"users.username_1".to_string()));
        assert!(report.issues.iter().any(|i| i.contains("users.username_1")));
        assert!(!store.index_names(USERS).contains(&"username_1".to_string()));

        let mut state = BootstrapState::default();
        state.record(&report);
        assert!(!state.is_confirmed(bootstrapper.plan()));
        assert!(matches!(
            report.into_result(),
            Err(VigiaError::BootstrapIncomplete { .. })
        ));
    }

    #[tokio::test]
    async fn test_failing_handle_reports_incomplete() {
        let store = MemoryStore::new();
        let handle = store.failing_handle("app");

        let report = bootstrapper().bootstrap(handle.as_ref()).await;

        assert!(!report.is_complete());
        assert!(!report.account_verified);
        assert!(matches!(
            report.into_result(),
            Err(VigiaError::BootstrapIncomplete { .. })
        ));
    }

    #[test]
    fn test_state_confirmation() {
        let plan = SchemaPlan::default();
        let mut state = BootstrapState::default();
        assert!(!state.is_confirmed(&plan));

        let report = BootstrapReport {
            collections_created: plan.collections.clone(),
            indexes_ensured: plan.index_keys(),
            account_verified: true,
            ..Default::default()
        };
        state.record(&report);
        assert_eq!(state.runs, 1);
        assert!(state.is_confirmed(&plan));
    }

    #[test]
    fn test_admin_account_debug_hides_password() {
        let account = AdminAccount::from(&BootstrapConfig {
            admin_password: "hunter2".to_string(),
            ..Default::default()
        });
        assert!(!format!("{:?}", account).contains("hunter2"));
    }
}
