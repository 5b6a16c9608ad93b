//! API-Key Account Lookup
//!
//! Resolves the submitting account for a transfer. Lookups go through the
//! shared cache-aside layer under the `account:single:` namespace.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::warn;

use crate::cache::{CacheAside, CacheControl};
use crate::config::DevAccount;
use crate::db::SafeRow;
use crate::transfer::error::TransferError;

pub const ACCOUNT_KEY_NS: &str = "account:single:";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub api_key: String,
}

/// Durable account lookup
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn find_by_api_key(&self, api_key: &str) -> Result<Option<Account>, TransferError>;
}

pub struct PgAccountStore {
    pool: PgPool,
}

impl PgAccountStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AccountStore for PgAccountStore {
    async fn find_by_api_key(&self, api_key: &str) -> Result<Option<Account>, TransferError> {
        let row = sqlx::query(
            r#"
            SELECT id, name, api_key FROM account
            WHERE api_key = $1 AND deleted_at IS NULL
            "#,
        )
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let (Some(id), Some(name), Some(api_key)) = (
            row.try_get_log::<i64>("id"),
            row.try_get_log::<String>("name"),
            row.try_get_log::<String>("api_key"),
        ) else {
            return Err(TransferError::BadRequest("malformed account row".into()));
        };
        Ok(Some(Account { id, name, api_key }))
    }
}

/// In-memory accounts, seeded from configuration
#[derive(Default)]
pub struct MemoryAccountStore {
    accounts: DashMap<String, Account>,
}

impl MemoryAccountStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_dev_accounts(seed: &[DevAccount]) -> Self {
        let store = Self::new();
        for a in seed {
            store.add(Account {
                id: a.id,
                name: a.name.clone(),
                api_key: a.api_key.clone(),
            });
        }
        store
    }

    pub fn add(&self, account: Account) {
        self.accounts.insert(account.api_key.clone(), account);
    }
}

#[async_trait]
impl AccountStore for MemoryAccountStore {
    async fn find_by_api_key(&self, api_key: &str) -> Result<Option<Account>, TransferError> {
        Ok(self.accounts.get(api_key).map(|a| a.value().clone()))
    }
}

/// Cache-aside account directory
pub struct AccountDirectory {
    store: Arc<dyn AccountStore>,
    cache: CacheAside,
}

impl AccountDirectory {
    pub fn new(store: Arc<dyn AccountStore>, cache: CacheAside) -> Self {
        Self { store, cache }
    }

    fn cache_key(api_key: &str) -> Result<String, TransferError> {
        let filter = serde_json::json!({ "api_key": api_key });
        Ok(format!("{}{}", ACCOUNT_KEY_NS, serde_json::to_string(&filter)?))
    }

    /// Unknown or empty key → `NotAuthorized`
    pub async fn get_account_by_api_key(&self, api_key: &str) -> Result<Account, TransferError> {
        if api_key.trim().is_empty() {
            return Err(TransferError::NotAuthorized("missing api key".into()));
        }
        let key = Self::cache_key(api_key)?;
        let fetched = self
            .cache
            .fetch(&key, CacheControl::Default, || async {
                self.store
                    .find_by_api_key(api_key)
                    .await?
                    .ok_or_else(|| TransferError::NotAuthorized("unknown api key".into()))
            })
            .await?;
        if let Some(e) = fetched.cache_error {
            warn!(error = %e, "Account cache refresh failed");
        }
        Ok(fetched.value)
    }
}
