//! Bank Account Inquiry
//!
//! Looks up an account at the payment provider on behalf of an authenticated
//! caller. Results go through the cache-aside layer under the
//! `bank_account:single:` namespace and honour the caller's [`CacheControl`].

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::account::AccountDirectory;
use crate::cache::{CacheAside, CacheControl};
use crate::transfer::error::TransferError;
use crate::transfer::provider::PaymentProvider;

pub const BANK_ACCOUNT_KEY_NS: &str = "bank_account:single:";

/// Account to look up at the provider
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BankAccountQuery {
    pub bank_id: i64,
    pub account_name: String,
    pub account_number: String,
}

impl BankAccountQuery {
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.bank_id <= 0 {
            return Err(TransferError::BadRequest("bank_id must be greater than zero".into()));
        }
        if self.account_number.trim().is_empty() {
            return Err(TransferError::BadRequest("account_number is required".into()));
        }
        Ok(())
    }

    pub fn cache_key(&self) -> Result<String, TransferError> {
        Ok(format!("{}{}", BANK_ACCOUNT_KEY_NS, serde_json::to_string(self)?))
    }
}

/// Provider's view of a bank account
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BankAccount {
    pub id: String,
    pub bank_id: i64,
    pub account_number: String,
    pub account_name: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub account_amount: Decimal,
}

pub struct BankAccounts {
    accounts: Arc<AccountDirectory>,
    provider: Arc<dyn PaymentProvider>,
    cache: CacheAside,
}

impl BankAccounts {
    pub fn new(
        accounts: Arc<AccountDirectory>,
        provider: Arc<dyn PaymentProvider>,
        cache: CacheAside,
    ) -> Self {
        Self {
            accounts,
            provider,
            cache,
        }
    }

    /// Authenticate `api_key`, then resolve `query` from cache or provider
    ///
    /// Provider errors are not cached.
    pub async fn get_bank_account(
        &self,
        control: CacheControl,
        query: &BankAccountQuery,
        api_key: &str,
    ) -> Result<BankAccount, TransferError> {
        query.validate()?;
        let caller = self.accounts.get_account_by_api_key(api_key).await?;

        let key = query.cache_key()?;
        let fetched = self
            .cache
            .fetch(&key, control, || self.provider.get_bank_account(query))
            .await?;
        if let Some(e) = fetched.cache_error {
            warn!(key = %key, error = %e, "Bank account cache refresh failed");
        }
        debug!(
            account_id = caller.id,
            bank_id = query.bank_id,
            source = ?fetched.source,
            "Bank account resolved"
        );
        Ok(fetched.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::MemoryAccountStore;
    use crate::cache::{CacheStore, MemoryCache};
    use crate::config::DevAccount;
    use crate::transfer::provider::mock::MockProvider;
    use std::time::Duration;

    struct Setup {
        provider: Arc<MockProvider>,
        cache: Arc<MemoryCache>,
        banks: BankAccounts,
    }

    fn setup() -> Setup {
        let cache = Arc::new(MemoryCache::new());
        let aside = CacheAside::new(cache.clone(), Duration::from_secs(60));
        let accounts = Arc::new(AccountDirectory::new(
            Arc::new(MemoryAccountStore::from_dev_accounts(&[DevAccount {
                id: 3,
                name: "demo".into(),
                api_key: "dev-key".into(),
            }])),
            aside.clone(),
        ));
        let provider = Arc::new(MockProvider::new());
        provider.add_bank_account(account("acc-1", 500));
        let banks = BankAccounts::new(accounts, provider.clone(), aside);
        Setup {
            provider,
            cache,
            banks,
        }
    }

    fn account(id: &str, amount: i64) -> BankAccount {
        BankAccount {
            id: id.into(),
            bank_id: 1,
            account_number: "1234567890".into(),
            account_name: "Jane".into(),
            account_amount: Decimal::from(amount),
        }
    }

    fn query() -> BankAccountQuery {
        BankAccountQuery {
            bank_id: 1,
            account_name: "Jane".into(),
            account_number: "1234567890".into(),
        }
    }

    #[tokio::test]
    async fn test_lookup_is_cached_until_revalidated() {
        let s = setup();
        let got = s
            .banks
            .get_bank_account(CacheControl::Default, &query(), "dev-key")
            .await
            .unwrap();
        assert_eq!(got.id, "acc-1");
        assert_eq!(s.provider.bank_account_count(), 1);

        s.provider.add_bank_account(account("acc-1", 900));
        let cached = s
            .banks
            .get_bank_account(CacheControl::Default, &query(), "dev-key")
            .await
            .unwrap();
        assert_eq!(cached.account_amount, Decimal::from(500));
        assert_eq!(s.provider.bank_account_count(), 1);

        let fresh = s
            .banks
            .get_bank_account(CacheControl::MustRevalidate, &query(), "dev-key")
            .await
            .unwrap();
        assert_eq!(fresh.account_amount, Decimal::from(900));
        assert_eq!(s.provider.bank_account_count(), 2);

        let cached = s
            .banks
            .get_bank_account(CacheControl::Default, &query(), "dev-key")
            .await
            .unwrap();
        assert_eq!(cached.account_amount, Decimal::from(900));
    }

    #[tokio::test]
    async fn test_unknown_key_never_reaches_provider() {
        let s = setup();
        assert!(matches!(
            s.banks
                .get_bank_account(CacheControl::Default, &query(), "nope")
                .await,
            Err(TransferError::NotAuthorized(_))
        ));
        assert_eq!(s.provider.bank_account_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_account_is_not_cached() {
        let s = setup();
        let missing = BankAccountQuery {
            account_number: "000".into(),
            ..query()
        };
        for _ in 0..2 {
            assert!(matches!(
                s.banks
                    .get_bank_account(CacheControl::Default, &missing, "dev-key")
                    .await,
                Err(TransferError::NotFound(_))
            ));
        }
        assert_eq!(s.provider.bank_account_count(), 2);
        let key = missing.cache_key().unwrap();
        assert!(s.cache.get(&key).await.unwrap().is_none());
    }

    #[test]
    fn test_query_validation_and_key() {
        assert!(query().validate().is_ok());
        assert!(BankAccountQuery::default().validate().is_err());
        assert!(
            BankAccountQuery {
                account_number: " ".into(),
                ..query()
            }
            .validate()
            .is_err()
        );

        let key = query().cache_key().unwrap();
        assert!(key.starts_with(BANK_ACCOUNT_KEY_NS));
        assert_ne!(
            key,
            BankAccountQuery {
                bank_id: 2,
                ..query()
            }
            .cache_key()
            .unwrap()
        );
    }
}
