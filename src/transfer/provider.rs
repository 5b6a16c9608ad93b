//! Payment Provider Client
//!
//! Create a transfer at the provider, poll its status and look up bank
//! accounts. Calls are bounded by the client timeout so a stuck provider cannot
//! stall a handler or a sweep.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use tracing::debug;

use super::error::TransferError;
use super::types::{ProviderCreateRequest, ProviderTransfer};
use crate::bank::{BankAccount, BankAccountQuery};
use crate::config::ProviderConfig;

/// Downstream payment provider
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_transfer(
        &self,
        request: &ProviderCreateRequest,
    ) -> Result<ProviderTransfer, TransferError>;

    async fn get_transfer_status(&self, provider_id: &str)
    -> Result<ProviderTransfer, TransferError>;

    async fn get_bank_account(&self, query: &BankAccountQuery)
    -> Result<BankAccount, TransferError>;
}

/// reqwest-based provider client
pub struct HttpPaymentClient {
    client: reqwest::Client,
    create_url: String,
    get_url: String,
    bank_account_url: String,
}

impl HttpPaymentClient {
    pub fn new(config: &ProviderConfig) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms.max(1)))
            .build()
            .map_err(|e| {
                TransferError::BadRequest(format!("failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            create_url: config.create_transaction_url.clone(),
            get_url: config.get_transaction_url.clone(),
            bank_account_url: config.get_bank_account_url.clone(),
        })
    }

    async fn read_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, TransferError> {
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransferError::BadRequest(format!("provider read failed: {}", e)))?;

        if !status.is_success() {
            return Err(status_error(status, &String::from_utf8_lossy(&body)));
        }
        decode_single(&body)
    }
}

#[async_trait]
impl PaymentProvider for HttpPaymentClient {
    async fn create_transfer(
        &self,
        request: &ProviderCreateRequest,
    ) -> Result<ProviderTransfer, TransferError> {
        debug!(url = %self.create_url, amount = request.amount, "Provider create");
        let response = self
            .client
            .post(&self.create_url)
            .json(request)
            .send()
            .await
            .map_err(|e| TransferError::BadRequest(format!("provider request failed: {}", e)))?;
        Self::read_response(response).await
    }

    async fn get_transfer_status(
        &self,
        provider_id: &str,
    ) -> Result<ProviderTransfer, TransferError> {
        let url = format!("{}{}", self.get_url, provider_id);
        debug!(url = %url, "Provider status");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| TransferError::BadRequest(format!("provider request failed: {}", e)))?;
        Self::read_response(response).await
    }

    async fn get_bank_account(
        &self,
        query: &BankAccountQuery,
    ) -> Result<BankAccount, TransferError> {
        debug!(url = %self.bank_account_url, bank_id = query.bank_id, "Provider bank account");
        let response = self
            .client
            .get(&self.bank_account_url)
            .query(&[
                ("bank_id", query.bank_id.to_string()),
                ("account_name", query.account_name.clone()),
                ("account_number", query.account_number.clone()),
            ])
            .send()
            .await
            .map_err(|e| TransferError::BadRequest(format!("provider request failed: {}", e)))?;
        Self::read_response(response).await
    }
}

fn status_error(status: StatusCode, body: &str) -> TransferError {
    match status {
        StatusCode::NOT_FOUND => TransferError::NotFound(format!("provider: {}", body)),
        StatusCode::UNAUTHORIZED => TransferError::NotAuthorized(format!("provider: {}", body)),
        other => TransferError::BadRequest(format!("provider returned {}: {}", other, body)),
    }
}

/// Object as-is, or the first element of an array
fn decode_single<T: DeserializeOwned>(body: &[u8]) -> Result<T, TransferError> {
    let value: JsonValue = serde_json::from_slice(body)?;
    let single = match value {
        JsonValue::Array(items) => items
            .into_iter()
            .next()
            .ok_or_else(|| TransferError::BadRequest("provider returned an empty list".into()))?,
        other => other,
    };
    if !single.is_object() {
        return Err(TransferError::BadRequest(format!(
            "unexpected provider response: {}",
            single
        )));
    }
    Ok(serde_json::from_value(single)?)
}
