//! Transfer Job Types
//!
//! Records, requests and provider envelopes for the transfer-job pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::error::TransferError;
use super::state::JobStatus;

/// Message key prefix for published transfer jobs
pub const TRANSFER_KEY_PREFIX: &str = "pubTransfer:";

/// Job correlation identifier - ULID based
///
/// Sortable by creation time and collision resistant without coordination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JobId(ulid::Ulid);

impl JobId {
    /// Generate a new unique JobId
    pub fn new() -> Self {
        Self(ulid::Ulid::new())
    }

    /// Creation time encoded in the id (milliseconds since epoch)
    pub fn timestamp_ms(&self) -> u64 {
        self.0.timestamp_ms()
    }

    /// Message key used when publishing this job
    pub fn message_key(&self) -> String {
        format!("{}{}", TRANSFER_KEY_PREFIX, self)
    }

    /// Recover the job id from a published message key
    pub fn from_message_key(key: &str) -> Result<Self, TransferError> {
        let raw = key.strip_prefix(TRANSFER_KEY_PREFIX).ok_or_else(|| {
            TransferError::BadRequest(format!("unexpected message key: {}", key))
        })?;
        raw.parse()
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ulid::Ulid::from_string(s)
            .map(Self)
            .map_err(|e| TransferError::BadRequest(format!("invalid job_id '{}': {}", s, e)))
    }
}

impl TryFrom<String> for JobId {
    type Error = TransferError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<JobId> for String {
    fn from(id: JobId) -> Self {
        id.to_string()
    }
}

/// Audit columns shared by every stored entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditInfo {
    pub created_by: i64,
    pub created_at: DateTime<Utc>,
    pub updated_by: i64,
    pub updated_at: DateTime<Utc>,
    pub deleted_by: Option<i64>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl AuditInfo {
    pub fn new(actor: i64, at: DateTime<Utc>) -> Self {
        Self {
            created_by: actor,
            created_at: at,
            updated_by: actor,
            updated_at: at,
            deleted_by: None,
            deleted_at: None,
        }
    }

    /// Active record = not soft-deleted
    pub fn is_active(&self) -> bool {
        self.deleted_at.is_none() && self.deleted_by.is_none()
    }
}

/// Stored transfer job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferJob {
    /// Surrogate key assigned by storage
    pub id: i64,
    pub job_id: JobId,
    pub api_key: String,
    /// Original request at creation, provider envelope after correlation
    pub payload: JsonValue,
    pub status: JobStatus,
    #[serde(flatten)]
    pub audit: AuditInfo,
}

impl TransferJob {
    /// Provider-side transfer id, once the create call has been recorded
    pub fn provider_id(&self) -> Option<&str> {
        self.payload
            .get("id")
            .and_then(JsonValue::as_str)
            .filter(|id| !id.is_empty())
    }
}

/// Row to insert; storage fills `id` and the audit timestamps
#[derive(Debug, Clone, PartialEq)]
pub struct NewTransferJob {
    pub job_id: JobId,
    pub api_key: String,
    pub payload: JsonValue,
    pub status: JobStatus,
    pub created_by: i64,
}

/// Transfer submission request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTransfer {
    pub source_bank_account: String,
    pub destination_bank_account: String,
    pub source_bank_id: i64,
    pub destination_bank_id: i64,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    #[serde(default = "Utc::now")]
    pub transaction_time: DateTime<Utc>,
}

impl CreateTransfer {
    /// Business validation before a job row is created
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.source_bank_account.trim().is_empty() {
            return Err(TransferError::BadRequest(
                "source_bank_account is required".into(),
            ));
        }
        if self.destination_bank_account.trim().is_empty() {
            return Err(TransferError::BadRequest(
                "destination_bank_account is required".into(),
            ));
        }
        if self.source_bank_id <= 0 || self.destination_bank_id <= 0 {
            return Err(TransferError::BadRequest("bank ids must be positive".into()));
        }
        if self.amount <= Decimal::ZERO {
            return Err(TransferError::BadRequest(
                "amount must be greater than zero".into(),
            ));
        }
        if self.amount.trunc().to_i64().is_none() {
            return Err(TransferError::BadRequest("amount is too large".into()));
        }
        if self.source_bank_id == self.destination_bank_id
            && self.source_bank_account == self.destination_bank_account
        {
            return Err(TransferError::BadRequest(
                "source and destination account cannot be the same".into(),
            ));
        }
        Ok(())
    }

    /// Request body for the provider's create-transaction endpoint
    pub fn to_provider_request(&self) -> ProviderCreateRequest {
        ProviderCreateRequest {
            source_bank_account: self.source_bank_account.clone(),
            destination_bank_account: self.destination_bank_account.clone(),
            source_bank_id: self.source_bank_id,
            destination_bank_id: self.destination_bank_id,
            // Provider works in whole units
            amount: self.amount.trunc().to_i64().unwrap_or_default(),
            transaction_time: self
                .transaction_time
                .to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// Body of `POST {create_transaction_url}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderCreateRequest {
    pub source_bank_account: String,
    pub destination_bank_account: String,
    pub source_bank_id: i64,
    pub destination_bank_id: i64,
    pub amount: i64,
    pub transaction_time: String,
}

/// Provider transfer envelope (create and status responses share the shape)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderTransfer {
    pub id: String,
    pub amount: i64,
    pub status: String,
    pub transaction_date: String,
    pub source_bank_account: String,
    pub destination_bank_account: String,
    pub source_bank_id: i64,
    pub destination_bank_id: i64,
}

impl ProviderTransfer {
    /// Provider status mapped onto job status; `None` for unknown strings
    pub fn job_status(&self) -> Option<JobStatus> {
        self.status.parse().ok()
    }
}
