//! Transfer Error Types
//!
//! Error taxonomy for the transfer-job pipeline. Numeric codes follow the
//! service-wide error numbering so API clients see stable values.

use thiserror::Error;

use crate::bus::BusError;
use crate::cache::CacheError;

/// Transfer pipeline error
///
/// Storage failures are split by phase (begin / apply / commit / rollback) so
/// operators can tell them apart in logs.
#[derive(Error, Debug, Clone)]
pub enum TransferError {
    // === Client Errors ===
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    // === Durable Store Errors ===
    #[error("Failed to begin transaction: {0}")]
    StorageTransaction(String),

    #[error("Failed to commit transaction: {0}")]
    StorageCommit(String),

    #[error("Failed to roll back transaction: {0}")]
    StorageRollback(String),

    #[error("Insert failed: {0}")]
    StorageInsert(String),

    #[error("Update failed: {0}")]
    StorageUpdate(String),

    #[error("Delete failed: {0}")]
    StorageDelete(String),

    // === Infrastructure Errors ===
    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),
}

impl TransferError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::BadRequest(_) => "BAD_REQUEST",
            TransferError::NotAuthorized(_) => "NOT_AUTHORIZED",
            TransferError::NotFound(_) => "NOT_FOUND",
            TransferError::StorageTransaction(_) => "STORAGE_TRANSACTION",
            TransferError::StorageCommit(_) => "STORAGE_COMMIT",
            TransferError::StorageRollback(_) => "STORAGE_ROLLBACK",
            TransferError::StorageInsert(_) => "STORAGE_INSERT",
            TransferError::StorageUpdate(_) => "STORAGE_UPDATE",
            TransferError::StorageDelete(_) => "STORAGE_DELETE",
            TransferError::Cache(_) => "CACHE_ERROR",
            TransferError::Dispatch(_) => "DISPATCH_ERROR",
            TransferError::InvalidStateTransition(_) => "INVALID_STATE_TRANSITION",
        }
    }

    /// Numeric service error code
    pub fn numeric_code(&self) -> i32 {
        match self {
            TransferError::BadRequest(_)
            | TransferError::Cache(_)
            | TransferError::Dispatch(_)
            | TransferError::InvalidStateTransition(_) => 40000,
            TransferError::StorageTransaction(_) => 40001,
            TransferError::StorageCommit(_) => 40002,
            TransferError::StorageRollback(_) => 40003,
            TransferError::StorageInsert(_) => 40004,
            TransferError::StorageUpdate(_) => 40005,
            TransferError::StorageDelete(_) => 40006,
            TransferError::NotAuthorized(_) => 401000,
            TransferError::NotFound(_) => 404000,
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            TransferError::NotAuthorized(_) => 401,
            TransferError::NotFound(_) => 404,
            TransferError::Dispatch(_) => 503,
            TransferError::InvalidStateTransition(_) => 409,
            TransferError::BadRequest(_)
            | TransferError::StorageTransaction(_)
            | TransferError::StorageCommit(_)
            | TransferError::StorageRollback(_)
            | TransferError::StorageInsert(_)
            | TransferError::StorageUpdate(_)
            | TransferError::StorageDelete(_)
            | TransferError::Cache(_) => 400,
        }
    }

    /// Whether this is a durable-store failure
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            TransferError::StorageTransaction(_)
                | TransferError::StorageCommit(_)
                | TransferError::StorageRollback(_)
                | TransferError::StorageInsert(_)
                | TransferError::StorageUpdate(_)
                | TransferError::StorageDelete(_)
        )
    }
}

impl From<sqlx::Error> for TransferError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => TransferError::NotFound("no matching row".to_string()),
            other => TransferError::BadRequest(format!("storage: {}", other)),
        }
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(e: serde_json::Error) -> Self {
        TransferError::BadRequest(format!("serialization: {}", e))
    }
}

impl From<CacheError> for TransferError {
    fn from(e: CacheError) -> Self {
        TransferError::Cache(e.to_string())
    }
}

impl From<BusError> for TransferError {
    fn from(e: BusError) -> Self {
        TransferError::Dispatch(e.to_string())
    }
}
