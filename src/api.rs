//! HTTP API
//!
//! - `POST /api/v1/transfer` submit a transfer (`API-Key` header)
//! - `GET  /api/v1/transfer` list jobs by filter + pagination
//! - `GET  /api/v1/transfer/{job_id}` single job
//! - `GET  /api/v1/bank` bank account inquiry (`API-Key` header)
//!
//! Reads honour `Cache-Control: must-revalidate`. Every response uses the
//! `{code, msg, data}` envelope; `code` is 0 on success.

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::header::CACHE_CONTROL;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tracing::warn;

use crate::bank::{BankAccount, BankAccountQuery, BankAccounts};
use crate::cache::CacheControl;
use crate::transfer::coordinator::TransferCoordinator;
use crate::transfer::error::TransferError;
use crate::transfer::filter::{JobFilter, JobQuery, Pagination};
use crate::transfer::types::{CreateTransfer, JobId, TransferJob};

pub const API_KEY_HEADER: &str = "API-Key";

/// Unified response envelope
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub code: i32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            msg: "ok".to_string(),
            data: Some(data),
        }
    }

    pub fn error(code: i32, msg: impl Into<String>) -> ApiResponse<()> {
        ApiResponse {
            code,
            msg: msg.into(),
            data: None,
        }
    }
}

/// Domain error rendered as an envelope with the matching HTTP status
#[derive(Debug)]
pub struct ApiError(pub TransferError);

impl From<TransferError> for ApiError {
    fn from(e: TransferError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::BAD_REQUEST);
        if status.is_server_error() || self.0.is_storage() {
            warn!(code = self.0.code(), error = %self.0, "Request failed");
        }
        let body = Json(ApiResponse::<()>::error(
            self.0.numeric_code(),
            self.0.to_string(),
        ));
        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse::success(data)))
}

#[derive(Debug, Serialize)]
pub struct TransferPage {
    pub items: Vec<TransferJob>,
    pub pagination: Pagination,
}

pub struct ApiState {
    pub coordinator: Arc<TransferCoordinator>,
    pub banks: Arc<BankAccounts>,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health_check))
        .route(
            "/api/v1/transfer",
            get(list_transfers).post(create_transfer),
        )
        .route("/api/v1/transfer/{job_id}", get(get_transfer))
        .route("/api/v1/bank", get(get_bank_account))
        .with_state(state)
}

async fn health_check() -> ApiResult<&'static str> {
    ok("up")
}

async fn create_transfer(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    body: Result<Json<CreateTransfer>, JsonRejection>,
) -> ApiResult<TransferJob> {
    let api_key = api_key(&headers);
    let Json(request) = body.map_err(|e| TransferError::BadRequest(e.body_text()))?;

    let job = state.coordinator.transfer(api_key, request).await?;
    ok(job)
}

async fn list_transfers(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<TransferPage> {
    let query = parse_job_query(&params)?;
    let (items, pagination) = state
        .coordinator
        .get_by_param(cache_control(&headers), &query)
        .await?;
    ok(TransferPage { items, pagination })
}

async fn get_transfer(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Path(job_id): Path<String>,
) -> ApiResult<TransferJob> {
    let job_id: JobId = job_id.parse()?;
    let job = state
        .coordinator
        .get_by_job_id(cache_control(&headers), job_id)
        .await?;
    ok(job)
}

async fn get_bank_account(
    State(state): State<Arc<ApiState>>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> ApiResult<BankAccount> {
    let query = parse_bank_account_query(&params)?;
    let account = state
        .banks
        .get_bank_account(cache_control(&headers), &query, api_key(&headers))
        .await?;
    ok(account)
}

fn api_key(headers: &HeaderMap) -> &str {
    headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

fn cache_control(headers: &HeaderMap) -> CacheControl {
    CacheControl::from_header(headers.get(CACHE_CONTROL).and_then(|v| v.to_str().ok()))
}

fn param<T>(params: &HashMap<String, String>, name: &str) -> Result<Option<T>, TransferError>
where
    T: FromStr,
    T::Err: Display,
{
    match params.get(name).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|e| TransferError::BadRequest(format!("invalid {}: {}", name, e))),
    }
}

/// Build a [`JobQuery`] from query-string parameters
///
/// Timestamps are RFC 3339; `payload` is a JSON document matched exactly.
/// Unknown parameters are ignored.
pub fn parse_job_query(params: &HashMap<String, String>) -> Result<JobQuery, TransferError> {
    let payload = match params.get("payload").filter(|v| !v.is_empty()) {
        Some(raw) => Some(
            serde_json::from_str(raw)
                .map_err(|e| TransferError::BadRequest(format!("invalid payload: {}", e)))?,
        ),
        None => None,
    };

    let filter = JobFilter {
        id: param(params, "id")?,
        job_id: param(params, "job_id")?,
        api_key: param(params, "api_key")?,
        payload,
        status: param(params, "status")?,
        created_at_gt: param(params, "created_at_gt")?,
        created_at_gte: param(params, "created_at_gte")?,
        created_at_lt: param(params, "created_at_lt")?,
        created_at_lte: param(params, "created_at_lte")?,
        ..Default::default()
    };

    Ok(JobQuery {
        filter,
        order_by: param(params, "order_by")?,
        page: param(params, "page")?.unwrap_or(0),
        limit: param(params, "limit")?.unwrap_or(0),
    })
}

/// Build a [`BankAccountQuery`] from `bank_id`, `account_name`, `account_number`
pub fn parse_bank_account_query(
    params: &HashMap<String, String>,
) -> Result<BankAccountQuery, TransferError> {
    let query = BankAccountQuery {
        bank_id: param(params, "bank_id")?.unwrap_or(0),
        account_name: params.get("account_name").cloned().unwrap_or_default(),
        account_number: params.get("account_number").cloned().unwrap_or_default(),
    };
    query.validate()?;
    Ok(query)
}
