//! Job Filters, Ordering and Pagination
//!
//! Filters double as cache keys: the key is a namespace prefix plus the
//! stable JSON encoding of the (normalized) filter struct.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use super::error::TransferError;
use super::state::JobStatus;
use super::types::{JobId, TransferJob};

/// Single-row lookup cache namespace
pub const SINGLE_KEY_NS: &str = "transfer:single:";
/// Paginated lookup cache namespace (row data)
pub const PAGE_KEY_NS: &str = "transfer:page:";
/// Paginated lookup cache namespace (pagination metadata)
pub const PAGE_META_KEY_NS: &str = "transfer:page_meta:";

/// Exact-match and creation-time range filter
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    /// Keyset cursor: rows with `id` strictly greater
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id_gt: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<JobStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at_gt: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at_gte: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at_lt: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at_lte: Option<DateTime<Utc>>,
}

impl JobFilter {
    pub fn by_job_id(job_id: JobId) -> Self {
        Self {
            job_id: Some(job_id),
            ..Default::default()
        }
    }

    /// Pending jobs created in `[from, to)`
    pub fn pending_between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Pending),
            created_at_gte: Some(from),
            created_at_lt: Some(to),
            ..Default::default()
        }
    }

    /// In-process evaluation (soft-deleted rows never match)
    pub fn matches(&self, job: &TransferJob) -> bool {
        let created = job.audit.created_at;
        job.audit.is_active()
            && self.id.is_none_or(|v| job.id == v)
            && self.id_gt.is_none_or(|v| job.id > v)
            && self.job_id.is_none_or(|v| job.job_id == v)
            && self.api_key.as_ref().is_none_or(|v| &job.api_key == v)
            && self.payload.as_ref().is_none_or(|v| &job.payload == v)
            && self.status.is_none_or(|v| job.status == v)
            && self.created_at_gt.is_none_or(|t| created > t)
            && self.created_at_gte.is_none_or(|t| created >= t)
            && self.created_at_lt.is_none_or(|t| created < t)
            && self.created_at_lte.is_none_or(|t| created <= t)
    }

    pub fn cache_key(&self) -> Result<String, TransferError> {
        Ok(format!("{}{}", SINGLE_KEY_NS, serde_json::to_string(self)?))
    }
}

/// Sortable columns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortColumn {
    Id,
    JobId,
    ApiKey,
    Status,
    CreatedAt,
    UpdatedAt,
}

impl SortColumn {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortColumn::Id => "id",
            SortColumn::JobId => "job_id",
            SortColumn::ApiKey => "api_key",
            SortColumn::Status => "status",
            SortColumn::CreatedAt => "created_at",
            SortColumn::UpdatedAt => "updated_at",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "id" => Some(SortColumn::Id),
            "job_id" => Some(SortColumn::JobId),
            "api_key" => Some(SortColumn::ApiKey),
            "status" => Some(SortColumn::Status),
            "created_at" => Some(SortColumn::CreatedAt),
            "updated_at" => Some(SortColumn::UpdatedAt),
            _ => None,
        }
    }
}

/// One `ORDER BY` term
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderBy {
    pub column: SortColumn,
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(column: SortColumn) -> Self {
        Self {
            column,
            descending: false,
        }
    }

    /// Parse a comma-separated list like `"created_at desc, id"`
    ///
    /// Only whitelisted columns are accepted; the result is safe to splice into SQL.
    pub fn parse_list(s: &str) -> Result<Vec<OrderBy>, TransferError> {
        let mut out = Vec::new();
        for term in s.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            let mut parts = term.split_whitespace();
            let column = parts
                .next()
                .map(|c| c.to_ascii_lowercase())
                .and_then(|c| SortColumn::parse(&c))
                .ok_or_else(|| TransferError::BadRequest(format!("invalid order_by: {}", term)))?;
            let descending = match parts.next().map(|d| d.to_ascii_lowercase()) {
                None => false,
                Some(d) if d == "asc" => false,
                Some(d) if d == "desc" => true,
                Some(_) => {
                    return Err(TransferError::BadRequest(format!(
                        "invalid order_by direction: {}",
                        term
                    )));
                }
            };
            if parts.next().is_some() {
                return Err(TransferError::BadRequest(format!("invalid order_by: {}", term)));
            }
            out.push(OrderBy { column, descending });
        }
        Ok(out)
    }
}

/// Filtered, ordered, paginated query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobQuery {
    #[serde(flatten)]
    pub filter: JobFilter,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,
    /// 1-indexed; 0 means "default" (1)
    pub page: i64,
    /// 0 means "default" (configured page limit)
    pub limit: i64,
}

impl JobQuery {
    pub fn new(filter: JobFilter) -> Self {
        Self {
            filter,
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_page(mut self, page: i64) -> Self {
        self.page = page;
        self
    }

    pub fn with_order_by(mut self, order_by: impl Into<String>) -> Self {
        self.order_by = Some(order_by.into());
        self
    }

    /// Apply page/limit defaults
    pub fn normalized(mut self, default_limit: i64) -> Self {
        if self.page <= 0 {
            self.page = 1;
        }
        if self.limit <= 0 {
            self.limit = default_limit.max(1);
        }
        self
    }

    pub fn offset(&self) -> i64 {
        (self.page.max(1) - 1) * self.limit
    }

    pub fn order_terms(&self) -> Result<Vec<OrderBy>, TransferError> {
        match &self.order_by {
            Some(s) => OrderBy::parse_list(s),
            None => Ok(Vec::new()),
        }
    }

    pub fn data_cache_key(&self) -> Result<String, TransferError> {
        Ok(format!("{}{}", PAGE_KEY_NS, serde_json::to_string(self)?))
    }

    pub fn meta_cache_key(&self) -> Result<String, TransferError> {
        Ok(format!("{}{}", PAGE_META_KEY_NS, serde_json::to_string(self)?))
    }
}

/// Pagination metadata derived from a count query and a bounded page query
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub current_page: i64,
    pub current_elements: i64,
    pub total_pages: i64,
    pub total_elements: i64,
    pub sort_by: String,
}

impl Pagination {
    pub fn new(query: &JobQuery, current_elements: usize, total_elements: i64) -> Self {
        Self {
            current_page: query.page,
            current_elements: current_elements as i64,
            total_pages: total_pages(total_elements, query.limit),
            total_elements,
            sort_by: query.order_by.clone().unwrap_or_default(),
        }
    }
}

/// `count / limit + 1` when there are rows, else 1
///
/// An exact multiple of `limit` reports one trailing empty page.
pub fn total_pages(total_elements: i64, limit: i64) -> i64 {
    if total_elements > 0 && limit > 0 {
        total_elements / limit + 1
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::types::AuditInfo;
    use chrono::Duration;

    fn job(status: JobStatus, created_at: DateTime<Utc>) -> TransferJob {
        TransferJob {
            id: 7,
            job_id: JobId::new(),
            api_key: "key-1".into(),
            payload: serde_json::json!({"amount": 1}),
            status,
            audit: AuditInfo::new(1, created_at),
        }
    }

    #[test]
    fn test_total_pages_formula() {
        assert_eq!(total_pages(23, 10), 3);
        assert_eq!(total_pages(0, 10), 1);
        assert_eq!(total_pages(5, 10), 1);
        // Exact multiple keeps the trailing page
        assert_eq!(total_pages(20, 10), 3);
        assert_eq!(total_pages(10, 10), 2);
    }

    #[test]
    fn test_normalize_defaults() {
        let q = JobQuery::default().normalized(25);
        assert_eq!(q.page, 1);
        assert_eq!(q.limit, 25);
        assert_eq!(q.offset(), 0);

        let q = JobQuery::default().with_page(3).with_limit(10).normalized(25);
        assert_eq!(q.offset(), 20);
    }

    #[test]
    fn test_order_by_parse() {
        let terms = OrderBy::parse_list("created_at desc, id").unwrap();
        assert_eq!(terms.len(), 2);
        assert_eq!(terms[0].column, SortColumn::CreatedAt);
        assert!(terms[0].descending);
        assert_eq!(terms[1], OrderBy::asc(SortColumn::Id));

        assert!(OrderBy::parse_list("payload").is_err());
        assert!(OrderBy::parse_list("id; drop table transfer_jobs").is_err());
        assert!(OrderBy::parse_list("id sideways").is_err());
        assert!(OrderBy::parse_list("").unwrap().is_empty());
    }

    #[test]
    fn test_filter_matches() {
        let now = Utc::now();
        let j = job(JobStatus::Pending, now);

        assert!(JobFilter::default().matches(&j));
        assert!(JobFilter::by_job_id(j.job_id).matches(&j));
        assert!(!JobFilter::by_job_id(JobId::new()).matches(&j));

        let window = JobFilter::pending_between(now - Duration::hours(1), now + Duration::hours(1));
        assert!(window.matches(&j));

        // Upper bound is exclusive, lower bound inclusive
        assert!(!JobFilter::pending_between(now - Duration::hours(1), now).matches(&j));
        assert!(JobFilter::pending_between(now, now + Duration::seconds(1)).matches(&j));

        let done = job(JobStatus::Success, now);
        assert!(!window.matches(&done));

        let after = |id| JobFilter {
            id_gt: Some(id),
            ..Default::default()
        };
        assert!(after(6).matches(&j));
        assert!(!after(7).matches(&j));
    }

    #[test]
    fn test_soft_deleted_never_matches() {
        let mut j = job(JobStatus::Pending, Utc::now());
        j.audit.deleted_by = Some(9);
        j.audit.deleted_at = Some(Utc::now());
        assert!(!JobFilter::default().matches(&j));
    }

    #[test]
    fn test_cache_keys_are_stable_and_namespaced() {
        let id = JobId::new();
        let a = JobFilter::by_job_id(id).cache_key().unwrap();
        let b = JobFilter::by_job_id(id).cache_key().unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with(SINGLE_KEY_NS));
        assert_ne!(a, JobFilter::by_job_id(JobId::new()).cache_key().unwrap());

        let q = JobQuery::new(JobFilter::by_job_id(id)).normalized(10);
        let data = q.data_cache_key().unwrap();
        let meta = q.meta_cache_key().unwrap();
        assert_ne!(data, meta);
        assert!(data.starts_with(PAGE_KEY_NS));
        assert!(meta.starts_with(PAGE_META_KEY_NS));
        assert_ne!(data, a);
    }

    #[test]
    fn test_pagination_new() {
        let q = JobQuery::default().with_limit(10).with_order_by("id").normalized(10);
        let p = Pagination::new(&q, 10, 23);
        assert_eq!(p.current_page, 1);
        assert_eq!(p.current_elements, 10);
        assert_eq!(p.total_pages, 3);
        assert_eq!(p.total_elements, 23);
        assert_eq!(p.sort_by, "id");
    }
}
