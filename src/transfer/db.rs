//! Transfer Job Storage
//!
//! Durable CRUD over `transfer_jobs`. Every write runs in its own transaction:
//! begin → apply → commit, rolling back on a failed apply. Each phase maps to
//! its own storage error so operators can tell them apart.
//!
//! Status writes can be made conditional on the stored status (CAS), so the
//! consumer and the reconciliation sweep never clobber each other.

use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row, Transaction};
use tracing::{debug, warn};

use super::error::TransferError;
use super::filter::{JobFilter, OrderBy, SortColumn};
use super::state::JobStatus;
use super::types::{AuditInfo, JobId, NewTransferJob, TransferJob};

const JOB_COLUMNS: &str = "id, job_id, api_key, payload, status::text AS status, \
     created_by, created_at, updated_by, updated_at, deleted_by, deleted_at";

/// Durable job storage
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: NewTransferJob) -> Result<TransferJob, TransferError>;

    /// Persist `payload` and `status` of `job`
    ///
    /// With `expected = Some(s)` the write only applies while the stored status
    /// is still `s`. Returns the updated row, or `None` when nothing matched.
    async fn update(
        &self,
        job: &TransferJob,
        updated_by: i64,
        expected: Option<JobStatus>,
    ) -> Result<Option<TransferJob>, TransferError>;

    /// Move a pending row to `status`, leaving `payload` untouched
    ///
    /// Applies only while the stored row is still pending and its `updated_at`
    /// equals `job`'s, i.e. nobody wrote it since `job` was read. Returns the
    /// updated row, or `None` when the row moved on.
    async fn settle(
        &self,
        job: &TransferJob,
        status: JobStatus,
        updated_by: i64,
    ) -> Result<Option<TransferJob>, TransferError>;

    /// Soft delete marks `deleted_by/at`; hard delete removes the row
    async fn delete(
        &self,
        job: &TransferJob,
        deleted_by: i64,
        hard: bool,
    ) -> Result<bool, TransferError>;

    /// First active row matching `filter`, `NotFound` otherwise
    async fn find_one(&self, filter: &JobFilter) -> Result<TransferJob, TransferError>;

    async fn count(&self, filter: &JobFilter) -> Result<i64, TransferError>;

    async fn find_many(
        &self,
        filter: &JobFilter,
        order: &[OrderBy],
        offset: i64,
        limit: i64,
    ) -> Result<Vec<TransferJob>, TransferError>;
}

// ============================================================================
// PostgreSQL
// ============================================================================

pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, TransferError> {
        self.pool
            .begin()
            .await
            .map_err(|e| TransferError::StorageTransaction(e.to_string()))
    }

    async fn commit(tx: Transaction<'static, Postgres>) -> Result<(), TransferError> {
        tx.commit()
            .await
            .map_err(|e| TransferError::StorageCommit(e.to_string()))
    }

    /// Roll back after a failed apply; a failed rollback wins over the apply error
    async fn abort(tx: Transaction<'static, Postgres>, apply_err: TransferError) -> TransferError {
        match tx.rollback().await {
            Ok(()) => apply_err,
            Err(e) => {
                warn!(error = %e, cause = %apply_err, "Rollback failed");
                TransferError::StorageRollback(format!("{} (after: {})", e, apply_err))
            }
        }
    }

    fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &JobFilter) {
        qb.push(" WHERE deleted_at IS NULL");
        if let Some(id) = filter.id {
            qb.push(" AND id = ").push_bind(id);
        }
        if let Some(id) = filter.id_gt {
            qb.push(" AND id > ").push_bind(id);
        }
        if let Some(job_id) = filter.job_id {
            qb.push(" AND job_id = ").push_bind(job_id.to_string());
        }
        if let Some(api_key) = &filter.api_key {
            qb.push(" AND api_key = ").push_bind(api_key.clone());
        }
        if let Some(payload) = &filter.payload {
            qb.push(" AND payload = ").push_bind(Json(payload.clone()));
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ")
                .push_bind(status.as_str())
                .push("::transferstatus");
        }
        if let Some(t) = filter.created_at_gt {
            qb.push(" AND created_at > ").push_bind(t);
        }
        if let Some(t) = filter.created_at_gte {
            qb.push(" AND created_at >= ").push_bind(t);
        }
        if let Some(t) = filter.created_at_lt {
            qb.push(" AND created_at < ").push_bind(t);
        }
        if let Some(t) = filter.created_at_lte {
            qb.push(" AND created_at <= ").push_bind(t);
        }
    }

    fn push_order(qb: &mut QueryBuilder<'_, Postgres>, order: &[OrderBy]) {
        qb.push(" ORDER BY ");
        if order.is_empty() {
            qb.push("id ASC");
            return;
        }
        let mut sep = qb.separated(", ");
        for term in order {
            // Column names come from a closed enum
            sep.push(format!(
                "{} {}",
                term.column.as_sql(),
                if term.descending { "DESC" } else { "ASC" }
            ));
        }
    }

    fn row_to_job(row: &PgRow) -> Result<TransferJob, TransferError> {
        let job_id: String = row.try_get("job_id")?;
        let status: String = row.try_get("status")?;
        let Json(payload): Json<serde_json::Value> = row.try_get("payload")?;

        Ok(TransferJob {
            id: row.try_get("id")?,
            job_id: job_id.parse()?,
            api_key: row.try_get("api_key")?,
            payload,
            status: status.parse().map_err(TransferError::BadRequest)?,
            audit: AuditInfo {
                created_by: row.try_get("created_by")?,
                created_at: row.try_get("created_at")?,
                updated_by: row.try_get("updated_by")?,
                updated_at: row.try_get("updated_at")?,
                deleted_by: row.try_get("deleted_by")?,
                deleted_at: row.try_get("deleted_at")?,
            },
        })
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: NewTransferJob) -> Result<TransferJob, TransferError> {
        let mut tx = self.begin().await?;

        let sql = format!(
            "INSERT INTO transfer_jobs \
                 (job_id, api_key, payload, status, created_by, created_at, updated_by, updated_at) \
             VALUES ($1, $2, $3, $4::transferstatus, $5, NOW(), $5, NOW()) \
             RETURNING {}",
            JOB_COLUMNS
        );
        let res = sqlx::query(&sql)
            .bind(job.job_id.to_string())
            .bind(&job.api_key)
            .bind(Json(&job.payload))
            .bind(job.status.as_str())
            .bind(job.created_by)
            .fetch_one(&mut *tx)
            .await;

        let row = match res {
            Ok(row) => row,
            Err(e) => return Err(Self::abort(tx, TransferError::StorageInsert(e.to_string())).await),
        };
        let stored = match Self::row_to_job(&row) {
            Ok(stored) => stored,
            Err(e) => return Err(Self::abort(tx, e).await),
        };
        Self::commit(tx).await?;

        debug!(job_id = %stored.job_id, id = stored.id, "Inserted transfer job");
        Ok(stored)
    }

    async fn update(
        &self,
        job: &TransferJob,
        updated_by: i64,
        expected: Option<JobStatus>,
    ) -> Result<Option<TransferJob>, TransferError> {
        let mut tx = self.begin().await?;

        let mut qb = QueryBuilder::<Postgres>::new("UPDATE transfer_jobs SET payload = ");
        qb.push_bind(Json(job.payload.clone()))
            .push(", status = ")
            .push_bind(job.status.as_str())
            .push("::transferstatus, updated_by = ")
            .push_bind(updated_by)
            .push(", updated_at = NOW() WHERE id = ")
            .push_bind(job.id)
            .push(" AND deleted_at IS NULL");
        if let Some(expected) = expected {
            qb.push(" AND status = ")
                .push_bind(expected.as_str())
                .push("::transferstatus");
        }
        qb.push(" RETURNING ").push(JOB_COLUMNS);

        let res = qb.build().fetch_optional(&mut *tx).await;
        let row = match res {
            Ok(row) => row,
            Err(e) => return Err(Self::abort(tx, TransferError::StorageUpdate(e.to_string())).await),
        };
        let updated = match row.as_ref().map(Self::row_to_job).transpose() {
            Ok(updated) => updated,
            Err(e) => return Err(Self::abort(tx, e).await),
        };
        Self::commit(tx).await?;
        Ok(updated)
    }

    async fn settle(
        &self,
        job: &TransferJob,
        status: JobStatus,
        updated_by: i64,
    ) -> Result<Option<TransferJob>, TransferError> {
        let mut tx = self.begin().await?;

        let sql = format!(
            "UPDATE transfer_jobs \
             SET status = $1::transferstatus, updated_by = $2, updated_at = NOW() \
             WHERE id = $3 AND status = 'pending'::transferstatus \
               AND updated_at = $4 AND deleted_at IS NULL \
             RETURNING {}",
            JOB_COLUMNS
        );
        let res = sqlx::query(&sql)
            .bind(status.as_str())
            .bind(updated_by)
            .bind(job.id)
            .bind(job.audit.updated_at)
            .fetch_optional(&mut *tx)
            .await;

        let row = match res {
            Ok(row) => row,
            Err(e) => return Err(Self::abort(tx, TransferError::StorageUpdate(e.to_string())).await),
        };
        let settled = match row.as_ref().map(Self::row_to_job).transpose() {
            Ok(settled) => settled,
            Err(e) => return Err(Self::abort(tx, e).await),
        };
        Self::commit(tx).await?;
        Ok(settled)
    }

    async fn delete(
        &self,
        job: &TransferJob,
        deleted_by: i64,
        hard: bool,
    ) -> Result<bool, TransferError> {
        let mut tx = self.begin().await?;

        let res = if hard {
            sqlx::query("DELETE FROM transfer_jobs WHERE id = $1")
                .bind(job.id)
                .execute(&mut *tx)
                .await
        } else {
            sqlx::query(
                r#"
                UPDATE transfer_jobs
                SET deleted_by = $1, deleted_at = NOW(), updated_by = $1, updated_at = NOW()
                WHERE id = $2 AND deleted_at IS NULL
                "#,
            )
            .bind(deleted_by)
            .bind(job.id)
            .execute(&mut *tx)
            .await
        };

        let affected = match res {
            Ok(done) => done.rows_affected(),
            Err(e) => return Err(Self::abort(tx, TransferError::StorageDelete(e.to_string())).await),
        };
        Self::commit(tx).await?;
        Ok(affected > 0)
    }

    async fn find_one(&self, filter: &JobFilter) -> Result<TransferJob, TransferError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {} FROM transfer_jobs", JOB_COLUMNS));
        Self::push_filter(&mut qb, filter);
        qb.push(" ORDER BY id ASC LIMIT 1");

        let row = qb
            .build()
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| TransferError::NotFound("transfer job not found".into()))?;
        Self::row_to_job(&row)
    }

    async fn count(&self, filter: &JobFilter) -> Result<i64, TransferError> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM transfer_jobs");
        Self::push_filter(&mut qb, filter);
        let count = qb.build_query_scalar::<i64>().fetch_one(&self.pool).await?;
        Ok(count)
    }

    async fn find_many(
        &self,
        filter: &JobFilter,
        order: &[OrderBy],
        offset: i64,
        limit: i64,
    ) -> Result<Vec<TransferJob>, TransferError> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {} FROM transfer_jobs", JOB_COLUMNS));
        Self::push_filter(&mut qb, filter);
        Self::push_order(&mut qb, order);
        qb.push(" LIMIT ").push_bind(limit).push(" OFFSET ").push_bind(offset);

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_job).collect()
    }
}

// ============================================================================
// In-memory
// ============================================================================

/// DashMap-backed store for local runs and tests
///
/// Call counters let tests assert how often the durable side was hit.
#[derive(Default)]
pub struct MemoryJobStore {
    rows: DashMap<i64, TransferJob>,
    next_id: AtomicI64,
    find_one_calls: AtomicUsize,
    count_calls: AtomicUsize,
    find_many_calls: AtomicUsize,
    update_calls: AtomicUsize,
    fail_writes: AtomicBool,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find_one_calls(&self) -> usize {
        self.find_one_calls.load(Ordering::SeqCst)
    }

    pub fn count_calls(&self) -> usize {
        self.count_calls.load(Ordering::SeqCst)
    }

    pub fn find_many_calls(&self) -> usize {
        self.find_many_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }

    /// Reads issued against the store (single + count + page)
    pub fn read_calls(&self) -> usize {
        self.find_one_calls() + self.count_calls() + self.find_many_calls()
    }

    /// Make inserts/updates/deletes fail with their storage error
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Rewrite a row's creation time (backdating for timeout paths)
    pub fn set_created_at(&self, job_id: JobId, at: DateTime<Utc>) -> bool {
        match self.rows.iter_mut().find(|r| r.job_id == job_id) {
            Some(mut row) => {
                row.audit.created_at = at;
                true
            }
            None => false,
        }
    }

    /// Current row regardless of soft delete, bypassing counters
    pub fn snapshot(&self, job_id: JobId) -> Option<TransferJob> {
        self.rows
            .iter()
            .find(|r| r.job_id == job_id)
            .map(|r| r.value().clone())
    }

    fn fails(&self) -> bool {
        self.fail_writes.load(Ordering::SeqCst)
    }

    fn compare(a: &TransferJob, b: &TransferJob, column: SortColumn) -> CmpOrdering {
        match column {
            SortColumn::Id => a.id.cmp(&b.id),
            SortColumn::JobId => a.job_id.cmp(&b.job_id),
            SortColumn::ApiKey => a.api_key.cmp(&b.api_key),
            SortColumn::Status => a.status.as_str().cmp(b.status.as_str()),
            SortColumn::CreatedAt => a.audit.created_at.cmp(&b.audit.created_at),
            SortColumn::UpdatedAt => a.audit.updated_at.cmp(&b.audit.updated_at),
        }
    }

    fn matching(&self, filter: &JobFilter) -> Vec<TransferJob> {
        self.rows
            .iter()
            .filter(|r| filter.matches(r.value()))
            .map(|r| r.value().clone())
            .collect()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: NewTransferJob) -> Result<TransferJob, TransferError> {
        if self.fails() {
            return Err(TransferError::StorageInsert("memory store write disabled".into()));
        }
        if self.rows.iter().any(|r| r.job_id == job.job_id) {
            return Err(TransferError::StorageInsert(format!(
                "duplicate job_id {}",
                job.job_id
            )));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let stored = TransferJob {
            id,
            job_id: job.job_id,
            api_key: job.api_key,
            payload: job.payload,
            status: job.status,
            audit: AuditInfo::new(job.created_by, Utc::now()),
        };
        self.rows.insert(id, stored.clone());
        Ok(stored)
    }

    async fn update(
        &self,
        job: &TransferJob,
        updated_by: i64,
        expected: Option<JobStatus>,
    ) -> Result<Option<TransferJob>, TransferError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if self.fails() {
            return Err(TransferError::StorageUpdate("memory store write disabled".into()));
        }
        // Shard lock held for the check-and-set
        let Some(mut row) = self.rows.get_mut(&job.id) else {
            return Ok(None);
        };
        if !row.audit.is_active() || expected.is_some_and(|s| row.status != s) {
            return Ok(None);
        }
        row.payload = job.payload.clone();
        row.status = job.status;
        row.audit.updated_by = updated_by;
        row.audit.updated_at = Utc::now();
        Ok(Some(row.value().clone()))
    }

    async fn settle(
        &self,
        job: &TransferJob,
        status: JobStatus,
        updated_by: i64,
    ) -> Result<Option<TransferJob>, TransferError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if self.fails() {
            return Err(TransferError::StorageUpdate("memory store write disabled".into()));
        }
        let Some(mut row) = self.rows.get_mut(&job.id) else {
            return Ok(None);
        };
        if !row.audit.is_active()
            || row.status != JobStatus::Pending
            || row.audit.updated_at != job.audit.updated_at
        {
            return Ok(None);
        }
        row.status = status;
        row.audit.updated_by = updated_by;
        row.audit.updated_at = Utc::now();
        Ok(Some(row.value().clone()))
    }

    async fn delete(
        &self,
        job: &TransferJob,
        deleted_by: i64,
        hard: bool,
    ) -> Result<bool, TransferError> {
        if self.fails() {
            return Err(TransferError::StorageDelete("memory store write disabled".into()));
        }
        if hard {
            return Ok(self.rows.remove(&job.id).is_some());
        }
        let Some(mut row) = self.rows.get_mut(&job.id) else {
            return Ok(false);
        };
        if !row.audit.is_active() {
            return Ok(false);
        }
        let now = Utc::now();
        row.audit.deleted_by = Some(deleted_by);
        row.audit.deleted_at = Some(now);
        row.audit.updated_by = deleted_by;
        row.audit.updated_at = now;
        Ok(true)
    }

    async fn find_one(&self, filter: &JobFilter) -> Result<TransferJob, TransferError> {
        self.find_one_calls.fetch_add(1, Ordering::SeqCst);
        self.matching(filter)
            .into_iter()
            .min_by_key(|j| j.id)
            .ok_or_else(|| TransferError::NotFound("transfer job not found".into()))
    }

    async fn count(&self, filter: &JobFilter) -> Result<i64, TransferError> {
        self.count_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.matching(filter).len() as i64)
    }

    async fn find_many(
        &self,
        filter: &JobFilter,
        order: &[OrderBy],
        offset: i64,
        limit: i64,
    ) -> Result<Vec<TransferJob>, TransferError> {
        self.find_many_calls.fetch_add(1, Ordering::SeqCst);
        let mut rows = self.matching(filter);
        rows.sort_by(|a, b| {
            order
                .iter()
                .map(|t| {
                    let ord = Self::compare(a, b, t.column);
                    if t.descending { ord.reverse() } else { ord }
                })
                .find(|o| o.is_ne())
                .unwrap_or_else(|| a.id.cmp(&b.id))
        });
        Ok(rows
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }
}
