//! Job Repository
//!
//! [`JobStore`] behind the cache-aside layer. Writes go to the store first and
//! then refresh the single-row cache entry keyed by `job_id`; reads honour the
//! caller's [`CacheControl`].

use std::sync::Arc;

use tracing::{debug, warn};

use super::db::JobStore;
use super::error::TransferError;
use super::filter::{JobFilter, JobQuery, OrderBy, Pagination, SortColumn};
use super::state::JobStatus;
use super::types::{NewTransferJob, TransferJob};
use crate::cache::{CacheAside, CacheControl, Source};

pub struct JobRepository {
    store: Arc<dyn JobStore>,
    cache: CacheAside,
    page_limit: i64,
}

impl JobRepository {
    pub fn new(store: Arc<dyn JobStore>, cache: CacheAside, page_limit: i64) -> Self {
        Self {
            store,
            cache,
            page_limit: page_limit.max(1),
        }
    }

    pub fn page_limit(&self) -> i64 {
        self.page_limit
    }

    pub async fn insert(&self, job: NewTransferJob) -> Result<TransferJob, TransferError> {
        let stored = self.store.insert(job).await?;
        self.refresh(&stored).await;
        Ok(stored)
    }

    /// Unconditional write of payload and status
    pub async fn update(
        &self,
        job: &TransferJob,
        updated_by: i64,
    ) -> Result<TransferJob, TransferError> {
        let updated = self
            .store
            .update(job, updated_by, None)
            .await?
            .ok_or_else(|| TransferError::NotFound(format!("transfer job {}", job.job_id)))?;
        self.refresh(&updated).await;
        Ok(updated)
    }

    /// Write only while the stored row is still `pending`
    ///
    /// `Ok(None)` means another writer got there first.
    pub async fn update_if_pending(
        &self,
        job: &TransferJob,
        updated_by: i64,
    ) -> Result<Option<TransferJob>, TransferError> {
        let updated = self
            .store
            .update(job, updated_by, Some(JobStatus::Pending))
            .await?;
        if let Some(updated) = &updated {
            self.refresh(updated).await;
        }
        Ok(updated)
    }

    /// Status-only move out of pending, guarded on `job` still being current
    ///
    /// `Ok(None)` means the row was written or resolved since `job` was read.
    pub async fn settle(
        &self,
        job: &TransferJob,
        status: JobStatus,
        updated_by: i64,
    ) -> Result<Option<TransferJob>, TransferError> {
        let settled = self.store.settle(job, status, updated_by).await?;
        if let Some(settled) = &settled {
            self.refresh(settled).await;
        }
        Ok(settled)
    }

    /// Next `limit` rows matching `filter` with `id > after`, in id order
    ///
    /// Reads the store directly. Rows that leave the filter while a scan is in
    /// progress cannot shift later batches, unlike offset paging.
    pub async fn scan(
        &self,
        filter: &JobFilter,
        after: Option<i64>,
        limit: i64,
    ) -> Result<Vec<TransferJob>, TransferError> {
        let filter = JobFilter {
            id_gt: after.max(filter.id_gt),
            ..filter.clone()
        };
        self.store
            .find_many(&filter, &[OrderBy::asc(SortColumn::Id)], 0, limit.max(1))
            .await
    }

    pub async fn delete(
        &self,
        job: &TransferJob,
        deleted_by: i64,
        hard: bool,
    ) -> Result<bool, TransferError> {
        let deleted = self.store.delete(job, deleted_by, hard).await?;
        let key = JobFilter::by_job_id(job.job_id).cache_key()?;
        if let Err(e) = self.cache.invalidate(&key).await {
            warn!(job_id = %job.job_id, error = %e, "Cache invalidation failed after delete");
        }
        Ok(deleted)
    }

    /// Single row matching `filter`
    pub async fn get_single(
        &self,
        control: CacheControl,
        filter: &JobFilter,
    ) -> Result<TransferJob, TransferError> {
        let key = filter.cache_key()?;
        let fetched = self
            .cache
            .fetch(&key, control, || self.store.find_one(filter))
            .await?;
        if let Some(e) = fetched.cache_error {
            warn!(key = %key, error = %e, "Cache refresh failed after store read");
        }
        Ok(fetched.value)
    }

    /// One page of rows plus pagination metadata
    ///
    /// Rows and metadata live under separate keys; both must be cached for the
    /// page to be served from cache. Writes never invalidate page entries:
    /// their keys are derived from arbitrary queries and cannot be enumerated,
    /// so a `Default` listing may lag writes by up to the cache TTL.
    /// `MustRevalidate` always reads the store.
    pub async fn get_page(
        &self,
        control: CacheControl,
        query: &JobQuery,
    ) -> Result<(Vec<TransferJob>, Pagination), TransferError> {
        let query = query.clone().normalized(self.page_limit);
        let order = query.order_terms()?;
        let data_key = query.data_cache_key()?;
        let meta_key = query.meta_cache_key()?;

        if control == CacheControl::Default {
            let rows = self.cache.read::<Vec<TransferJob>>(&data_key).await?;
            let meta = self.cache.read::<Pagination>(&meta_key).await?;
            if let (Some(rows), Some(meta)) = (rows, meta) {
                debug!(key = %data_key, source = ?Source::Cache, "page served");
                return Ok((rows, meta));
            }
        }

        let total = self.store.count(&query.filter).await?;
        let rows = self
            .store
            .find_many(&query.filter, &order, query.offset(), query.limit)
            .await?;
        let meta = Pagination::new(&query, rows.len(), total);

        if let Err(e) = self.cache.write(&data_key, &rows).await {
            warn!(key = %data_key, error = %e, "Cache refresh failed after store read");
        }
        if let Err(e) = self.cache.write(&meta_key, &meta).await {
            warn!(key = %meta_key, error = %e, "Cache refresh failed after store read");
        }
        Ok((rows, meta))
    }

    /// Rewrite the by-`job_id` cache entry after a successful store write
    async fn refresh(&self, job: &TransferJob) {
        let key = match JobFilter::by_job_id(job.job_id).cache_key() {
            Ok(key) => key,
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "Cannot derive cache key");
                return;
            }
        };
        if let Err(e) = self.cache.write(&key, job).await {
            warn!(job_id = %job.job_id, error = %e, "Cache refresh failed after write");
        }
    }
}
