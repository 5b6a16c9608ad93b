//! Transfer Coordinator
//!
//! Drives a transfer job through its lifecycle:
//!
//! - **Submit** ([`TransferCoordinator::transfer`]): authenticate, persist a
//!   pending job, publish it for asynchronous processing.
//! - **Correlate** ([`TransferCoordinator::create`]): create the transfer at the
//!   provider and record the provider's envelope on the job.
//! - **Reconcile** ([`TransferCoordinator::process_pending`]): poll the provider
//!   for pending jobs and move them to a terminal status, failing jobs that
//!   never got a provider id or have outlived their active window.
//!
//! Every status write is conditional on the stored row still being pending, so
//! the consumer and the sweep can run concurrently without overwriting each
//! other's terminal decisions. The sweep's terminal writes touch only the
//! status and additionally require the row to be unchanged since it was read,
//! so a provider id recorded mid-pass is never erased.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use super::error::TransferError;
use super::filter::{JobFilter, JobQuery, Pagination};
use super::provider::PaymentProvider;
use super::repository::JobRepository;
use super::state::JobStatus;
use super::types::{CreateTransfer, JobId, NewTransferJob, TransferJob};
use crate::account::AccountDirectory;
use crate::bus::Publisher;
use crate::cache::CacheControl;
use crate::config::TransferConfig;

/// Audit actor for writes made by the consumer and the sweep
pub const SYSTEM_ACTOR: i64 = 0;

/// Result of a Correlate call
#[derive(Debug, Clone, PartialEq)]
pub enum CorrelateOutcome {
    /// Provider envelope stored on the job
    Recorded(TransferJob),
    /// Job already success/failed; provider not called
    AlreadyTerminal(JobStatus),
    /// Job already carries a provider id; provider not called
    AlreadyCorrelated,
    /// Provider called, but the job left pending before the write landed
    Superseded,
}

/// What the sweep did with one job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Succeeded,
    Failed,
    /// No provider id was ever recorded
    FailedUncorrelated,
    TimedOut,
    StillPending,
    /// Younger than the minimum age; left for a later tick
    TooYoung,
    /// Another writer already moved the job out of pending
    Superseded,
}

/// Per-tick tally
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub timed_out: usize,
    pub still_pending: usize,
    pub too_young: usize,
    pub superseded: usize,
    pub errors: usize,
}

impl SweepReport {
    fn record(&mut self, outcome: ReconcileOutcome) {
        match outcome {
            ReconcileOutcome::Succeeded => self.succeeded += 1,
            ReconcileOutcome::Failed | ReconcileOutcome::FailedUncorrelated => self.failed += 1,
            ReconcileOutcome::TimedOut => self.timed_out += 1,
            ReconcileOutcome::StillPending => self.still_pending += 1,
            ReconcileOutcome::TooYoung => self.too_young += 1,
            ReconcileOutcome::Superseded => self.superseded += 1,
        }
    }
}

pub struct TransferCoordinator {
    repo: Arc<JobRepository>,
    accounts: Arc<AccountDirectory>,
    publisher: Arc<dyn Publisher>,
    provider: Arc<dyn PaymentProvider>,
    topic: String,
    job_active_duration: Duration,
    min_job_age: Duration,
}

impl TransferCoordinator {
    pub fn new(
        repo: Arc<JobRepository>,
        accounts: Arc<AccountDirectory>,
        publisher: Arc<dyn Publisher>,
        provider: Arc<dyn PaymentProvider>,
        config: &TransferConfig,
    ) -> Self {
        Self {
            repo,
            accounts,
            publisher,
            provider,
            topic: config.topic.clone(),
            job_active_duration: Duration::seconds(config.job_active_duration_secs as i64),
            min_job_age: Duration::seconds(config.min_job_age_secs as i64),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn repo(&self) -> &Arc<JobRepository> {
        &self.repo
    }

    // ========================================================================
    // Submit
    // ========================================================================

    /// Accept a transfer request
    ///
    /// The job is persisted as pending before this returns. If the publish is
    /// not acknowledged the job is failed and a `Dispatch` error is returned.
    pub async fn transfer(
        &self,
        api_key: &str,
        request: CreateTransfer,
    ) -> Result<TransferJob, TransferError> {
        request.validate()?;
        let account = self.accounts.get_account_by_api_key(api_key).await?;

        let job = self
            .repo
            .insert(NewTransferJob {
                job_id: JobId::new(),
                api_key: account.api_key.clone(),
                payload: serde_json::to_value(&request)?,
                status: JobStatus::Pending,
                created_by: account.id,
            })
            .await?;

        let value = serde_json::to_string(&request)?;
        match self
            .publisher
            .publish(&self.topic, &job.job_id.message_key(), &value)
            .await
        {
            Ok(partition) => {
                info!(job_id = %job.job_id, account_id = account.id, partition, "Transfer job accepted");
                Ok(job)
            }
            Err(e) => {
                error!(job_id = %job.job_id, error = %e, "Publish failed, failing job");
                if let Err(mark_err) = self
                    .repo
                    .settle(&job, JobStatus::Failed, account.id)
                    .await
                {
                    error!(job_id = %job.job_id, error = %mark_err, "Could not fail undispatched job");
                }
                Err(e.into())
            }
        }
    }

    // ========================================================================
    // Correlate
    // ========================================================================

    /// Create the provider transfer for `job_id` and store its envelope
    ///
    /// Reads the job bypassing the cache. Skips the provider call when the job
    /// is terminal or already correlated, so redelivered messages are harmless.
    pub async fn create(
        &self,
        job_id: JobId,
        request: &CreateTransfer,
    ) -> Result<CorrelateOutcome, TransferError> {
        let mut job = self
            .repo
            .get_single(CacheControl::MustRevalidate, &JobFilter::by_job_id(job_id))
            .await?;

        if job.status.is_terminal() {
            debug!(job_id = %job_id, status = %job.status, "Job already terminal");
            return Ok(CorrelateOutcome::AlreadyTerminal(job.status));
        }
        if job.provider_id().is_some() {
            debug!(job_id = %job_id, "Job already correlated");
            return Ok(CorrelateOutcome::AlreadyCorrelated);
        }

        let created = self
            .provider
            .create_transfer(&request.to_provider_request())
            .await?;
        job.payload = serde_json::to_value(&created)?;

        match self.repo.update_if_pending(&job, SYSTEM_ACTOR).await? {
            Some(updated) => Ok(CorrelateOutcome::Recorded(updated)),
            None => {
                warn!(
                    job_id = %job_id,
                    provider_id = %created.id,
                    "Job left pending before the provider envelope was stored"
                );
                Ok(CorrelateOutcome::Superseded)
            }
        }
    }

    // ========================================================================
    // Reconcile
    // ========================================================================

    pub async fn process_pending(&self, query: &JobQuery) -> Result<SweepReport, TransferError> {
        self.process_pending_at(query, Utc::now()).await
    }

    /// One reconciliation pass with an explicit clock
    ///
    /// Walks every job matching `query.filter` in id order, `query.limit` rows
    /// at a time; `order_by` and `page` are ignored. Jobs are handled one after
    /// another. A failure on one job is logged and counted; the rest still run.
    pub async fn process_pending_at(
        &self,
        query: &JobQuery,
        now: DateTime<Utc>,
    ) -> Result<SweepReport, TransferError> {
        let batch = if query.limit > 0 {
            query.limit
        } else {
            self.repo.page_limit()
        };

        let mut report = SweepReport::default();
        let mut after = None;
        loop {
            let jobs = self.repo.scan(&query.filter, after, batch).await?;
            report.scanned += jobs.len();
            for job in &jobs {
                match self.reconcile(job, now).await {
                    Ok(outcome) => {
                        debug!(job_id = %job.job_id, outcome = ?outcome, "Reconciled");
                        report.record(outcome);
                    }
                    Err(e) => {
                        error!(job_id = %job.job_id, error = %e, "Reconcile failed");
                        report.errors += 1;
                    }
                }
            }
            match jobs.last() {
                Some(last) if jobs.len() as i64 >= batch => after = Some(last.id),
                _ => break,
            }
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                succeeded = report.succeeded,
                failed = report.failed,
                timed_out = report.timed_out,
                still_pending = report.still_pending,
                errors = report.errors,
                "Reconcile pass finished"
            );
        }
        Ok(report)
    }

    async fn reconcile(
        &self,
        job: &TransferJob,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, TransferError> {
        if job.status.is_terminal() {
            return Ok(ReconcileOutcome::Superseded);
        }
        let created_at = job.audit.created_at;
        if created_at > now - self.min_job_age {
            return Ok(ReconcileOutcome::TooYoung);
        }
        let expired = created_at < now - self.job_active_duration;

        let Some(provider_id) = job.provider_id() else {
            return self
                .mark(job, JobStatus::Failed, ReconcileOutcome::FailedUncorrelated)
                .await;
        };

        let remote = match self.provider.get_transfer_status(provider_id).await {
            Ok(remote) => remote,
            Err(e) if expired => {
                warn!(job_id = %job.job_id, error = %e, "Status poll failed on expired job");
                return self
                    .mark(job, JobStatus::Failed, ReconcileOutcome::TimedOut)
                    .await;
            }
            Err(e) => return Err(e),
        };

        match remote.job_status() {
            Some(JobStatus::Success) => {
                self.mark(job, JobStatus::Success, ReconcileOutcome::Succeeded)
                    .await
            }
            Some(JobStatus::Failed) => {
                self.mark(job, JobStatus::Failed, ReconcileOutcome::Failed)
                    .await
            }
            _ if expired => {
                self.mark(job, JobStatus::Failed, ReconcileOutcome::TimedOut)
                    .await
            }
            _ => Ok(ReconcileOutcome::StillPending),
        }
    }

    async fn mark(
        &self,
        job: &TransferJob,
        status: JobStatus,
        outcome: ReconcileOutcome,
    ) -> Result<ReconcileOutcome, TransferError> {
        if !job.status.can_transition_to(status) {
            return Err(TransferError::InvalidStateTransition(format!(
                "{} -> {}",
                job.status, status
            )));
        }
        match self.repo.settle(job, status, SYSTEM_ACTOR).await? {
            Some(_) => {
                info!(job_id = %job.job_id, status = %status, outcome = ?outcome, "Job resolved");
                Ok(outcome)
            }
            None => {
                debug!(job_id = %job.job_id, "Job changed since it was read, left for next pass");
                Ok(ReconcileOutcome::Superseded)
            }
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn get_by_param(
        &self,
        control: CacheControl,
        query: &JobQuery,
    ) -> Result<(Vec<TransferJob>, Pagination), TransferError> {
        self.repo.get_page(control, query).await
    }

    pub async fn get_by_job_id(
        &self,
        control: CacheControl,
        job_id: JobId,
    ) -> Result<TransferJob, TransferError> {
        self.repo
            .get_single(control, &JobFilter::by_job_id(job_id))
            .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::account::{AccountDirectory, MemoryAccountStore};
    use crate::bank::BankAccounts;
    use crate::bus::MemoryBroker;
    use crate::cache::{CacheAside, MemoryCache};
    use crate::config::DevAccount;
    use crate::transfer::db::{JobStore, MemoryJobStore};
    use crate::transfer::provider::mock::MockProvider;
    use rust_decimal::Decimal;

    pub(crate) struct Fixture {
        pub store: Arc<MemoryJobStore>,
        pub cache: Arc<MemoryCache>,
        pub broker: Arc<MemoryBroker>,
        pub provider: Arc<MockProvider>,
        pub coordinator: Arc<TransferCoordinator>,
        pub banks: Arc<BankAccounts>,
    }

    pub(crate) fn fixture() -> Fixture {
        let store = Arc::new(MemoryJobStore::new());
        let cache = Arc::new(MemoryCache::new());
        let aside = CacheAside::new(cache.clone(), std::time::Duration::from_secs(300));
        let repo = Arc::new(JobRepository::new(store.clone(), aside.clone(), 10));
        let accounts = Arc::new(AccountDirectory::new(
            Arc::new(MemoryAccountStore::from_dev_accounts(&[DevAccount {
                id: 42,
                name: "demo".into(),
                api_key: "dev-key".into(),
            }])),
            aside.clone(),
        ));
        let broker = Arc::new(MemoryBroker::new(2));
        let provider = Arc::new(MockProvider::new());
        let banks = Arc::new(BankAccounts::new(accounts.clone(), provider.clone(), aside));
        let coordinator = Arc::new(TransferCoordinator::new(
            repo,
            accounts,
            broker.clone(),
            provider.clone(),
            &TransferConfig::default(),
        ));
        Fixture {
            store,
            cache,
            broker,
            provider,
            coordinator,
            banks,
        }
    }

    pub(crate) fn request() -> CreateTransfer {
        CreateTransfer {
            source_bank_account: "1234567890".into(),
            destination_bank_account: "0987654321".into(),
            source_bank_id: 1,
            destination_bank_id: 2,
            amount: Decimal::from(100_000),
            transaction_time: Utc::now(),
        }
    }

    pub(crate) fn pending_query() -> JobQuery {
        JobQuery::new(JobFilter {
            status: Some(JobStatus::Pending),
            ..Default::default()
        })
        .with_limit(100)
        .with_order_by("created_at asc")
    }

    /// Well past the minimum age, well inside the active window
    pub(crate) fn later() -> DateTime<Utc> {
        Utc::now() + Duration::minutes(5)
    }

    #[tokio::test]
    async fn test_transfer_persists_pending_then_publishes() {
        let f = fixture();
        let job = f.coordinator.transfer("dev-key", request()).await.unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.audit.created_by, 42);
        assert_eq!(job.payload["source_bank_id"], 1);
        assert_eq!(f.store.snapshot(job.job_id).unwrap().status, JobStatus::Pending);

        let published = f.broker.published("transfer");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, job.job_id.message_key());
        let sent: CreateTransfer = serde_json::from_str(&published[0].1).unwrap();
        assert_eq!(sent.amount, Decimal::from(100_000));
    }

    #[tokio::test]
    async fn test_transfer_rejects_unknown_key_and_bad_request() {
        let f = fixture();
        assert!(matches!(
            f.coordinator.transfer("wrong", request()).await,
            Err(TransferError::NotAuthorized(_))
        ));

        let mut bad = request();
        bad.amount = Decimal::ZERO;
        assert!(matches!(
            f.coordinator.transfer("dev-key", bad).await,
            Err(TransferError::BadRequest(_))
        ));
        assert_eq!(f.store.count(&JobFilter::default()).await.unwrap(), 0);
        assert!(f.broker.published("transfer").is_empty());
    }

    #[tokio::test]
    async fn test_transfer_storage_failure_surfaces() {
        let f = fixture();
        f.store.set_fail_writes(true);
        assert!(matches!(
            f.coordinator.transfer("dev-key", request()).await,
            Err(TransferError::StorageInsert(_))
        ));
        assert!(f.broker.published("transfer").is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_fails_job() {
        let f = fixture();
        f.broker.set_fail_publish(true);
        let res = f.coordinator.transfer("dev-key", request()).await;
        assert!(matches!(res, Err(TransferError::Dispatch(_))));

        let rows = f
            .store
            .find_many(&JobFilter::default(), &[], 0, 10)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let f = fixture();
        let job = f.coordinator.transfer("dev-key", request()).await.unwrap();

        let first = f.coordinator.create(job.job_id, &request()).await.unwrap();
        match first {
            CorrelateOutcome::Recorded(j) => assert_eq!(j.provider_id(), Some("ext-1")),
            other => panic!("unexpected: {:?}", other),
        }

        let second = f.coordinator.create(job.job_id, &request()).await.unwrap();
        assert_eq!(second, CorrelateOutcome::AlreadyCorrelated);
        assert_eq!(f.provider.create_count(), 1);
    }

    #[tokio::test]
    async fn test_create_skips_terminal_job() {
        let f = fixture();
        let job = f.coordinator.transfer("dev-key", request()).await.unwrap();
        let mut failed = job.clone();
        failed.status = JobStatus::Failed;
        f.store.update(&failed, 0, None).await.unwrap();

        let outcome = f.coordinator.create(job.job_id, &request()).await.unwrap();
        assert_eq!(outcome, CorrelateOutcome::AlreadyTerminal(JobStatus::Failed));
        assert_eq!(f.provider.create_count(), 0);
    }

    #[tokio::test]
    async fn test_create_unknown_job() {
        let f = fixture();
        assert!(matches!(
            f.coordinator.create(JobId::new(), &request()).await,
            Err(TransferError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reconcile_uncorrelated_job_fails() {
        let f = fixture();
        let job = f.coordinator.transfer("dev-key", request()).await.unwrap();

        let report = f
            .coordinator
            .process_pending_at(&pending_query(), later())
            .await
            .unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(f.store.snapshot(job.job_id).unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_reconcile_respects_min_age() {
        let f = fixture();
        let job = f.coordinator.transfer("dev-key", request()).await.unwrap();

        let report = f
            .coordinator
            .process_pending(&pending_query())
            .await
            .unwrap();
        assert_eq!(report.too_young, 1);
        assert_eq!(f.store.snapshot(job.job_id).unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_reconcile_provider_outcomes() {
        let f = fixture();
        let ok = f.coordinator.transfer("dev-key", request()).await.unwrap();
        let ko = f.coordinator.transfer("dev-key", request()).await.unwrap();
        let wait = f.coordinator.transfer("dev-key", request()).await.unwrap();
        for id in [ok.job_id, ko.job_id, wait.job_id] {
            f.coordinator.create(id, &request()).await.unwrap();
        }
        f.provider.set_status("ext-1", "success");
        f.provider.set_status("ext-2", "failed");

        let report = f
            .coordinator
            .process_pending_at(&pending_query(), later())
            .await
            .unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(report.still_pending, 1);

        assert_eq!(f.store.snapshot(ok.job_id).unwrap().status, JobStatus::Success);
        assert_eq!(f.store.snapshot(ko.job_id).unwrap().status, JobStatus::Failed);
        assert_eq!(f.store.snapshot(wait.job_id).unwrap().status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_reconcile_timeout_is_idempotent() {
        let f = fixture();
        let job = f.coordinator.transfer("dev-key", request()).await.unwrap();
        f.coordinator.create(job.job_id, &request()).await.unwrap();
        f.store
            .set_created_at(job.job_id, Utc::now() - Duration::hours(2));

        let first = f
            .coordinator
            .process_pending_at(&pending_query(), Utc::now())
            .await
            .unwrap();
        assert_eq!(first.timed_out, 1);
        assert_eq!(f.store.snapshot(job.job_id).unwrap().status, JobStatus::Failed);

        let updates = f.store.update_calls();
        let second = f
            .coordinator
            .process_pending_at(&pending_query(), Utc::now())
            .await
            .unwrap();
        assert_eq!(second.scanned, 0);
        assert_eq!(f.store.update_calls(), updates);
    }

    #[tokio::test]
    async fn test_reconcile_errors_do_not_abort_batch() {
        let f = fixture();
        let a = f.coordinator.transfer("dev-key", request()).await.unwrap();
        let b = f.coordinator.transfer("dev-key", request()).await.unwrap();
        f.coordinator.create(a.job_id, &request()).await.unwrap();
        f.provider.set_fail_status(true);

        let report = f
            .coordinator
            .process_pending_at(&pending_query(), later())
            .await
            .unwrap();
        assert_eq!(report.scanned, 2);
        assert_eq!(report.errors, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(f.store.snapshot(a.job_id).unwrap().status, JobStatus::Pending);
        assert_eq!(f.store.snapshot(b.job_id).unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_reconcile_update_failure_is_retried_next_tick() {
        let f = fixture();
        let job = f.coordinator.transfer("dev-key", request()).await.unwrap();
        f.coordinator.create(job.job_id, &request()).await.unwrap();
        f.provider.set_status("ext-1", "success");

        f.store.set_fail_writes(true);
        let report = f
            .coordinator
            .process_pending_at(&pending_query(), later())
            .await
            .unwrap();
        assert_eq!(report.errors, 1);
        assert_eq!(f.store.snapshot(job.job_id).unwrap().status, JobStatus::Pending);

        f.store.set_fail_writes(false);
        let report = f
            .coordinator
            .process_pending_at(&pending_query(), later())
            .await
            .unwrap();
        assert_eq!(report.succeeded, 1);
    }

    #[tokio::test]
    async fn test_reconcile_walks_every_batch() {
        let f = fixture();
        let mut jobs = Vec::new();
        for _ in 0..5 {
            let job = f.coordinator.transfer("dev-key", request()).await.unwrap();
            f.coordinator.create(job.job_id, &request()).await.unwrap();
            jobs.push(job);
        }
        // The first batch stays pending at the provider and must not starve the rest
        for n in 3..=5 {
            f.provider.set_status(&format!("ext-{}", n), "success");
        }

        let report = f
            .coordinator
            .process_pending_at(&pending_query().with_limit(2), later())
            .await
            .unwrap();
        assert_eq!(report.scanned, 5);
        assert_eq!(report.still_pending, 2);
        assert_eq!(report.succeeded, 3);
        for job in &jobs[2..] {
            assert_eq!(f.store.snapshot(job.job_id).unwrap().status, JobStatus::Success);
        }
    }

    #[tokio::test]
    async fn test_reconcile_stale_read_keeps_late_correlation() {
        let f = fixture();
        let job = f.coordinator.transfer("dev-key", request()).await.unwrap();
        // Sweep reads the job before the consumer records the provider id
        let stale = f.store.snapshot(job.job_id).unwrap();
        f.coordinator.create(job.job_id, &request()).await.unwrap();

        let outcome = f.coordinator.reconcile(&stale, later()).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Superseded);
        let row = f.store.snapshot(job.job_id).unwrap();
        assert_eq!(row.status, JobStatus::Pending);
        assert_eq!(row.provider_id(), Some("ext-1"));

        f.provider.set_status("ext-1", "success");
        let report = f
            .coordinator
            .process_pending_at(&pending_query(), later())
            .await
            .unwrap();
        assert_eq!(report.succeeded, 1);
        let row = f.store.snapshot(job.job_id).unwrap();
        assert_eq!(row.status, JobStatus::Success);
        assert_eq!(row.provider_id(), Some("ext-1"));
    }

    #[tokio::test]
    async fn test_expired_job_with_unreachable_provider_times_out() {
        let f = fixture();
        let job = f.coordinator.transfer("dev-key", request()).await.unwrap();
        f.coordinator.create(job.job_id, &request()).await.unwrap();
        f.provider.set_fail_status(true);
        f.store
            .set_created_at(job.job_id, Utc::now() - Duration::hours(2));

        let report = f
            .coordinator
            .process_pending_at(&pending_query(), Utc::now())
            .await
            .unwrap();
        assert_eq!(report.timed_out, 1);
    }
}
