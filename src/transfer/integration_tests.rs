//! End-to-end flows over in-memory backends
//!
//! Submit, the bus consumer, Correlate and the Reconcile sweep wired together
//! the way the binary wires them, with the provider mocked.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use crate::bus::{Consumer, MessageSource};
use crate::cache::CacheControl;
use crate::config::SweepConfig;
use crate::scheduler::PendingTransferSweep;
use crate::transfer::consumer::{CommitPolicy, TransferMessageHandler};
use crate::transfer::coordinator::tests::{Fixture, fixture, later, pending_query, request};
use crate::transfer::filter::{JobFilter, JobQuery};
use crate::transfer::state::JobStatus;
use crate::transfer::types::JobId;

/// Run a consumer over the fixture's broker until `done` holds (or ~2s pass)
async fn consume_until(f: &Fixture, policy: CommitPolicy, done: impl Fn() -> bool) {
    let mut consumer = Consumer::new(f.broker.clone() as Arc<dyn MessageSource>, false)
        .with_error_backoff(Duration::from_millis(10));
    consumer.register(
        f.coordinator.topic(),
        Arc::new(TransferMessageHandler::new(f.coordinator.clone(), policy)),
    );

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(async move { consumer.serve(rx).await });
    for _ in 0..200 {
        if done() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
}

fn provider_id_of(f: &Fixture, job_id: JobId) -> Option<String> {
    f.store
        .snapshot(job_id)
        .and_then(|j| j.provider_id().map(str::to_string))
}

// ============================================================================
// Happy Path
// ============================================================================

/// Submit -> Correlate -> provider settles -> sweep -> cached read
#[tokio::test]
async fn test_full_lifecycle() {
    let f = fixture();

    let job = f.coordinator.transfer("dev-key", request()).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.payload["amount"], 100000.0);
    assert_eq!(job.payload["source_bank_id"], 1);
    assert_eq!(job.payload["destination_bank_id"], 2);

    f.coordinator.create(job.job_id, &request()).await.unwrap();
    assert_eq!(provider_id_of(&f, job.job_id).as_deref(), Some("ext-1"));

    f.provider.set_status("ext-1", "success");
    let report = f
        .coordinator
        .process_pending_at(&pending_query(), later())
        .await
        .unwrap();
    assert_eq!(report.succeeded, 1);

    // The sweep's write refreshed the cache entry
    let reads = f.store.find_one_calls();
    let fetched = f
        .coordinator
        .get_by_job_id(CacheControl::Default, job.job_id)
        .await
        .unwrap();
    assert_eq!(fetched.status, JobStatus::Success);
    assert_eq!(fetched.provider_id(), Some("ext-1"));
    assert_eq!(f.store.find_one_calls(), reads);
    assert!(!f.cache.is_empty());
}

#[tokio::test]
async fn test_consumer_correlates_published_job() {
    let f = fixture();
    let job = f.coordinator.transfer("dev-key", request()).await.unwrap();

    let job_id = job.job_id;
    consume_until(&f, CommitPolicy::OnSuccess, || {
        provider_id_of(&f, job_id).is_some()
    })
    .await;

    assert_eq!(provider_id_of(&f, job_id).as_deref(), Some("ext-1"));
    assert_eq!(f.broker.committed_count("transfer"), 1);
    assert!(f.broker.is_closed());
}

#[tokio::test]
async fn test_listing_is_served_from_cache_until_revalidated() {
    let f = fixture();
    for _ in 0..3 {
        f.coordinator.transfer("dev-key", request()).await.unwrap();
    }
    let query = JobQuery::new(JobFilter::default())
        .with_limit(2)
        .with_order_by("id desc");

    let (items, page) = f
        .coordinator
        .get_by_param(CacheControl::Default, &query)
        .await
        .unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(page.total_elements, 3);
    assert_eq!(page.total_pages, 2);
    assert!(items[0].id > items[1].id);

    let calls = f.store.find_many_calls();
    f.coordinator.transfer("dev-key", request()).await.unwrap();

    let (_, cached) = f
        .coordinator
        .get_by_param(CacheControl::Default, &query)
        .await
        .unwrap();
    assert_eq!(cached.total_elements, 3);
    assert_eq!(f.store.find_many_calls(), calls);

    let (_, fresh) = f
        .coordinator
        .get_by_param(CacheControl::MustRevalidate, &query)
        .await
        .unwrap();
    assert_eq!(fresh.total_elements, 4);
}

// ============================================================================
// Failure Paths
// ============================================================================

/// Provider down at Correlate time: the message stays uncommitted, comes back
/// after a restart and correlates once the provider recovers
#[tokio::test]
async fn test_uncommitted_message_is_redelivered() {
    let f = fixture();
    let job = f.coordinator.transfer("dev-key", request()).await.unwrap();
    f.provider.set_fail_create(true);

    consume_until(&f, CommitPolicy::OnSuccess, || f.provider.create_count() >= 1).await;
    assert_eq!(f.broker.committed_count("transfer"), 0);
    assert!(provider_id_of(&f, job.job_id).is_none());

    f.provider.set_fail_create(false);
    f.broker.reset_delivery();
    let job_id = job.job_id;
    consume_until(&f, CommitPolicy::OnSuccess, || {
        provider_id_of(&f, job_id).is_some()
    })
    .await;

    // The failed attempt consumed ext-1
    assert_eq!(provider_id_of(&f, job_id).as_deref(), Some("ext-2"));
    assert_eq!(f.broker.committed_count("transfer"), 1);
}

/// Redelivery of an already-correlated job never creates a second transfer
#[tokio::test]
async fn test_redelivered_correlated_job_is_skipped() {
    let f = fixture();
    let job = f.coordinator.transfer("dev-key", request()).await.unwrap();
    f.coordinator.create(job.job_id, &request()).await.unwrap();

    consume_until(&f, CommitPolicy::OnSuccess, || {
        f.broker.committed_count("transfer") == 1
    })
    .await;

    assert_eq!(f.provider.create_count(), 1);
    assert_eq!(provider_id_of(&f, job.job_id).as_deref(), Some("ext-1"));
}

/// A job the provider never settles is failed once its window closes, and
/// stays failed even if the provider reports success afterwards
#[tokio::test]
async fn test_timeout_is_final() {
    let f = fixture();
    let job = f.coordinator.transfer("dev-key", request()).await.unwrap();
    f.coordinator.create(job.job_id, &request()).await.unwrap();
    f.store
        .set_created_at(job.job_id, Utc::now() - chrono::Duration::hours(2));

    let report = f
        .coordinator
        .process_pending(&pending_query())
        .await
        .unwrap();
    assert_eq!(report.timed_out, 1);

    f.provider.set_status("ext-1", "success");
    let report = f
        .coordinator
        .process_pending(&pending_query())
        .await
        .unwrap();
    assert_eq!(report.scanned, 0);

    let fetched = f
        .coordinator
        .get_by_job_id(CacheControl::MustRevalidate, job.job_id)
        .await
        .unwrap();
    assert_eq!(fetched.status, JobStatus::Failed);
}

/// A sweep racing the consumer leaves young jobs alone
#[tokio::test]
async fn test_sweep_skips_job_awaiting_correlation() {
    let f = fixture();
    let job = f.coordinator.transfer("dev-key", request()).await.unwrap();

    let report = f
        .coordinator
        .process_pending(&pending_query())
        .await
        .unwrap();
    assert_eq!(report.too_young, 1);
    assert_eq!(f.provider.status_count(), 0);

    f.coordinator.create(job.job_id, &request()).await.unwrap();
    f.provider.set_status("ext-1", "failed");
    let report = f
        .coordinator
        .process_pending_at(&pending_query(), later())
        .await
        .unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(f.store.snapshot(job.job_id).unwrap().status, JobStatus::Failed);
}

/// One scheduled pass settles every pending job in the window, however many
/// batches it takes
#[tokio::test]
async fn test_scheduled_sweep_covers_more_jobs_than_one_batch() {
    let f = fixture();
    let mut jobs = Vec::new();
    for _ in 0..5 {
        let job = f.coordinator.transfer("dev-key", request()).await.unwrap();
        f.store
            .set_created_at(job.job_id, Utc::now() - chrono::Duration::minutes(2));
        jobs.push(job);
    }
    consume_until(&f, CommitPolicy::Always, || {
        jobs.iter().all(|j| provider_id_of(&f, j.job_id).is_some())
    })
    .await;
    for n in 1..=5 {
        f.provider.set_status(&format!("ext-{}", n), "success");
    }

    let sweep = PendingTransferSweep::new(
        f.coordinator.clone(),
        SweepConfig {
            limit: 2,
            ..Default::default()
        },
    );
    let report = sweep.run_once().await.unwrap();
    assert_eq!(report.scanned, 5);
    assert_eq!(report.succeeded, 5);
    for job in &jobs {
        assert_eq!(f.store.snapshot(job.job_id).unwrap().status, JobStatus::Success);
    }
}

/// A sweep that read a job before its provider id landed neither fails it nor
/// erases the id; the next pass settles it from the provider
#[tokio::test]
async fn test_sweep_racing_correlate_keeps_provider_id() {
    let f = fixture();
    let job = f.coordinator.transfer("dev-key", request()).await.unwrap();
    let stale = f.store.snapshot(job.job_id).unwrap();

    consume_until(&f, CommitPolicy::Always, || {
        provider_id_of(&f, job.job_id).is_some()
    })
    .await;

    // Sweep's write based on the pre-correlation read
    let lost = f
        .coordinator
        .repo()
        .settle(&stale, JobStatus::Failed, 0)
        .await
        .unwrap();
    assert!(lost.is_none());
    assert_eq!(provider_id_of(&f, job.job_id).as_deref(), Some("ext-1"));

    f.provider.set_status("ext-1", "failed");
    let report = f
        .coordinator
        .process_pending_at(&pending_query(), later())
        .await
        .unwrap();
    assert_eq!(report.failed, 1);

    let fetched = f
        .coordinator
        .get_by_job_id(CacheControl::MustRevalidate, job.job_id)
        .await
        .unwrap();
    assert_eq!(fetched.status, JobStatus::Failed);
    assert_eq!(fetched.provider_id(), Some("ext-1"));
}
