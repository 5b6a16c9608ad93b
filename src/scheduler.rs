//! Scheduler
//!
//! Named fixed-interval tasks. Stopping the engine prevents future ticks; a
//! tick that is already running finishes first.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Days, NaiveTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::config::SweepConfig;
use crate::transfer::coordinator::{SweepReport, TransferCoordinator};
use crate::transfer::error::TransferError;
use crate::transfer::filter::{JobFilter, JobQuery};

pub struct SchedulerEngine {
    stop: watch::Sender<bool>,
    tasks: Mutex<JoinSet<()>>,
}

impl Default for SchedulerEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerEngine {
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            stop,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Run `job` every `every`, first run one interval from now
    ///
    /// Ticks never overlap: a slow run delays the next one.
    pub fn schedule<F, Fut>(&self, name: impl Into<String>, every: Duration, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.into();
        let mut stop = self.stop.subscribe();
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());

        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // interval() fires immediately
            ticker.tick().await;
            info!(task = %name, every_secs = every.as_secs_f64(), "Scheduled task started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        debug!(task = %name, "Tick");
                        job().await;
                    }
                    changed = stop.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
                if *stop.borrow() {
                    break;
                }
            }
            info!(task = %name, "Scheduled task stopped");
        });
    }

    /// Stop all tasks and wait for in-flight ticks to finish
    pub async fn close(&self) {
        let _ = self.stop.send(true);
        let mut tasks = {
            let mut guard = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::take(&mut *guard)
        };
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "Scheduled task panicked");
            }
        }
    }
}

/// Periodic reconciliation of pending transfer jobs
pub struct PendingTransferSweep {
    coordinator: Arc<TransferCoordinator>,
    config: SweepConfig,
}

impl PendingTransferSweep {
    pub fn new(coordinator: Arc<TransferCoordinator>, config: SweepConfig) -> Self {
        Self {
            coordinator,
            config,
        }
    }

    /// Pending jobs created in `[start of day - lookback, start of day + 1 day)`
    ///
    /// `limit` is the batch size; a pass walks every batch of the window.
    pub fn query_at(&self, now: DateTime<Utc>) -> JobQuery {
        let today = now.date_naive().and_time(NaiveTime::MIN).and_utc();
        let lookback = Days::new(self.config.lookback_days.max(0) as u64);
        let from = today.checked_sub_days(lookback).unwrap_or(today);
        let to = today.checked_add_days(Days::new(1)).unwrap_or(now);

        JobQuery::new(JobFilter::pending_between(from, to)).with_limit(self.config.limit)
    }

    pub async fn run_once(&self) -> Result<SweepReport, TransferError> {
        let now = Utc::now();
        self.coordinator
            .process_pending_at(&self.query_at(now), now)
            .await
    }

    pub fn register(self: Arc<Self>, engine: &SchedulerEngine) {
        let every = Duration::from_secs(self.config.interval_secs.max(1));
        let name = self.config.name.clone();
        engine.schedule(name, every, move || {
            let sweep = self.clone();
            async move {
                if let Err(e) = sweep.run_once().await {
                    error!(task = %sweep.config.name, error = %e, "Sweep failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::coordinator::tests::{fixture, request};
    use crate::transfer::state::JobStatus;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_schedule_ticks_until_closed() {
        let engine = SchedulerEngine::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        engine.schedule("count", Duration::from_millis(10), move || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(80)).await;
        engine.close().await;
        let seen = count.load(Ordering::SeqCst);
        assert!(seen >= 2, "ticks: {}", seen);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(count.load(Ordering::SeqCst), seen);
    }

    #[tokio::test]
    async fn test_close_waits_for_in_flight_tick() {
        let engine = SchedulerEngine::new();
        let done = Arc::new(AtomicUsize::new(0));
        let d = done.clone();
        engine.schedule("slow", Duration::from_millis(10), move || {
            let d = d.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(60)).await;
                d.fetch_add(1, Ordering::SeqCst);
            }
        });

        // Inside the first tick
        tokio::time::sleep(Duration::from_millis(30)).await;
        engine.close().await;
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_query_window() {
        let f = fixture();
        let sweep = PendingTransferSweep::new(
            f.coordinator.clone(),
            SweepConfig {
                lookback_days: 0,
                limit: 25,
                ..Default::default()
            },
        );
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 15, 30, 0).unwrap();
        let q = sweep.query_at(now);

        assert_eq!(q.filter.status, Some(JobStatus::Pending));
        assert_eq!(
            q.filter.created_at_gte,
            Some(Utc.with_ymd_and_hms(2026, 3, 10, 0, 0, 0).unwrap())
        );
        assert_eq!(
            q.filter.created_at_lt,
            Some(Utc.with_ymd_and_hms(2026, 3, 11, 0, 0, 0).unwrap())
        );
        assert_eq!(q.limit, 25);

        let sweep = PendingTransferSweep::new(f.coordinator.clone(), SweepConfig::default());
        assert_eq!(
            sweep.query_at(now).filter.created_at_gte,
            Some(Utc.with_ymd_and_hms(2026, 3, 9, 0, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn test_registered_sweep_reconciles() {
        let f = fixture();
        let job = f.coordinator.transfer("dev-key", request()).await.unwrap();
        // Old enough for the minimum-age guard; the default window reaches back a day
        f.store
            .set_created_at(job.job_id, Utc::now() - chrono::Duration::minutes(2));

        let sweep = Arc::new(PendingTransferSweep::new(
            f.coordinator.clone(),
            SweepConfig {
                interval_secs: 1,
                ..Default::default()
            },
        ));
        let engine = SchedulerEngine::new();
        sweep.clone().register(&engine);

        tokio::time::sleep(Duration::from_millis(1300)).await;
        engine.close().await;
        assert_eq!(f.store.snapshot(job.job_id).unwrap().status, JobStatus::Failed);
    }
}
