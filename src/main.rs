//! transfer_jobs service
//!
//! ```text
//! cargo run -- --env dev
//! ```
//!
//! Starts the HTTP API, the bus consumer and the reconciliation sweep.
//! Backends fall back to memory when `postgres_url` / `redis_url` are unset.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use transfer_jobs::account::{AccountDirectory, AccountStore, MemoryAccountStore, PgAccountStore};
use transfer_jobs::api::{self, ApiState};
use transfer_jobs::bank::BankAccounts;
use transfer_jobs::bus::redis_streams::StreamsConsumerConfig;
use transfer_jobs::bus::{
    Consumer, MemoryBroker, MessageSource, Publisher, RedisStreamsBroker,
};
use transfer_jobs::cache::{CacheAside, CacheStore, MemoryCache, RedisCache};
use transfer_jobs::config::{AppConfig, BusBackend};
use transfer_jobs::db::Database;
use transfer_jobs::scheduler::{PendingTransferSweep, SchedulerEngine};
use transfer_jobs::transfer::{
    HttpPaymentClient, JobRepository, JobStore, MemoryJobStore, PgJobStore, TransferCoordinator,
    TransferMessageHandler,
};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config = AppConfig::load(&env).with_context(|| format!("loading config for '{}'", env))?;
    let _log_guard = transfer_jobs::logging::init_logging(&config);

    info!(env = %env, git = env!("GIT_HASH"), "Starting transfer_jobs");

    // ------------------------------------------------------------------
    // Storage
    // ------------------------------------------------------------------
    let (jobs, accounts): (Arc<dyn JobStore>, Arc<dyn AccountStore>) = match &config.postgres_url
    {
        Some(url) => {
            let db = Database::connect(url)
                .await
                .context("connecting to PostgreSQL")?;
            db.health_check().await.context("PostgreSQL health check")?;
            db.init_schema().await.context("initialising schema")?;
            let jobs: Arc<dyn JobStore> = Arc::new(PgJobStore::new(db.pool().clone()));
            let accounts: Arc<dyn AccountStore> = Arc::new(PgAccountStore::new(db.pool().clone()));
            (jobs, accounts)
        }
        None => {
            warn!("postgres_url not set, jobs are kept in memory");
            let jobs: Arc<dyn JobStore> = Arc::new(MemoryJobStore::new());
            let accounts: Arc<dyn AccountStore> =
                Arc::new(MemoryAccountStore::from_dev_accounts(&config.dev_accounts));
            (jobs, accounts)
        }
    };

    let cache_store: Arc<dyn CacheStore> = match &config.redis_url {
        Some(url) => Arc::new(RedisCache::connect(url).await.context("connecting to Redis")?),
        None => {
            warn!("redis_url not set, using in-memory cache");
            Arc::new(MemoryCache::new())
        }
    };
    let cache = CacheAside::new(
        cache_store,
        Duration::from_secs(config.cache.expiration_secs),
    );

    // ------------------------------------------------------------------
    // Message bus
    // ------------------------------------------------------------------
    let (publisher, source): (Arc<dyn Publisher>, Arc<dyn MessageSource>) =
        match config.bus_backend() {
            BusBackend::Redis => {
                let url = config
                    .redis_url
                    .as_deref()
                    .context("redis bus selected without redis_url")?;
                let broker = Arc::new(
                    RedisStreamsBroker::connect(
                        url,
                        config.bus.partitions,
                        StreamsConsumerConfig {
                            group: config.bus.group_id.clone(),
                            consumer: config.bus.consumer_name.clone(),
                            block_ms: config.bus.poll_block_ms as usize,
                            batch: config.bus.poll_batch,
                        },
                    )
                    .await
                    .context("connecting to Redis Streams")?,
                );
                let publisher: Arc<dyn Publisher> = broker.clone();
                let source: Arc<dyn MessageSource> = broker;
                (publisher, source)
            }
            BusBackend::Memory | BusBackend::Auto => {
                let broker = Arc::new(
                    MemoryBroker::new(config.bus.partitions)
                        .with_block(Duration::from_millis(config.bus.poll_block_ms))
                        .with_batch(config.bus.poll_batch),
                );
                let publisher: Arc<dyn Publisher> = broker.clone();
                let source: Arc<dyn MessageSource> = broker;
                (publisher, source)
            }
        };

    // ------------------------------------------------------------------
    // Coordinator
    // ------------------------------------------------------------------
    let repo = Arc::new(JobRepository::new(
        jobs,
        cache.clone(),
        config.transfer.page_limit,
    ));
    let directory = Arc::new(AccountDirectory::new(accounts, cache.clone()));
    let provider = Arc::new(HttpPaymentClient::new(&config.provider)?);
    let banks = Arc::new(BankAccounts::new(directory.clone(), provider.clone(), cache));
    let coordinator = Arc::new(TransferCoordinator::new(
        repo,
        directory,
        publisher,
        provider,
        &config.transfer,
    ));

    // ------------------------------------------------------------------
    // Consumer + scheduler
    // ------------------------------------------------------------------
    let mut consumer = Consumer::new(source, config.bus.auto_commit);
    consumer.register(
        config.transfer.topic.clone(),
        Arc::new(TransferMessageHandler::new(
            coordinator.clone(),
            config.transfer.commit_policy,
        )),
    );
    let (stop_tx, stop_rx) = watch::channel(false);
    let consumer_task = tokio::spawn(async move { consumer.serve(stop_rx).await });

    let engine = SchedulerEngine::new();
    Arc::new(PendingTransferSweep::new(
        coordinator.clone(),
        config.scheduler.get_transfer_callback.clone(),
    ))
    .register(&engine);

    // ------------------------------------------------------------------
    // HTTP
    // ------------------------------------------------------------------
    let addr = format!("{}:{}", config.http.host, config.http.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!(addr = %addr, "HTTP API listening");

    let state = Arc::new(ApiState { coordinator, banks });
    axum::serve(listener, api::router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await
        .context("HTTP server")?;

    engine.close().await;
    let _ = stop_tx.send(true);
    consumer_task.await.context("consumer task")??;

    info!("transfer_jobs stopped");
    Ok(())
}
