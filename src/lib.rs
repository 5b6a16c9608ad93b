//! transfer_jobs - Asynchronous Bank-Transfer Job Pipeline
//!
//! Accepts transfer requests over HTTP, hands them to a payment provider
//! through a message bus, and reconciles jobs whose outcome never arrived.
//!
//! # Modules
//!
//! - [`config`] - YAML configuration
//! - [`logging`] - tracing subscriber setup
//! - [`db`] - PostgreSQL pool and schema
//! - [`cache`] - Cache-aside reads over Redis or memory
//! - [`account`] - API-key to account resolution
//! - [`bank`] - Cached bank account inquiry at the provider
//! - [`bus`] - Publish / consume with manual commit
//! - [`transfer`] - Job records, repository, provider client, coordinator
//! - [`scheduler`] - Fixed-interval tasks and the pending-job sweep
//! - [`api`] - axum router

pub mod account;
pub mod api;
pub mod bank;
pub mod bus;
pub mod cache;
pub mod config;
pub mod db;
pub mod logging;
pub mod scheduler;
pub mod transfer;

// Convenient re-exports at crate root
pub use account::{Account, AccountDirectory};
pub use bank::{BankAccount, BankAccountQuery, BankAccounts};
pub use bus::{Consumer, MessageHandler, MessageSource, Publisher};
pub use cache::{CacheAside, CacheControl, CacheStore};
pub use config::AppConfig;
pub use scheduler::{PendingTransferSweep, SchedulerEngine};
pub use transfer::{JobId, JobStatus, TransferCoordinator, TransferError, TransferJob};
