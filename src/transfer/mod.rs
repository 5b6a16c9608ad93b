//! Transfer Jobs
//!
//! Asynchronous bank transfers backed by an external payment provider.
//!
//! # Lifecycle
//!
//! ```text
//! Submit ──► PENDING ──(Correlate: provider id stored)──► PENDING
//!               │                                            │
//!               └──────────── Reconcile sweep ───────────────┴──► SUCCESS | FAILED
//! ```
//!
//! # Invariants
//!
//! 1. **Persist-Before-Publish**: a job row exists before its message is sent
//! 2. **Terminal Is Final**: success/failed rows are never rewritten
//! 3. **Conditional Writes**: every status write requires the row to be pending
//! 4. **Idempotent Correlate**: a job gets at most one provider transfer

pub mod consumer;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod filter;
pub mod provider;
pub mod repository;
pub mod state;
pub mod types;

#[cfg(test)]
mod integration_tests;

pub use consumer::{CommitPolicy, TransferMessageHandler};
pub use coordinator::{CorrelateOutcome, ReconcileOutcome, SweepReport, TransferCoordinator};
pub use db::{JobStore, MemoryJobStore, PgJobStore};
pub use error::TransferError;
pub use filter::{JobFilter, JobQuery, OrderBy, Pagination};
pub use provider::{HttpPaymentClient, PaymentProvider};
pub use repository::JobRepository;
pub use state::JobStatus;
pub use types::{CreateTransfer, JobId, TransferJob};
