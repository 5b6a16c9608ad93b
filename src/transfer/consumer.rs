//! Transfer Message Handler
//!
//! Consumer entrypoint: turns a published transfer message into a Correlate
//! call on the coordinator.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use super::coordinator::{CorrelateOutcome, TransferCoordinator};
use super::error::TransferError;
use super::types::{CreateTransfer, JobId};
use crate::bus::{Commit, Message, MessageHandler};

/// When a handled message is committed
///
/// - `Always`: commit whatever the outcome. A failed provider call is not
///   retried; the job stays pending until the sweep fails it by timeout.
/// - `OnSuccess`: leave failed messages uncommitted so they are delivered
///   again after a restart. Correlate is idempotent on `job_id`, so a
///   redelivered message never creates a second provider transfer for a job
///   that already has one.
///
/// Messages that cannot be decoded are committed under both policies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitPolicy {
    #[default]
    Always,
    OnSuccess,
}

pub struct TransferMessageHandler {
    coordinator: Arc<TransferCoordinator>,
    policy: CommitPolicy,
}

impl TransferMessageHandler {
    pub fn new(coordinator: Arc<TransferCoordinator>, policy: CommitPolicy) -> Self {
        Self {
            coordinator,
            policy,
        }
    }

    fn decode(message: &Message) -> Result<(JobId, CreateTransfer), TransferError> {
        let job_id = JobId::from_message_key(&message.key)?;
        let request: CreateTransfer = serde_json::from_str(&message.value)?;
        Ok((job_id, request))
    }
}

#[async_trait]
impl MessageHandler for TransferMessageHandler {
    async fn handle(&self, message: &Message, commit: &Commit) {
        let (job_id, request) = match Self::decode(message) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(key = %message.key, offset = %message.offset, error = %e, "Dropping undecodable transfer message");
                commit.commit();
                return;
            }
        };

        match self.coordinator.create(job_id, &request).await {
            Ok(outcome) => {
                match &outcome {
                    CorrelateOutcome::Recorded(job) => info!(
                        job_id = %job_id,
                        provider_id = job.provider_id().unwrap_or_default(),
                        "Transfer correlated"
                    ),
                    other => info!(job_id = %job_id, outcome = ?other, "Correlate skipped"),
                }
                commit.commit();
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, policy = ?self.policy, "Correlate failed");
                if self.policy == CommitPolicy::Always {
                    commit.commit();
                }
            }
        }
    }
}
