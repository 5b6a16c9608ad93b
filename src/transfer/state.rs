//! Transfer Job Status
//!
//! Stored in PostgreSQL as the `transferstatus` enum (`pending`, `success`, `failed`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Transfer job status
///
/// ```text
/// PENDING ──▶ SUCCESS
///    │
///    └──────▶ FAILED
/// ```
///
/// Terminal states: SUCCESS, FAILED. No transition leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted, provider outcome not yet determined
    Pending,
    /// Terminal: provider confirmed the transfer
    Success,
    /// Terminal: provider rejected, create step never completed, or timed out
    Failed,
}

impl JobStatus {
    /// Check if this is a terminal state (no more transitions possible)
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failed)
    }

    /// Check whether `self -> next` is a legal transition
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Success) | (JobStatus::Pending, JobStatus::Failed)
        )
    }

    /// Storage / wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "success" => Ok(JobStatus::Success),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown transfer status: {}", other)),
        }
    }
}
