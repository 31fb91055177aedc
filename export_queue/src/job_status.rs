use std::{fmt::Display, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// The current state of an export job.
///
/// ```text
/// pending ──► processing ──► completed
///    │             └───────► failed
///    └──► cancelled
/// ```
///
/// `completed`, `failed`, and `cancelled` are terminal; a job in one of those states never
/// changes again.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// The job is waiting to be claimed.
    Pending,
    /// The job has been claimed and its export is running.
    Processing,
    /// The export finished and its artifact was stored.
    Completed,
    /// The export failed. It will not be retried.
    Failed,
    /// The job was cancelled before it started.
    Cancelled,
}

impl JobState {
    /// Return a string representation of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        }
    }

    /// Whether the job can never change state again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether the state machine has an edge from this state to `next`.
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::Pending, JobState::Processing)
                | (JobState::Pending, JobState::Cancelled)
                | (JobState::Processing, JobState::Completed)
                | (JobState::Processing, JobState::Failed)
        )
    }

    /// The coarse progress indicator reported for a job entering this state, if entering it
    /// changes the progress. Failed jobs keep whatever progress they had when they failed.
    pub(crate) fn progress(&self) -> Option<u8> {
        match self {
            JobState::Pending | JobState::Cancelled => Some(0),
            JobState::Processing => Some(50),
            JobState::Completed => Some(100),
            JobState::Failed => None,
        }
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "cancelled" => Ok(JobState::Cancelled),
            _ => Err(Error::InvalidJobState(s.to_string())),
        }
    }
}
