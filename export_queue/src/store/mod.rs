//! Job storage. [SqliteJobRepository] is the authoritative store, and [CachedJobRepository]
//! layers a process-local cache over any [JobRepository].

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{job::ExportResult, job_status::JobState, Error, JobRecord, Result};

mod cache;
mod sqlite;

pub use cache::{CachedJobRepository, DEFAULT_CACHE_CAPACITY};
pub use sqlite::SqliteJobRepository;
pub(crate) use sqlite::{job_from_row, JOB_COLUMNS};

/// A durable store of job records.
///
/// [JobRepository::transition] is the only concurrency guard the queue relies on: it must apply
/// the change atomically, and only when the job's current status equals [Transition::from].
#[async_trait]
pub trait JobRepository: Send + Sync + 'static {
    /// Store a new job.
    async fn insert(&self, job: &JobRecord) -> Result<()>;

    /// Fetch a job by ID.
    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>>;

    /// Fetch an owner's jobs, newest first.
    async fn list_for_owner(&self, owner_id: &str, limit: usize) -> Result<Vec<JobRecord>>;

    /// Fetch pending jobs scheduled at or before `now`, highest priority first and then
    /// oldest first.
    async fn ready_jobs(&self, now: OffsetDateTime, limit: usize) -> Result<Vec<JobRecord>>;

    /// Fetch jobs that have been processing since before `cutoff`.
    async fn processing_started_before(
        &self,
        cutoff: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<JobRecord>>;

    /// Apply `transition` to the job if its status is still [Transition::from]. Returns the
    /// updated job, or `None` if the job is missing or was already moved out of that state.
    async fn transition(&self, id: Uuid, transition: Transition) -> Result<Option<JobRecord>>;

    /// Delete jobs in a terminal state which reached it before `cutoff`, returning their IDs.
    async fn delete_finished_before(&self, cutoff: OffsetDateTime) -> Result<Vec<Uuid>>;
}

/// A compare-and-set change of a job's status, along with the fields that belong to the new state.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// The status the job must currently have.
    pub from: JobState,
    /// The status to move the job to.
    pub to: JobState,
    /// When the transition happened. Recorded into the timestamp column for `to`.
    pub at: OffsetDateTime,
    /// The artifact, for transitions to [JobState::Completed].
    pub result: Option<ExportResult>,
    /// The failure message, for transitions to [JobState::Failed].
    pub error: Option<String>,
}

impl Transition {
    /// Claim a pending job for processing.
    pub fn claim(at: OffsetDateTime) -> Self {
        Self::new(JobState::Pending, JobState::Processing, at)
    }

    /// Cancel a pending job.
    pub fn cancel(at: OffsetDateTime) -> Self {
        Self::new(JobState::Pending, JobState::Cancelled, at)
    }

    /// Record a successful export.
    pub fn complete(at: OffsetDateTime, result: ExportResult) -> Self {
        Transition {
            result: Some(result),
            ..Self::new(JobState::Processing, JobState::Completed, at)
        }
    }

    /// Record a failed export.
    pub fn fail(at: OffsetDateTime, error: impl Into<String>) -> Self {
        Transition {
            error: Some(error.into()),
            ..Self::new(JobState::Processing, JobState::Failed, at)
        }
    }

    fn new(from: JobState, to: JobState, at: OffsetDateTime) -> Self {
        Transition {
            from,
            to,
            at,
            result: None,
            error: None,
        }
    }

    /// Check that this is an edge of the state machine and that it carries exactly the fields
    /// its target state requires.
    pub(crate) fn validate(&self) -> Result<()> {
        let fields_ok = match self.to {
            JobState::Completed => self.result.is_some() && self.error.is_none(),
            JobState::Failed => {
                self.result.is_none() && self.error.as_deref().is_some_and(|e| !e.is_empty())
            }
            _ => self.result.is_none() && self.error.is_none(),
        };

        if self.from.can_transition_to(self.to) && fields_ok {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                from: self.from,
                to: self.to,
            })
        }
    }

    /// Apply the transition to an in-memory copy of a job.
    pub(crate) fn apply_to(&self, job: &mut JobRecord) {
        job.status = self.to;
        if let Some(progress) = self.to.progress() {
            job.progress = progress;
        }

        match self.to {
            JobState::Processing => job.started_at = Some(self.at),
            JobState::Completed => {
                job.completed_at = Some(self.at);
                job.result = self.result.clone();
            }
            JobState::Failed => {
                job.failed_at = Some(self.at);
                job.error = self.error.clone();
            }
            JobState::Cancelled => job.cancelled_at = Some(self.at),
            JobState::Pending => {}
        }
    }
}
