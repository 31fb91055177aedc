use serde::Serialize;
use time::OffsetDateTime;
use tracing::{event, instrument, Level};
use uuid::Uuid;

use crate::{
    store::{JobRepository, Transition},
    Error, ExportQueue, JobRecord, JobState, JobType, Owner, Requester, Result,
};

/// A request for an export, to be submitted to the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRequest {
    /// The kind of export.
    pub job_type: JobType,
    /// Who is asking for it.
    pub owner: Owner,
    /// The selection criteria to pass to the export handler.
    pub payload: serde_json::Value,
    /// Sweeps run higher priority jobs first.
    pub priority: i32,
    /// When to run the export. `None` means right away.
    pub run_at: Option<OffsetDateTime>,
}

impl ExportRequest {
    /// Create an [ExportRequestBuilder] for the given type and owner.
    pub fn builder(job_type: JobType, owner: Owner) -> ExportRequestBuilder {
        ExportRequestBuilder::new(job_type, owner)
    }
}

/// A builder for an export request.
pub struct ExportRequestBuilder {
    request: ExportRequest,
}

impl ExportRequestBuilder {
    /// Create a new request builder.
    pub fn new(job_type: JobType, owner: Owner) -> Self {
        ExportRequestBuilder {
            request: ExportRequest {
                job_type,
                owner,
                payload: serde_json::Value::Null,
                priority: 0,
                run_at: None,
            },
        }
    }

    /// Set the selection criteria.
    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.request.payload = payload;
        self
    }

    /// Serialize the selection criteria using `serde_json`.
    pub fn json_payload<T: ?Sized + Serialize>(mut self, payload: &T) -> Result<Self> {
        self.request.payload = serde_json::to_value(payload).map_err(Error::PayloadError)?;
        Ok(self)
    }

    /// Set the priority of the job.
    pub fn priority(mut self, priority: i32) -> Self {
        self.request.priority = priority;
        self
    }

    /// Set the time at which the job should run. A job scheduled in the future is not dispatched
    /// on submission, and runs in the first sweep after that time.
    pub fn run_at(mut self, run_at: OffsetDateTime) -> Self {
        self.request.run_at = Some(run_at);
        self
    }

    /// Build the request.
    pub fn build(self) -> ExportRequest {
        self.request
    }

    /// Build the request and submit it to an [ExportQueue].
    pub async fn submit_to(self, queue: &ExportQueue) -> Result<JobRecord> {
        queue.submit_request(self.request).await
    }
}

/// The result of [ExportQueue::try_cancel].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job was pending and is now cancelled.
    Cancelled,
    /// The job had already left the pending state.
    NotPending(JobState),
    /// The job no longer exists.
    Gone,
}

impl ExportQueue {
    /// Submit an export to run as soon as possible. Returns the pending job without waiting for
    /// the export to run.
    pub async fn submit(
        &self,
        job_type: JobType,
        payload: serde_json::Value,
        owner: Owner,
    ) -> Result<JobRecord> {
        self.submit_request(
            ExportRequestBuilder::new(job_type, owner)
                .payload(payload)
                .build(),
        )
        .await
    }

    /// Submit an export request. Returns the pending job without waiting for the export to run.
    #[instrument(skip_all, fields(job_type = %request.job_type, owner = %request.owner.user_id))]
    pub async fn submit_request(&self, request: ExportRequest) -> Result<JobRecord> {
        if !self.registry.contains(request.job_type) {
            return Err(Error::Validation(format!(
                "no export handler registered for {}",
                request.job_type
            )));
        }

        let now = self.time.now();
        let scheduled_at = request
            .run_at
            .map(crate::shared_state::truncate_to_millis)
            .unwrap_or(now);
        let job = JobRecord {
            id: Uuid::now_v7(),
            queue_name: self.repo.inner().queue_name().to_string(),
            job_type: request.job_type,
            owner: request.owner,
            payload: request.payload,
            status: JobState::Pending,
            progress: 0,
            priority: request.priority,
            result: None,
            error: None,
            scheduled_at,
            created_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
            cancelled_at: None,
        };

        self.repo.insert(&job).await?;
        event!(Level::DEBUG, id = %job.id, "submitted job");

        if scheduled_at <= now {
            if let Some(dispatcher) = &self.dispatcher {
                dispatcher.dispatch(job.id);
            }
        }

        Ok(job)
    }

    /// Get the current state of a job.
    ///
    /// Returns [Error::NotFound] if the job doesn't exist, and [Error::Forbidden] if it exists
    /// but belongs to someone other than the requester and the requester isn't an operator.
    #[instrument(skip(self))]
    pub async fn get_status(&self, id: Uuid, requester: &Requester) -> Result<JobRecord> {
        let job = self.repo.get(id).await?.ok_or(Error::NotFound)?;
        if !requester.can_access(&job) {
            return Err(Error::Forbidden);
        }

        Ok(job)
    }

    /// List a user's jobs, newest first.
    #[instrument(skip(self))]
    pub async fn list_for_owner(&self, owner_id: &str, limit: usize) -> Result<Vec<JobRecord>> {
        self.repo.list_for_owner(owner_id, limit).await
    }

    /// Cancel a pending job. Returns false if the job doesn't exist or has already started.
    ///
    /// Returns [Error::Forbidden] if the job belongs to someone other than the requester and the
    /// requester isn't an operator.
    pub async fn cancel(&self, id: Uuid, requester: &Requester) -> Result<bool> {
        let outcome = self.try_cancel(id, requester).await?;
        Ok(outcome == CancelOutcome::Cancelled)
    }

    /// Cancel a pending job, reporting why the cancel did not apply if it didn't.
    #[instrument(skip(self))]
    pub async fn try_cancel(&self, id: Uuid, requester: &Requester) -> Result<CancelOutcome> {
        let Some(job) = self.repo.get(id).await? else {
            return Ok(CancelOutcome::Gone);
        };

        if !requester.can_access(&job) {
            return Err(Error::Forbidden);
        }

        if self
            .repo
            .transition(id, Transition::cancel(self.time.now()))
            .await?
            .is_some()
        {
            event!(Level::INFO, %id, "cancelled job");
            return Ok(CancelOutcome::Cancelled);
        }

        // The compare-and-set failed, so the cached copy was dropped and this reads the database.
        let outcome = match self.repo.get(id).await? {
            Some(job) => CancelOutcome::NotPending(job.status),
            None => CancelOutcome::Gone,
        };
        event!(Level::DEBUG, %id, ?outcome, "job not cancelled");
        Ok(outcome)
    }
}
