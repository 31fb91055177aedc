use std::{panic::AssertUnwindSafe, sync::Arc};

use futures::FutureExt;
use tracing::{event, instrument, Level, Span};
use uuid::Uuid;

use crate::{
    error::ExecutionError,
    job_registry::ExportRegistry,
    notify::{ExportNotice, Notifier},
    shared_state::Time,
    storage::ArtifactStorage,
    store::{JobRepository, Transition},
    ExportResult, ExportTask, JobRecord, Result,
};

/// What happened when the pipeline was asked to run a job.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    /// The job was not pending, or no longer exists, so some other actor owns it. Nothing was
    /// changed.
    NotClaimed,
    /// The export ran and the job is now completed.
    Completed(JobRecord),
    /// The export failed and the job is now failed.
    Failed(JobRecord),
    /// The job was claimed, but something else moved it out of `processing` before the outcome
    /// could be recorded.
    Abandoned,
}

/// Runs a single job through claim, export, storage, completion, and notification.
///
/// The claim is a compare-and-set, so the same job can safely be handed to the pipeline any number
/// of times by any number of callers. Only one of them will ever run the export.
pub struct Pipeline {
    repo: Arc<dyn JobRepository>,
    registry: ExportRegistry,
    storage: Arc<dyn ArtifactStorage>,
    notifier: Arc<dyn Notifier>,
    time: Time,
}

impl Pipeline {
    pub(crate) fn new(
        repo: Arc<dyn JobRepository>,
        registry: ExportRegistry,
        storage: Arc<dyn ArtifactStorage>,
        notifier: Arc<dyn Notifier>,
        time: Time,
    ) -> Self {
        Pipeline {
            repo,
            registry,
            storage,
            notifier,
            time,
        }
    }

    /// Claim the job and, if the claim succeeds, run it to a terminal state.
    ///
    /// An `Err` means the repository itself failed. Export failures are recorded on the job and
    /// reported as [ExecutionOutcome::Failed].
    #[instrument(name = "execute_job", skip(self), fields(job_type))]
    pub async fn execute(&self, id: Uuid) -> Result<ExecutionOutcome> {
        let Some(job) = self
            .repo
            .transition(id, Transition::claim(self.time.now()))
            .await?
        else {
            event!(Level::DEBUG, "job was not pending, skipping");
            return Ok(ExecutionOutcome::NotClaimed);
        };

        Span::current().record("job_type", job.job_type.as_str());
        event!(Level::DEBUG, "claimed job");

        match self.run(&job).await {
            Ok(result) => {
                let completed = self
                    .repo
                    .transition(id, Transition::complete(self.time.now(), result))
                    .await?;

                let Some(completed) = completed else {
                    event!(Level::WARN, "job left processing while running, dropping result");
                    return Ok(ExecutionOutcome::Abandoned);
                };

                event!(Level::INFO, "export completed");
                self.notify(&completed).await;
                Ok(ExecutionOutcome::Completed(completed))
            }
            Err(e) => {
                event!(Level::WARN, err = %e, "export failed");
                let failed = self
                    .repo
                    .transition(id, Transition::fail(self.time.now(), e.to_string()))
                    .await?;

                match failed {
                    Some(failed) => Ok(ExecutionOutcome::Failed(failed)),
                    None => Ok(ExecutionOutcome::Abandoned),
                }
            }
        }
    }

    async fn run(&self, job: &JobRecord) -> Result<ExportResult, ExecutionError> {
        let handler = self
            .registry
            .get(job.job_type)
            .ok_or(ExecutionError::UnregisteredType(job.job_type))?;

        let task = ExportTask::from(job);
        let output = AssertUnwindSafe(handler.export(&task))
            .catch_unwind()
            .await
            .map_err(|e| ExecutionError::Panic(panic_message(e)))?
            .map_err(|e| ExecutionError::Handler(format!("{e:#}")))?;

        let location = AssertUnwindSafe(
            self.storage
                .store(job.id, &output.filename, &output.content),
        )
        .catch_unwind()
        .await
        .map_err(|e| ExecutionError::Storage(panic_message(e)))?
        .map_err(|e| ExecutionError::Storage(format!("{e:#}")))?;

        Ok(ExportResult {
            byte_size: output.content.len() as u64,
            filename: output.filename,
            location,
            row_count: output.row_count,
        })
    }

    async fn notify(&self, job: &JobRecord) {
        let Some(notice) = ExportNotice::for_job(job) else {
            return;
        };

        match AssertUnwindSafe(self.notifier.notify(&job.owner.contact, &notice))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => event!(Level::WARN, err = ?e, "failed to send export notification"),
            Err(e) => event!(
                Level::WARN,
                panic = %panic_message(e),
                "notifier panicked while sending export notification"
            ),
        }
    }
}

fn panic_message(e: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = e.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = e.downcast_ref::<String>() {
        s.clone()
    } else {
        "Panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::{
        test_util::{TestEnvironment, FAILS, PANICS, SUCCEEDS, UNREGISTERED},
        JobState, Owner,
    };

    fn owner() -> Owner {
        Owner::new("alice", "alice@example.com")
    }

    #[tokio::test]
    async fn completes_job_and_notifies() {
        let test = TestEnvironment::sweep_only().await;
        let job = test
            .queue
            .submit(SUCCEEDS, serde_json::json!({ "rows": 3 }), owner())
            .await
            .unwrap();

        let outcome = test.queue.pipeline().execute(job.id).await.unwrap();
        let ExecutionOutcome::Completed(completed) = outcome else {
            panic!("expected completion, got {outcome:?}");
        };

        assert_eq!(completed.status, JobState::Completed);
        assert_eq!(completed.progress, 100);
        assert!(completed.error.is_none());
        let result = completed.result.as_ref().expect("result is recorded");
        assert_eq!(result.row_count, 3);
        assert_eq!(
            result.byte_size,
            test.storage.get(&result.location).unwrap().len() as u64
        );

        let notices = test.notifier.notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].0, "alice@example.com");
        assert_eq!(notices[0].1.job_id, job.id);
    }

    #[tokio::test]
    async fn second_execution_is_not_claimed() {
        let test = TestEnvironment::sweep_only().await;
        let job = test
            .queue
            .submit(SUCCEEDS, serde_json::Value::Null, owner())
            .await
            .unwrap();

        let pipeline = test.queue.pipeline();
        assert!(matches!(
            pipeline.execute(job.id).await.unwrap(),
            ExecutionOutcome::Completed(_)
        ));
        assert_eq!(
            pipeline.execute(job.id).await.unwrap(),
            ExecutionOutcome::NotClaimed
        );
        assert_eq!(
            pipeline.execute(Uuid::now_v7()).await.unwrap(),
            ExecutionOutcome::NotClaimed
        );
        assert_eq!(test.context.invocations(), vec![job.id]);
    }

    #[tokio::test]
    async fn handler_error_fails_job() {
        let test = TestEnvironment::sweep_only().await;
        let job = test
            .queue
            .submit(FAILS, serde_json::Value::Null, owner())
            .await
            .unwrap();

        let outcome = test.queue.pipeline().execute(job.id).await.unwrap();
        let ExecutionOutcome::Failed(failed) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };

        assert_eq!(failed.status, JobState::Failed);
        assert_eq!(failed.progress, 50);
        assert!(failed.result.is_none());
        let error = failed.error.as_deref().unwrap();
        assert!(error.contains("database unavailable"), "error was {error}");
        assert!(failed.failed_at.is_some());
        assert!(test.notifier.notices().is_empty());
    }

    #[tokio::test]
    async fn handler_panic_fails_job() {
        let test = TestEnvironment::sweep_only().await;
        let job = test
            .queue
            .submit(PANICS, serde_json::Value::Null, owner())
            .await
            .unwrap();

        let outcome = test.queue.pipeline().execute(job.id).await.unwrap();
        let ExecutionOutcome::Failed(failed) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };

        assert!(failed.result.is_none());
        assert!(failed.error.unwrap().contains("handler exploded"));
    }

    #[tokio::test]
    async fn storage_error_fails_job() {
        let test = TestEnvironment::sweep_only().await;
        test.storage.fail.store(true, Ordering::SeqCst);
        let job = test
            .queue
            .submit(SUCCEEDS, serde_json::Value::Null, owner())
            .await
            .unwrap();

        let outcome = test.queue.pipeline().execute(job.id).await.unwrap();
        let ExecutionOutcome::Failed(failed) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };

        assert!(failed.result.is_none());
        assert!(failed.error.unwrap().starts_with("Failed to store artifact"));
    }

    #[tokio::test]
    async fn storage_panic_fails_job() {
        let test = TestEnvironment::sweep_only().await;
        test.storage.panic.store(true, Ordering::SeqCst);
        let job = test
            .queue
            .submit(SUCCEEDS, serde_json::Value::Null, owner())
            .await
            .unwrap();

        let outcome = test.queue.pipeline().execute(job.id).await.unwrap();
        let ExecutionOutcome::Failed(failed) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };

        assert!(failed.result.is_none());
        let error = failed.error.unwrap();
        assert!(error.starts_with("Failed to store artifact"), "error was {error}");
        assert!(error.contains("storage client crashed"), "error was {error}");
    }

    #[tokio::test]
    async fn storage_panic_does_not_stop_the_sweep() {
        let test = TestEnvironment::sweep_only().await;
        test.storage.panic.store(true, Ordering::SeqCst);
        let mut ids = Vec::new();
        for _ in 0..2 {
            let job = test
                .queue
                .submit(SUCCEEDS, serde_json::Value::Null, owner())
                .await
                .unwrap();
            ids.push(job.id);
        }

        let report = test.queue.sweep().run_once().await.unwrap();
        assert_eq!(report.failed, 2);

        let requester = crate::Requester::operator("ops");
        for id in ids {
            let job = test.queue.get_status(id, &requester).await.unwrap();
            assert_eq!(job.status, JobState::Failed);
            assert!(job.error.is_some());
        }
    }

    #[tokio::test]
    async fn notifier_panic_keeps_job_completed() {
        let test = TestEnvironment::sweep_only().await;
        test.notifier.panic.store(true, Ordering::SeqCst);
        let mut ids = Vec::new();
        for _ in 0..2 {
            let job = test
                .queue
                .submit(SUCCEEDS, serde_json::Value::Null, owner())
                .await
                .unwrap();
            ids.push(job.id);
        }

        let report = test.queue.sweep().run_once().await.unwrap();
        assert_eq!(report.completed, 2);

        for id in ids {
            let stored = test.queue.repository().inner().get(id).await.unwrap();
            assert_eq!(stored.unwrap().status, JobState::Completed);
        }
    }

    #[tokio::test]
    async fn handler_removed_after_submit_fails_job() {
        let test = TestEnvironment::sweep_only().await;

        // Another process with a different set of handlers accepted this job.
        let job = crate::test_util::pending_record(UNREGISTERED, owner());
        test.queue.repository().insert(&job).await.unwrap();

        let outcome = test.queue.pipeline().execute(job.id).await.unwrap();
        let ExecutionOutcome::Failed(failed) = outcome else {
            panic!("expected failure, got {outcome:?}");
        };
        assert_eq!(
            failed.error.as_deref(),
            Some("No export handler registered for analytics-excel")
        );
    }

    #[tokio::test]
    async fn notifier_failure_keeps_job_completed() {
        let test = TestEnvironment::sweep_only().await;
        test.notifier.fail.store(true, Ordering::SeqCst);
        let job = test
            .queue
            .submit(SUCCEEDS, serde_json::Value::Null, owner())
            .await
            .unwrap();

        let outcome = test.queue.pipeline().execute(job.id).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Completed(_)));

        let stored = test.queue.repository().inner().get(job.id).await.unwrap();
        assert_eq!(stored.unwrap().status, JobState::Completed);
    }
}
