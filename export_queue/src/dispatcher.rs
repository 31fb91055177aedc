use std::sync::Arc;

use tokio::{
    sync::{mpsc, watch},
    task::{JoinHandle, JoinSet},
};
use tracing::{event, instrument, Level};
use uuid::Uuid;

use crate::{
    pipeline::{ExecutionOutcome, Pipeline},
    Result,
};

/// Hands freshly submitted jobs to the pipeline without making the submitter wait.
///
/// Job IDs go into a bounded channel. A supervisor task reads them and runs one pipeline execution
/// per ID. If the channel is full the ID is dropped, and the job stays pending until a sweep
/// finds it.
pub(crate) struct Dispatcher {
    tx: mpsc::Sender<Uuid>,
}

impl Dispatcher {
    /// Start the supervisor task. It stops accepting new IDs once `close_rx` fires, then waits
    /// for the executions it already started.
    pub fn start(
        pipeline: Arc<Pipeline>,
        channel_size: usize,
        close_rx: watch::Receiver<()>,
    ) -> (Dispatcher, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(channel_size.max(1));
        let supervisor = tokio::spawn(supervise(pipeline, rx, close_rx));
        (Dispatcher { tx }, supervisor)
    }

    /// Queue a job for immediate execution. Returns false if it could not be queued.
    pub fn dispatch(&self, id: Uuid) -> bool {
        match self.tx.try_send(id) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                event!(Level::WARN, %id, "dispatch channel full, leaving job for the sweep");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                event!(Level::WARN, %id, "dispatcher closed, leaving job for the sweep");
                false
            }
        }
    }
}

#[instrument(name = "dispatcher", skip_all)]
async fn supervise(
    pipeline: Arc<Pipeline>,
    mut rx: mpsc::Receiver<Uuid>,
    mut close_rx: watch::Receiver<()>,
) {
    let mut running = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            _ = close_rx.changed() => break,
            id = rx.recv() => {
                let Some(id) = id else {
                    break;
                };
                let pipeline = pipeline.clone();
                running.spawn(async move { (id, pipeline.execute(id).await) });
            }
            Some(result) = running.join_next(), if !running.is_empty() => log_outcome(result),
        }
    }

    rx.close();
    event!(Level::DEBUG, in_flight = running.len(), "dispatcher closing");
    while let Some(result) = running.join_next().await {
        log_outcome(result);
    }
}

fn log_outcome(
    result: std::result::Result<(Uuid, Result<ExecutionOutcome>), tokio::task::JoinError>,
) {
    match result {
        Ok((id, Ok(ExecutionOutcome::Completed(_)))) => {
            event!(Level::DEBUG, %id, "dispatched job completed")
        }
        Ok((id, Ok(ExecutionOutcome::Failed(job)))) => {
            event!(Level::DEBUG, %id, error = job.error.as_deref(), "dispatched job failed")
        }
        Ok((id, Ok(outcome))) => event!(Level::DEBUG, %id, ?outcome, "dispatched job not run"),
        Ok((id, Err(e))) => event!(Level::ERROR, %id, err = %e, "failed to execute job"),
        Err(e) => event!(Level::ERROR, err = %e, "job execution task panicked"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        store::JobRepository,
        test_util::{wait_for_job_status, TestEnvironment, SLOW, SUCCEEDS},
        JobState, Owner,
    };

    fn owner() -> Owner {
        Owner::new("alice", "alice@example.com")
    }

    #[tokio::test]
    async fn submitted_job_runs_without_a_sweep() {
        let test = TestEnvironment::new().await;
        let job = test
            .queue
            .submit(SUCCEEDS, serde_json::Value::Null, owner())
            .await
            .unwrap();

        let done = wait_for_job_status("job to complete", &test.queue, job.id, JobState::Completed)
            .await;
        assert!(done.result.is_some());
        assert_eq!(test.context.invocations(), vec![job.id]);
    }

    #[test]
    fn dispatch_never_blocks() {
        let (tx, rx) = mpsc::channel(1);
        let dispatcher = Dispatcher { tx };

        assert!(dispatcher.dispatch(Uuid::now_v7()));
        assert!(!dispatcher.dispatch(Uuid::now_v7()), "channel is full");

        drop(rx);
        assert!(!dispatcher.dispatch(Uuid::now_v7()), "channel is closed");
    }

    #[tokio::test]
    async fn dropped_dispatch_is_recovered_by_sweep() {
        let test = TestEnvironment::with_options(|o| o.dispatch_channel_size(1)).await;

        let jobs = futures::future::try_join_all(
            (0..5).map(|_| test.queue.submit(SUCCEEDS, serde_json::Value::Null, owner())),
        )
        .await
        .unwrap();

        // Whether or not the channel overflowed, a sweep leaves nothing pending.
        test.queue.sweep().run_once().await.unwrap();
        for job in &jobs {
            wait_for_job_status("job to complete", &test.queue, job.id, JobState::Completed).await;
        }

        let mut invoked = test.context.invocations();
        invoked.sort();
        let mut expected = jobs.iter().map(|j| j.id).collect::<Vec<_>>();
        expected.sort();
        assert_eq!(invoked, expected, "every job ran exactly once");
    }

    #[tokio::test]
    async fn close_waits_for_running_jobs() {
        let test = TestEnvironment::new().await;
        let job = test
            .queue
            .submit(SLOW, serde_json::Value::Null, owner())
            .await
            .unwrap();
        wait_for_job_status("job to start", &test.queue, job.id, JobState::Processing).await;

        test.context.release_slow_jobs();
        test.queue
            .close(std::time::Duration::from_secs(5))
            .await
            .unwrap();

        // Reads still work after the writer has shut down.
        let stored = test.queue.repository().inner().get(job.id).await.unwrap();
        assert_eq!(stored.unwrap().status, JobState::Completed);
    }
}
