use std::{sync::Arc, time::Duration};

use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{event, instrument, Level};

use crate::{
    error::ExecutionError,
    pipeline::{ExecutionOutcome, Pipeline},
    shared_state::Time,
    store::{JobRepository, Transition},
    Result,
};

/// The default number of jobs a single sweep will run.
pub const DEFAULT_SWEEP_BATCH_SIZE: usize = 5;

/// What a sweep does with jobs that have been `processing` for a long time, which usually means
/// the process running them died.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StuckJobPolicy {
    /// Leave them alone. They stay `processing` until someone intervenes.
    #[default]
    Ignore,
    /// Fail jobs that have been processing for longer than this.
    FailAfter(Duration),
}

/// Counts of what happened during one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Jobs this sweep ran to completion.
    pub completed: usize,
    /// Jobs this sweep ran which failed.
    pub failed: usize,
    /// Jobs that another actor claimed or cancelled first.
    pub not_claimed: usize,
    /// Stuck `processing` jobs this sweep marked as failed.
    pub abandoned: usize,
    /// Jobs that could not be run because of a repository error.
    pub errors: usize,
}

impl SweepReport {
    /// The number of jobs this sweep ran through the export handler.
    pub fn executed(&self) -> usize {
        self.completed + self.failed
    }
}

/// A recovery pass over pending jobs whose immediate dispatch was lost, or which were scheduled
/// for later.
///
/// Any number of sweeps may run at once, in this process or another one sharing the database.
/// Each job is claimed with a compare-and-set, so it runs once no matter how many sweeps see it.
pub struct Sweep {
    repo: Arc<dyn JobRepository>,
    pipeline: Arc<Pipeline>,
    batch_size: usize,
    stuck_job_policy: StuckJobPolicy,
    time: Time,
}

impl Sweep {
    pub(crate) fn new(
        repo: Arc<dyn JobRepository>,
        pipeline: Arc<Pipeline>,
        batch_size: usize,
        stuck_job_policy: StuckJobPolicy,
        time: Time,
    ) -> Self {
        Sweep {
            repo,
            pipeline,
            batch_size,
            stuck_job_policy,
            time,
        }
    }

    /// The maximum number of jobs a single sweep runs.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Run up to [Sweep::batch_size] ready jobs, one after another.
    ///
    /// A failure to run one job is logged and counted, and does not stop the others. An `Err`
    /// means the ready jobs could not be listed at all.
    #[instrument(level = "debug", skip(self))]
    pub async fn run_once(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        if let StuckJobPolicy::FailAfter(limit) = self.stuck_job_policy {
            report.abandoned = self.fail_stuck_jobs(limit).await?;
        }

        let ready = self
            .repo
            .ready_jobs(self.time.now(), self.batch_size)
            .await?;
        event!(Level::DEBUG, count = ready.len(), "found ready jobs");

        for job in ready {
            match self.pipeline.execute(job.id).await {
                Ok(ExecutionOutcome::Completed(_)) => report.completed += 1,
                Ok(ExecutionOutcome::Failed(_)) => report.failed += 1,
                Ok(ExecutionOutcome::NotClaimed | ExecutionOutcome::Abandoned) => {
                    report.not_claimed += 1
                }
                Err(e) => {
                    event!(Level::ERROR, id = %job.id, err = %e, "failed to run job");
                    report.errors += 1;
                }
            }
        }

        event!(Level::DEBUG, ?report, "sweep finished");
        Ok(report)
    }

    async fn fail_stuck_jobs(&self, limit: Duration) -> Result<usize> {
        let now = self.time.now();
        let stuck = self
            .repo
            .processing_started_before(now - limit, self.batch_size)
            .await?;

        let mut failed = 0;
        for job in stuck {
            let transition = Transition::fail(now, ExecutionError::Abandoned.to_string());
            match self.repo.transition(job.id, transition).await {
                Ok(Some(_)) => {
                    event!(Level::WARN, id = %job.id, started_at = ?job.started_at, "failed stuck job");
                    failed += 1;
                }
                Ok(None) => {}
                Err(e) => event!(Level::ERROR, id = %job.id, err = %e, "failed to fail stuck job"),
            }
        }

        Ok(failed)
    }
}

/// Run `sweep` every `interval` until `close_rx` fires.
pub(crate) fn spawn_periodic_sweep(
    sweep: Arc<Sweep>,
    interval: Duration,
    mut close_rx: watch::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = close_rx.changed() => break,
                _ = ticker.tick() => {
                    if let Err(e) = sweep.run_once().await {
                        event!(Level::ERROR, err = %e, "sweep failed");
                    }
                }
            }
        }
    })
}
