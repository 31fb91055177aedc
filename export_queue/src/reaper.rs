use std::{sync::Arc, time::Duration};

use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{event, instrument, Level};

use crate::{shared_state::Time, store::JobRepository, Result};

/// How long finished jobs are kept by default.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// A conventional interval for running the reaper.
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Deletes finished jobs once they are older than the retention window.
pub struct Reaper {
    repo: Arc<dyn JobRepository>,
    retention: Duration,
    time: Time,
}

impl Reaper {
    pub(crate) fn new(repo: Arc<dyn JobRepository>, retention: Duration, time: Time) -> Self {
        Reaper {
            repo,
            retention,
            time,
        }
    }

    /// How long a job is kept after it finishes.
    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Delete every completed, failed, or cancelled job that finished before the retention
    /// window. Returns how many were deleted.
    #[instrument(level = "debug", skip(self))]
    pub async fn run_once(&self) -> Result<u64> {
        let cutoff = self.time.now() - self.retention;
        let deleted = self.repo.delete_finished_before(cutoff).await?;
        if !deleted.is_empty() {
            event!(Level::INFO, count = deleted.len(), %cutoff, "deleted old jobs");
        }
        Ok(deleted.len() as u64)
    }
}

/// Run `reaper` every `interval` until `close_rx` fires.
pub(crate) fn spawn_periodic_reaper(
    reaper: Arc<Reaper>,
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
                    if let Err(e) = reaper.run_once().await {
                        event!(Level::ERROR, err = %e, "reaper failed");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::*;
    use crate::{
        test_util::{finished_record, pending_record, wait_for, TestEnvironment},
        JobState, JobType, Owner,
    };

    fn owner() -> Owner {
        Owner::new("alice", "alice@example.com")
    }

    #[tokio::test]
    async fn deletes_only_jobs_past_retention() {
        let test = TestEnvironment::sweep_only().await;
        let now = test.time.now();
        let repo = test.queue.repository();

        let old = finished_record(
            JobType::FundsCsv,
            owner(),
            JobState::Completed,
            now - Duration::days(8),
        );
        let recent = finished_record(
            JobType::FundsCsv,
            owner(),
            JobState::Completed,
            now - Duration::days(6),
        );
        repo.insert(&old).await.unwrap();
        repo.insert(&recent).await.unwrap();

        let deleted = test.queue.reaper().run_once().await.unwrap();
        assert_eq!(deleted, 1);

        assert!(repo.cached(old.id).is_none());
        assert!(repo.inner().get(old.id).await.unwrap().is_none());

        assert_eq!(repo.cached(recent.id), Some(recent.clone()));
        assert_eq!(repo.inner().get(recent.id).await.unwrap(), Some(recent));
    }

    #[tokio::test]
    async fn never_touches_unfinished_jobs() {
        let test = TestEnvironment::sweep_only().await;
        let now = test.time.now();
        let repo = test.queue.repository();

        let mut pending = pending_record(JobType::UsersCsv, owner());
        pending.created_at = now - Duration::days(30);
        pending.scheduled_at = now + Duration::days(1);
        let mut processing = pending_record(JobType::UsersCsv, owner());
        processing.status = JobState::Processing;
        processing.progress = 50;
        processing.started_at = Some(now - Duration::days(30));

        repo.insert(&pending).await.unwrap();
        repo.insert(&processing).await.unwrap();

        assert_eq!(test.queue.reaper().run_once().await.unwrap(), 0);
        assert!(repo.inner().get(pending.id).await.unwrap().is_some());
        assert!(repo.inner().get(processing.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn uses_each_terminal_timestamp() {
        let test = TestEnvironment::sweep_only().await;
        let now = test.time.now();

        for state in [JobState::Completed, JobState::Failed, JobState::Cancelled] {
            let job = finished_record(JobType::UsersCsv, owner(), state, now - Duration::days(10));
            test.queue.repository().insert(&job).await.unwrap();
        }

        assert_eq!(test.queue.reaper().run_once().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn custom_retention() {
        let test = TestEnvironment::with_options(|o| {
            o.dispatch_on_submit(false)
                .retention(std::time::Duration::from_secs(3600))
        })
        .await;
        let now = test.time.now();

        let job = finished_record(
            JobType::UsersCsv,
            owner(),
            JobState::Failed,
            now - Duration::hours(2),
        );
        test.queue.repository().insert(&job).await.unwrap();

        assert_eq!(
            test.queue.reaper().retention(),
            std::time::Duration::from_secs(3600)
        );
        assert_eq!(test.queue.reaper().run_once().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn periodic_reaper_deletes_old_jobs() {
        let test = TestEnvironment::with_options(|o| {
            o.dispatch_on_submit(false)
                .reap_interval(std::time::Duration::from_millis(50))
        })
        .await;

        let job = finished_record(
            JobType::UsersCsv,
            owner(),
            JobState::Completed,
            test.time.now() - Duration::days(8),
        );
        test.queue.repository().insert(&job).await.unwrap();

        let repo = test.queue.repository();
        wait_for("reaper to delete job", || async {
            match repo.inner().get(job.id).await {
                Ok(None) => Ok(()),
                Ok(Some(_)) => Err("job still exists".to_string()),
                Err(e) => Err(e.to_string()),
            }
        })
        .await;
    }
}
