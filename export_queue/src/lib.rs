#![warn(missing_docs)]
//! An asynchronous export job queue backed by SQLite.
//!
//! Callers submit requests for large exports and get a pending job back right away. The export
//! runs in the background, and callers poll the job to find out when the artifact is ready. Job
//! state lives in a SQLite database so it survives a restart, and every job reaches exactly one
//! terminal state even when several sweeps run at once.
//!
//! ```no_run
//! # use std::{path::Path, sync::Arc};
//! # use serde::Deserialize;
//! use export_queue::*;
//!
//! #[derive(Deserialize)]
//! struct UserFilter {
//!     active: bool,
//! }
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Error> {
//!     // Register one handler per export type the application offers.
//!     let mut registry = ExportRegistry::new();
//!     registry.add_fn(JobType::UsersCsv, |task: ExportTask| async move {
//!         let _filter: UserFilter = task.json_payload()?;
//!         // query the users and serialize the rows here
//!         Ok::<_, eyre::Report>(ExportOutput {
//!             content: b"id,name\n".to_vec(),
//!             filename: format!("users-{}.csv", task.id),
//!             row_count: 0,
//!         })
//!     });
//!
//!     let storage = Arc::new(DirectoryStorage::new("exports"));
//!     let queue = ExportQueue::builder(Path::new("exports.db"), registry, storage)
//!         .sweep_interval(std::time::Duration::from_secs(60))
//!         .build()
//!         .await?;
//!
//!     // Submit an export. This returns as soon as the job is recorded.
//!     let owner = Owner::new("user-1", "user-1@example.com");
//!     let job = queue
//!         .submit(JobType::UsersCsv, serde_json::json!({ "active": true }), owner)
//!         .await?;
//!     assert_eq!(job.status, JobState::Pending);
//!
//!     // See what's happening with the job.
//!     let status = queue.get_status(job.id, &Requester::user("user-1")).await?;
//!     println!("{} is {}", status.id, status.status);
//!
//!     queue.close(std::time::Duration::from_secs(30)).await?;
//!     Ok(())
//! }
//! ```

mod dispatcher;
mod error;
mod job;
mod job_registry;
mod job_status;
mod migrations;
mod notify;
mod pipeline;
mod queue;
mod reaper;
mod shared_state;
mod storage;
pub mod store;
mod submit;
mod sweep;

mod db_writer;
#[cfg(test)]
mod test_util;

pub use error::{Error, ExecutionError, Result};
pub use job::{ExportFormat, ExportResult, ExportTask, JobRecord, JobType, Owner, Requester, Role};
pub use job_registry::{ExportHandler, ExportOutput, ExportRegistry, FnHandler};
pub use job_status::JobState;
pub use notify::{ExportNotice, LogNotifier, Notifier};
pub use pipeline::{ExecutionOutcome, Pipeline};
pub use queue::{ExportQueue, QueueOptions, DEFAULT_QUEUE_NAME};
pub use reaper::{Reaper, DEFAULT_REAP_INTERVAL, DEFAULT_RETENTION};
pub use shared_state::Time;
pub use storage::{ArtifactStorage, DirectoryStorage};
pub use submit::{CancelOutcome, ExportRequest, ExportRequestBuilder};
pub use sweep::{StuckJobPolicy, Sweep, SweepReport, DEFAULT_SWEEP_BATCH_SIZE};

pub(crate) fn log_error<T, E>(result: Result<T, E>)
where
    E: std::error::Error,
{
    if let Err(e) = result {
        tracing::event!(tracing::Level::ERROR, ?e);
    }
}
