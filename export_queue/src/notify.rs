use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{event, Level};
use uuid::Uuid;

use crate::{JobRecord, JobType};

/// What the requester is told when their export is ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportNotice {
    /// The finished job.
    pub job_id: Uuid,
    /// The kind of export.
    pub job_type: JobType,
    /// The artifact's file name.
    pub filename: String,
    /// Where the artifact can be fetched from.
    pub location: String,
    /// How many rows the export contains.
    pub row_count: u64,
}

impl ExportNotice {
    /// Build a notice for a completed job. Returns `None` if the job has no result.
    pub fn for_job(job: &JobRecord) -> Option<Self> {
        let result = job.result.as_ref()?;
        Some(ExportNotice {
            job_id: job.id,
            job_type: job.job_type,
            filename: result.filename.clone(),
            location: result.location.clone(),
            row_count: result.row_count,
        })
    }
}

/// Tells a requester that their export has completed.
///
/// Delivery is best effort. An error is logged and never changes the job's recorded outcome.
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    /// Send `notice` to `contact`.
    async fn notify(&self, contact: &str, notice: &ExportNotice) -> eyre::Result<()>;
}

/// A [Notifier] that only emits a log event. This is the default when no notifier is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, contact: &str, notice: &ExportNotice) -> eyre::Result<()> {
        event!(
            Level::INFO,
            %contact,
            job_id = %notice.job_id,
            job_type = %notice.job_type,
            location = %notice.location,
            rows = notice.row_count,
            "export ready"
        );
        Ok(())
    }
}
