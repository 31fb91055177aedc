use std::{fmt::Display, str::FromStr};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{job_status::JobState, Error, Result};

/// The kinds of export the queue knows how to run. Each one is served by exactly one
/// [ExportHandler](crate::ExportHandler) registered in the [ExportRegistry](crate::ExportRegistry).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    /// Fund listings as CSV.
    FundsCsv,
    /// Fund listings as an Excel workbook.
    FundsExcel,
    /// User directory as CSV.
    UsersCsv,
    /// User directory as an Excel workbook.
    UsersExcel,
    /// Analytics report as CSV.
    AnalyticsCsv,
    /// Analytics report as an Excel workbook.
    AnalyticsExcel,
}

impl JobType {
    /// Every export type, in declaration order.
    pub const ALL: [JobType; 6] = [
        JobType::FundsCsv,
        JobType::FundsExcel,
        JobType::UsersCsv,
        JobType::UsersExcel,
        JobType::AnalyticsCsv,
        JobType::AnalyticsExcel,
    ];

    /// Return the string form of this type, as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::FundsCsv => "funds-csv",
            JobType::FundsExcel => "funds-excel",
            JobType::UsersCsv => "users-csv",
            JobType::UsersExcel => "users-excel",
            JobType::AnalyticsCsv => "analytics-csv",
            JobType::AnalyticsExcel => "analytics-excel",
        }
    }

    /// The file format this export produces.
    pub fn format(&self) -> ExportFormat {
        match self {
            JobType::FundsCsv | JobType::UsersCsv | JobType::AnalyticsCsv => ExportFormat::Csv,
            JobType::FundsExcel | JobType::UsersExcel | JobType::AnalyticsExcel => {
                ExportFormat::Excel
            }
        }
    }
}

impl Display for JobType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown export type {s}")))
    }
}

/// The file format of an export artifact.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExportFormat {
    /// Comma-separated values
    Csv,
    /// An Office Open XML workbook
    Excel,
}

impl ExportFormat {
    /// The conventional file extension, without the leading dot.
    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Excel => "xlsx",
        }
    }

    /// The MIME type to serve the artifact with.
    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "text/csv",
            ExportFormat::Excel => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            }
        }
    }
}

/// The user who requested an export, and where to tell them when it's ready.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    /// The requesting user's ID.
    pub user_id: String,
    /// Contact address used by the [Notifier](crate::Notifier), usually an email address.
    pub contact: String,
}

impl Owner {
    /// Create a new owner.
    pub fn new(user_id: impl Into<String>, contact: impl Into<String>) -> Self {
        Owner {
            user_id: user_id.into(),
            contact: contact.into(),
        }
    }
}

/// What a requester is allowed to see.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Role {
    /// A regular user, who can only see their own jobs.
    User,
    /// An operator or administrator, who can see every job.
    Operator,
}

/// The already-authenticated caller of a status or cancel operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    /// The caller's user ID.
    pub user_id: String,
    /// The caller's role.
    pub role: Role,
}

impl Requester {
    /// A regular user.
    pub fn user(user_id: impl Into<String>) -> Self {
        Requester {
            user_id: user_id.into(),
            role: Role::User,
        }
    }

    /// An operator, who may access any job.
    pub fn operator(user_id: impl Into<String>) -> Self {
        Requester {
            user_id: user_id.into(),
            role: Role::Operator,
        }
    }

    /// Whether this requester may read or cancel `job`.
    pub fn can_access(&self, job: &JobRecord) -> bool {
        self.role == Role::Operator || job.owner.user_id == self.user_id
    }
}

/// Where a completed export ended up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExportResult {
    /// The artifact's file name.
    pub filename: String,
    /// The location returned by the [ArtifactStorage](crate::ArtifactStorage).
    pub location: String,
    /// How many rows the export contains.
    pub row_count: u64,
    /// The size of the artifact.
    pub byte_size: u64,
}

/// A job record, as stored in the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// The job's ID.
    pub id: Uuid,
    /// The name of the queue this job belongs to.
    pub queue_name: String,
    /// The kind of export.
    pub job_type: JobType,
    /// Who asked for the export.
    pub owner: Owner,
    /// The selection criteria passed to the export handler.
    pub payload: serde_json::Value,
    /// Where the job is in its lifecycle.
    pub status: JobState,
    /// Coarse progress: 0, 50, or 100.
    pub progress: u8,
    /// Higher priority jobs are swept first.
    pub priority: i32,
    /// The artifact, only present when the job has completed.
    pub result: Option<ExportResult>,
    /// Why the job failed, only present when the job has failed.
    pub error: Option<String>,
    /// The job becomes eligible for a sweep at this time.
    #[serde(with = "time::serde::timestamp")]
    pub scheduled_at: OffsetDateTime,
    /// When the job was submitted.
    #[serde(with = "time::serde::timestamp")]
    pub created_at: OffsetDateTime,
    /// When the job was claimed.
    #[serde(with = "time::serde::timestamp::option")]
    pub started_at: Option<OffsetDateTime>,
    /// When the job completed.
    #[serde(with = "time::serde::timestamp::option")]
    pub completed_at: Option<OffsetDateTime>,
    /// When the job failed.
    #[serde(with = "time::serde::timestamp::option")]
    pub failed_at: Option<OffsetDateTime>,
    /// When the job was cancelled.
    #[serde(with = "time::serde::timestamp::option")]
    pub cancelled_at: Option<OffsetDateTime>,
}

impl JobRecord {
    /// The time at which the job reached its terminal state, if it has.
    pub fn finished_at(&self) -> Option<OffsetDateTime> {
        match self.status {
            JobState::Completed => self.completed_at,
            JobState::Failed => self.failed_at,
            JobState::Cancelled => self.cancelled_at,
            JobState::Pending | JobState::Processing => None,
        }
    }
}

/// The information an [ExportHandler](crate::ExportHandler) receives about the job it is running.
#[derive(Debug, Clone)]
pub struct ExportTask {
    /// The job's ID.
    pub id: Uuid,
    /// The kind of export being run.
    pub job_type: JobType,
    /// Who asked for the export.
    pub owner: Owner,
    /// The selection criteria. Use [ExportTask::json_payload] to parse it into a concrete type.
    pub payload: serde_json::Value,
}

impl ExportTask {
    /// Deserialize the payload into a concrete type.
    pub fn json_payload<T: DeserializeOwned>(&self) -> Result<T> {
        T::deserialize(&self.payload).map_err(Error::PayloadError)
    }
}

impl From<&JobRecord> for ExportTask {
    fn from(job: &JobRecord) -> Self {
        ExportTask {
            id: job.id,
            job_type: job.job_type,
            owner: job.owner.clone(),
            payload: job.payload.clone(),
        }
    }
}
