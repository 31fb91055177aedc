use deadpool_sqlite::InteractError;

use crate::job_status::JobState;

/// A [std::result::Result] whose error type defaults to [Error].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can be returned from the queue.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The submitted export request was not acceptable, for example because no handler is
    /// registered for its type.
    #[error("Invalid export request: {0}")]
    Validation(String),
    /// The job ID was not found.
    #[error("Job not found")]
    NotFound,
    /// The requester is neither the owner of the job nor an operator.
    #[error("Not allowed to access this job")]
    Forbidden,
    /// A state change was requested that the job state machine does not allow.
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        /// The state the transition expected to start from.
        from: JobState,
        /// The requested target state.
        to: JobState,
    },
    /// An error occurred while updating the database to a new schema version.
    #[error("Migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),
    /// An error occurred while opening the database.
    #[error("Error opening database: {0}")]
    OpenDatabase(eyre::Report),
    /// Failed to acquire a database connection for reading.
    #[error("Error acquiring database connection: {0}")]
    PoolError(#[from] deadpool_sqlite::PoolError),
    /// Encountered an error communicating with the database.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// The database contained invalid data.
    #[error("Unexpected value type for {1}: {0}")]
    ColumnType(#[source] rusqlite::Error, &'static str),
    /// An internal task panicked.
    #[error("Internal error: {0}")]
    Panic(#[from] tokio::task::JoinError),
    /// An internal error occurred while reading the database.
    #[error("Internal error: {0}")]
    DbInteract(String),
    /// A job had an unknown state value
    #[error("Invalid job state {0}")]
    InvalidJobState(String),
    /// A stored job had an export type that this build does not know about.
    #[error("Invalid job type {0}")]
    InvalidJobType(String),
    /// Failed to serialize or deserialize a job payload
    #[error("Error processing payload: {0}")]
    PayloadError(serde_json::Error),
    /// Invalid value for a job timestamp
    #[error("Timestamp {0} out of range")]
    TimestampOutOfRange(&'static str),
    /// The operation timed out. This is mostly used when the queue fails to shut down in a timely
    /// fashion.
    #[error("Timed out")]
    Timeout,
    /// Indicates that the queue has closed, and so the attempted operation could not be completed.
    #[error("Queue closed unexpectedly")]
    QueueClosed,
}

impl From<InteractError> for Error {
    fn from(e: InteractError) -> Self {
        Error::DbInteract(e.to_string())
    }
}

impl Error {
    pub(crate) fn open_database(err: impl Into<eyre::Report>) -> Self {
        Error::OpenDatabase(err.into())
    }
}

/// The reason a claimed job failed. These are never returned to the submitter; they are recorded
/// into the job's `error` field and observed by polling the job's status.
#[derive(thiserror::Error, Debug)]
pub enum ExecutionError {
    /// No export handler was registered for the job's type when it ran.
    #[error("No export handler registered for {0}")]
    UnregisteredType(crate::JobType),
    /// The export handler returned an error.
    #[error("Export failed: {0}")]
    Handler(String),
    /// The export handler panicked.
    #[error("Export panicked: {0}")]
    Panic(String),
    /// The artifact could not be written to storage.
    #[error("Failed to store artifact: {0}")]
    Storage(String),
    /// The job was left in the processing state for longer than the configured limit.
    #[error("Abandoned while processing")]
    Abandoned,
}
