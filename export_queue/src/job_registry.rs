use std::{fmt::Debug, sync::Arc};

use ahash::HashMap;
use async_trait::async_trait;
use futures::Future;

use crate::{ExportTask, JobType};

/// The artifact produced by an [ExportHandler].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportOutput {
    /// The serialized rows.
    pub content: Vec<u8>,
    /// The file name to store the artifact under.
    pub filename: String,
    /// How many rows were exported.
    pub row_count: u64,
}

/// Turns an export request into bytes. Implementations run the query described by the task's
/// payload and serialize the rows in the format of the task's [JobType].
///
/// Returning an error, or panicking, marks the job as failed.
#[async_trait]
pub trait ExportHandler: Send + Sync + 'static {
    /// Produce the artifact for `task`.
    async fn export(&self, task: &ExportTask) -> eyre::Result<ExportOutput>;
}

/// An [ExportHandler] backed by a function or closure. Usually created through
/// [ExportRegistry::add_fn].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> ExportHandler for FnHandler<F>
where
    F: Fn(ExportTask) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = eyre::Result<ExportOutput>> + Send,
{
    async fn export(&self, task: &ExportTask) -> eyre::Result<ExportOutput> {
        (self.0)(task.clone()).await
    }
}

/// The table of export handlers, one per [JobType].
///
/// Submissions for a type with no handler are rejected, so register every type the application
/// wants to offer before building the queue.
///
/// ```
/// # use export_queue::*;
/// let mut registry = ExportRegistry::new();
/// registry.add_fn(JobType::UsersCsv, |task: ExportTask| async move {
///     Ok::<_, eyre::Report>(ExportOutput {
///         content: b"id,name\n1,alice\n".to_vec(),
///         filename: format!("users-{}.csv", task.id),
///         row_count: 1,
///     })
/// });
///
/// assert!(registry.contains(JobType::UsersCsv));
/// assert!(!registry.contains(JobType::UsersExcel));
/// ```
#[derive(Clone, Default)]
pub struct ExportRegistry {
    handlers: HashMap<JobType, Arc<dyn ExportHandler>>,
}

impl ExportRegistry {
    /// Create an empty registry.
    pub fn new() -> ExportRegistry {
        Self::default()
    }

    /// Register the handler for `job_type`.
    ///
    /// Panics if the type already has a handler.
    pub fn add(&mut self, job_type: JobType, handler: impl ExportHandler) -> &mut Self {
        self.handlers
            .entry(job_type)
            .and_modify(|_| {
                panic!("Export handler for {job_type} already exists");
            })
            .or_insert_with(|| Arc::new(handler));
        self
    }

    /// Register an async function or closure as the handler for `job_type`.
    ///
    /// Panics if the type already has a handler.
    pub fn add_fn<F, Fut>(&mut self, job_type: JobType, f: F) -> &mut Self
    where
        F: Fn(ExportTask) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = eyre::Result<ExportOutput>> + Send,
    {
        self.add(job_type, FnHandler(f))
    }

    /// The handler for `job_type`, if one is registered.
    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn ExportHandler>> {
        self.handlers.get(&job_type).cloned()
    }

    /// Whether `job_type` has a handler.
    pub fn contains(&self, job_type: JobType) -> bool {
        self.handlers.contains_key(&job_type)
    }

    /// The registered types, in declaration order.
    pub fn job_types(&self) -> Vec<JobType> {
        JobType::ALL
            .into_iter()
            .filter(|t| self.contains(*t))
            .collect()
    }
}

impl Debug for ExportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}
