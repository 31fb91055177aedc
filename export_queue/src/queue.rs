use std::{path::Path, sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tracing::{event, Level};

use crate::{
    dispatcher::Dispatcher,
    job_registry::ExportRegistry,
    log_error,
    notify::{LogNotifier, Notifier},
    pipeline::Pipeline,
    reaper::{spawn_periodic_reaper, Reaper, DEFAULT_RETENTION},
    shared_state::Time,
    storage::ArtifactStorage,
    store::{CachedJobRepository, JobRepository, SqliteJobRepository, DEFAULT_CACHE_CAPACITY},
    sweep::{spawn_periodic_sweep, StuckJobPolicy, Sweep, DEFAULT_SWEEP_BATCH_SIZE},
    Error, Result,
};

/// The queue name used when none is configured.
pub const DEFAULT_QUEUE_NAME: &str = "exports";

/// Options used to configure an [ExportQueue].
pub struct QueueOptions<'a> {
    path: &'a Path,
    registry: ExportRegistry,
    storage: Arc<dyn ArtifactStorage>,
    notifier: Arc<dyn Notifier>,
    queue_name: String,
    sweep_batch_size: usize,
    retention: Duration,
    dispatch_on_submit: bool,
    dispatch_channel_size: usize,
    cache_capacity: usize,
    stuck_job_policy: StuckJobPolicy,
    sweep_interval: Option<Duration>,
    reap_interval: Option<Duration>,
}

impl<'a> QueueOptions<'a> {
    /// Create a new options object for an [ExportQueue] stored at `path`, running jobs with the
    /// handlers in `registry` and storing artifacts in `storage`.
    pub fn new(
        path: &'a Path,
        registry: ExportRegistry,
        storage: Arc<dyn ArtifactStorage>,
    ) -> Self {
        QueueOptions {
            path,
            registry,
            storage,
            notifier: Arc::new(LogNotifier),
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            sweep_batch_size: DEFAULT_SWEEP_BATCH_SIZE,
            retention: DEFAULT_RETENTION,
            dispatch_on_submit: true,
            dispatch_channel_size: 100,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            stuck_job_policy: StuckJobPolicy::Ignore,
            sweep_interval: None,
            reap_interval: None,
        }
    }

    /// Set how requesters are told their export is ready. Defaults to [LogNotifier].
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Use a different queue name, so several queues can share a database file.
    pub fn queue_name(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = queue_name.into();
        self
    }

    /// The maximum number of jobs that a single sweep runs. Defaults to 5.
    pub fn sweep_batch_size(mut self, batch_size: usize) -> Self {
        self.sweep_batch_size = batch_size;
        self
    }

    /// How long to keep finished jobs before the reaper deletes them. Defaults to 7 days.
    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Whether to start running a job as soon as it's submitted. When false, jobs only run
    /// when a sweep finds them. Defaults to true.
    pub fn dispatch_on_submit(mut self, dispatch: bool) -> Self {
        self.dispatch_on_submit = dispatch;
        self
    }

    /// How many submitted jobs can wait for the dispatcher before further jobs are left for the
    /// sweep. Defaults to 100.
    pub fn dispatch_channel_size(mut self, size: usize) -> Self {
        self.dispatch_channel_size = size;
        self
    }

    /// How many jobs to hold in the in-process cache. Defaults to 10,000.
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// What sweeps do with jobs that have been processing for a long time. Defaults to
    /// [StuckJobPolicy::Ignore].
    pub fn stuck_job_policy(mut self, policy: StuckJobPolicy) -> Self {
        self.stuck_job_policy = policy;
        self
    }

    /// Run a sweep on this interval in a background task. By default no sweeps run unless
    /// [Sweep::run_once] is called.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    /// Run the reaper on this interval in a background task. By default the reaper only runs when
    /// [Reaper::run_once] is called.
    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = Some(interval);
        self
    }

    /// Build an [ExportQueue] from this options object.
    pub async fn build(self) -> Result<ExportQueue> {
        ExportQueue::with_options(self).await
    }
}

struct Tasks {
    close: tokio::sync::watch::Sender<()>,
    dispatcher: Option<JoinHandle<()>>,
    periodic: Vec<JoinHandle<()>>,
}

/// The export queue: the job store plus the tasks that run jobs.
pub struct ExportQueue {
    pub(crate) repo: Arc<CachedJobRepository<SqliteJobRepository>>,
    pub(crate) registry: ExportRegistry,
    pub(crate) dispatcher: Option<Dispatcher>,
    pub(crate) time: Time,
    pipeline: Arc<Pipeline>,
    sweep: Arc<Sweep>,
    reaper: Arc<Reaper>,
    tasks: std::sync::Mutex<Option<Tasks>>,
}

impl ExportQueue {
    /// Create a builder object for an ExportQueue.
    pub fn builder(
        path: &Path,
        registry: ExportRegistry,
        storage: Arc<dyn ArtifactStorage>,
    ) -> QueueOptions {
        QueueOptions::new(path, registry, storage)
    }

    /// Open or create an ExportQueue with the given [QueueOptions].
    pub async fn with_options(options: QueueOptions<'_>) -> Result<ExportQueue> {
        let time = Time::new();
        let sqlite = SqliteJobRepository::open(options.path, options.queue_name).await?;
        let repo = Arc::new(CachedJobRepository::with_capacity(
            sqlite,
            options.cache_capacity,
        ));
        let dyn_repo: Arc<dyn JobRepository> = repo.clone();

        let pipeline = Arc::new(Pipeline::new(
            dyn_repo.clone(),
            options.registry.clone(),
            options.storage,
            options.notifier,
            time.clone(),
        ));
        let sweep = Arc::new(Sweep::new(
            dyn_repo.clone(),
            pipeline.clone(),
            options.sweep_batch_size,
            options.stuck_job_policy,
            time.clone(),
        ));
        let reaper = Arc::new(Reaper::new(dyn_repo, options.retention, time.clone()));

        let (close_tx, close_rx) = tokio::sync::watch::channel(());

        let (dispatcher, dispatcher_task) = if options.dispatch_on_submit {
            let (dispatcher, task) = Dispatcher::start(
                pipeline.clone(),
                options.dispatch_channel_size,
                close_rx.clone(),
            );
            (Some(dispatcher), Some(task))
        } else {
            (None, None)
        };

        let mut periodic = Vec::new();
        if let Some(interval) = options.sweep_interval {
            periodic.push(spawn_periodic_sweep(
                sweep.clone(),
                interval,
                close_rx.clone(),
            ));
        }
        if let Some(interval) = options.reap_interval {
            periodic.push(spawn_periodic_reaper(reaper.clone(), interval, close_rx));
        }

        Ok(ExportQueue {
            repo,
            registry: options.registry,
            dispatcher,
            time,
            pipeline,
            sweep,
            reaper,
            tasks: std::sync::Mutex::new(Some(Tasks {
                close: close_tx,
                dispatcher: dispatcher_task,
                periodic,
            })),
        })
    }

    /// The job store, including its in-process cache.
    pub fn repository(&self) -> &CachedJobRepository<SqliteJobRepository> {
        &self.repo
    }

    /// The pipeline that runs jobs.
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// The sweep. Call [Sweep::run_once] from an external scheduler, or set
    /// [QueueOptions::sweep_interval] to have the queue run it.
    pub fn sweep(&self) -> &Sweep {
        &self.sweep
    }

    /// The reaper. Call [Reaper::run_once] from an external scheduler, or set
    /// [QueueOptions::reap_interval] to have the queue run it.
    pub fn reaper(&self) -> &Reaper {
        &self.reaper
    }

    async fn close_internal(
        tasks: Tasks,
        repo: Arc<CachedJobRepository<SqliteJobRepository>>,
        timeout: Duration,
    ) -> Result<()> {
        tasks.close.send(()).ok();

        // Background tasks only see the close signal between runs, so a run in progress finishes
        // first.
        let wait_for_tasks = async {
            for task in tasks.periodic {
                log_error(task.await);
            }
            if let Some(dispatcher) = tasks.dispatcher {
                dispatcher.await?;
            }
            Ok::<_, Error>(())
        };

        let res = match tokio::time::timeout(timeout, wait_for_tasks).await {
            Ok(res) => res,
            Err(_) => {
                event!(Level::WARN, "timed out waiting for running jobs");
                Err(Error::Timeout)
            }
        };

        repo.inner().close().await;
        res
    }

    /// Stop accepting new dispatches, wait up to `timeout` for running jobs to finish, and close
    /// the database.
    pub async fn close(&self, timeout: Duration) -> Result<()> {
        let tasks = {
            let mut tasks_holder = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks_holder.take()
        };

        if let Some(tasks) = tasks {
            Self::close_internal(tasks, self.repo.clone(), timeout).await?;
        }

        Ok(())
    }
}

impl Drop for ExportQueue {
    /// Try to close the queue cleanly as it's dropped.
    fn drop(&mut self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tasks) = tasks.take() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(Self::close_internal(
                    tasks,
                    self.repo.clone(),
                    Duration::from_secs(60),
                ));
            }
        }
    }
}
