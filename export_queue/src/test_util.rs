use std::{
    fmt::Display,
    path::PathBuf,
    sync::{atomic::AtomicBool, Arc, Mutex},
    time::Duration,
};

use ahash::HashMap;
use async_trait::async_trait;
use eyre::eyre;
use futures::Future;
use once_cell::sync::Lazy;
use temp_dir::TempDir;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    shared_state::{truncate_to_millis, Time},
    ArtifactStorage, Error, ExportNotice, ExportOutput, ExportQueue, ExportRegistry, ExportResult,
    ExportTask, JobRecord, JobState, JobType, Notifier, Owner, QueueOptions, Requester,
};

/// Runs immediately and succeeds, producing `payload.rows` rows.
pub const SUCCEEDS: JobType = JobType::FundsCsv;
/// Succeeds once [TestContext::release_slow_jobs] is called.
pub const SLOW: JobType = JobType::FundsExcel;
/// Always returns an error.
pub const FAILS: JobType = JobType::UsersCsv;
/// Always panics.
pub const PANICS: JobType = JobType::UsersExcel;
/// Has no handler in the test registry.
pub const UNREGISTERED: JobType = JobType::AnalyticsExcel;

#[derive(Debug)]
pub struct TestContext {
    invocations: Mutex<Vec<Uuid>>,
    release_rx: tokio::sync::watch::Receiver<bool>,
    release_tx: tokio::sync::watch::Sender<bool>,
}

impl TestContext {
    pub fn new() -> Arc<TestContext> {
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);
        Arc::new(TestContext {
            invocations: Mutex::new(Vec::new()),
            release_rx,
            release_tx,
        })
    }

    /// The IDs of the jobs that handlers were called for, in call order.
    pub fn invocations(&self) -> Vec<Uuid> {
        self.invocations.lock().unwrap().clone()
    }

    /// Let every current and future [SLOW] job finish.
    pub fn release_slow_jobs(&self) {
        self.release_tx.send_replace(true);
    }

    fn record(&self, id: Uuid) {
        self.invocations.lock().unwrap().push(id);
    }
}

fn rows_output(task: &ExportTask) -> ExportOutput {
    let rows = task.payload["rows"].as_u64().unwrap_or(1);
    let mut content = String::from("id\n");
    for i in 0..rows {
        content.push_str(&format!("{i}\n"));
    }

    ExportOutput {
        content: content.into_bytes(),
        filename: format!("{}-{}.{}", task.job_type, task.id, task.job_type.format().extension()),
        row_count: rows,
    }
}

pub fn test_registry(context: Arc<TestContext>) -> ExportRegistry {
    let mut registry = ExportRegistry::new();

    let ctx = context.clone();
    registry.add_fn(SUCCEEDS, move |task: ExportTask| {
        let ctx = ctx.clone();
        async move {
            ctx.record(task.id);
            Ok::<_, eyre::Report>(rows_output(&task))
        }
    });

    let ctx = context.clone();
    registry.add_fn(SLOW, move |task: ExportTask| {
        let ctx = ctx.clone();
        async move {
            ctx.record(task.id);
            let mut release_rx = ctx.release_rx.clone();
            while !*release_rx.borrow_and_update() {
                release_rx.changed().await?;
            }
            Ok::<_, eyre::Report>(rows_output(&task))
        }
    });

    let ctx = context.clone();
    registry.add_fn(FAILS, move |task: ExportTask| {
        let ctx = ctx.clone();
        async move {
            ctx.record(task.id);
            Err::<ExportOutput, _>(eyre!("database unavailable"))
        }
    });

    let ctx = context;
    registry.add_fn(PANICS, move |task: ExportTask| {
        let ctx = ctx.clone();
        async move {
            ctx.record(task.id);
            if task.payload.is_null() {
                panic!("handler exploded");
            }
            Ok::<_, eyre::Report>(rows_output(&task))
        }
    });

    registry
}

/// Keeps artifacts in memory.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    pub fail: AtomicBool,
    pub panic: AtomicBool,
    artifacts: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn get(&self, location: &str) -> Option<Vec<u8>> {
        self.artifacts.lock().unwrap().get(location).cloned()
    }
}

#[async_trait]
impl ArtifactStorage for MemoryStorage {
    async fn store(&self, job_id: Uuid, filename: &str, content: &[u8]) -> eyre::Result<String> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(eyre!("bucket is read-only"));
        }
        if self.panic.load(std::sync::atomic::Ordering::SeqCst) {
            panic!("storage client crashed");
        }

        let location = format!("memory://{job_id}/{filename}");
        self.artifacts
            .lock()
            .unwrap()
            .insert(location.clone(), content.to_vec());
        Ok(location)
    }
}

/// Remembers every notice it is asked to send.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    pub fail: AtomicBool,
    pub panic: AtomicBool,
    notices: Mutex<Vec<(String, ExportNotice)>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<(String, ExportNotice)> {
        self.notices.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, contact: &str, notice: &ExportNotice) -> eyre::Result<()> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(eyre!("mail server down"));
        }
        if self.panic.load(std::sync::atomic::Ordering::SeqCst) {
            panic!("mail client crashed");
        }

        self.notices
            .lock()
            .unwrap()
            .push((contact.to_string(), notice.clone()));
        Ok(())
    }
}

pub(crate) struct TestEnvironment {
    pub queue: ExportQueue,
    pub time: Time,
    pub context: Arc<TestContext>,
    pub storage: Arc<MemoryStorage>,
    pub notifier: Arc<RecordingNotifier>,
    pub path: PathBuf,
    #[allow(dead_code)]
    dir: TempDir,
}

impl TestEnvironment {
    /// A queue that dispatches jobs as soon as they're submitted.
    pub async fn new() -> Self {
        Self::with_options(|options| options).await
    }

    /// A queue whose jobs only run when a sweep is triggered.
    pub async fn sweep_only() -> Self {
        Self::with_options(|options| options.dispatch_on_submit(false)).await
    }

    pub async fn with_options(
        configure: impl for<'a> FnOnce(QueueOptions<'a>) -> QueueOptions<'a>,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        Self::from_path(dir, TestContext::new(), configure).await
    }

    async fn from_path(
        dir: TempDir,
        context: Arc<TestContext>,
        configure: impl for<'a> FnOnce(QueueOptions<'a>) -> QueueOptions<'a>,
    ) -> Self {
        Lazy::force(&TRACING);
        let path = dir.child("test.sqlite");
        let storage = Arc::new(MemoryStorage::default());
        let notifier = Arc::new(RecordingNotifier::default());

        let options = ExportQueue::builder(&path, test_registry(context.clone()), storage.clone())
            .notifier(notifier.clone());
        let queue = configure(options).build().await.expect("creating queue");

        TestEnvironment {
            time: queue.time.clone(),
            queue,
            context,
            storage,
            notifier,
            path,
            dir,
        }
    }

    /// Close the queue and open the same database again in sweep-only mode, as a restarted
    /// process would.
    pub async fn restart(self) -> Self {
        self.queue
            .close(Duration::from_secs(5))
            .await
            .expect("closing queue");
        let TestEnvironment {
            queue,
            context,
            dir,
            ..
        } = self;
        drop(queue);

        Self::from_path(dir, context, |options| options.dispatch_on_submit(false)).await
    }

    /// Open another queue on the same database, as a second process would. Its handlers record
    /// into the same [TestContext].
    pub async fn open_second_queue(
        &self,
        configure: impl for<'a> FnOnce(QueueOptions<'a>) -> QueueOptions<'a>,
    ) -> ExportQueue {
        let options = ExportQueue::builder(
            &self.path,
            test_registry(self.context.clone()),
            self.storage.clone(),
        );
        configure(options)
            .build()
            .await
            .expect("opening second queue")
    }
}

pub fn pending_record(job_type: JobType, owner: Owner) -> JobRecord {
    let now = truncate_to_millis(OffsetDateTime::now_utc());
    JobRecord {
        id: Uuid::now_v7(),
        queue_name: crate::queue::DEFAULT_QUEUE_NAME.to_string(),
        job_type,
        owner,
        payload: serde_json::Value::Null,
        status: JobState::Pending,
        progress: 0,
        priority: 0,
        result: None,
        error: None,
        scheduled_at: now,
        created_at: now,
        started_at: None,
        completed_at: None,
        failed_at: None,
        cancelled_at: None,
    }
}

/// A job that reached `state` at `finished_at`.
pub fn finished_record(
    job_type: JobType,
    owner: Owner,
    state: JobState,
    finished_at: OffsetDateTime,
) -> JobRecord {
    let finished_at = truncate_to_millis(finished_at);
    let started_at = finished_at - time::Duration::minutes(1);

    let mut job = pending_record(job_type, owner);
    job.status = state;
    job.created_at = started_at - time::Duration::minutes(1);
    job.scheduled_at = job.created_at;

    match state {
        JobState::Completed => {
            job.progress = 100;
            job.started_at = Some(started_at);
            job.completed_at = Some(finished_at);
            job.result = Some(ExportResult {
                filename: format!("{job_type}.{}", job_type.format().extension()),
                location: format!("memory://{}", job.id),
                row_count: 1,
                byte_size: 5,
            });
        }
        JobState::Failed => {
            job.progress = 50;
            job.started_at = Some(started_at);
            job.failed_at = Some(finished_at);
            job.error = Some("Export failed: test".to_string());
        }
        JobState::Cancelled => {
            job.cancelled_at = Some(finished_at);
        }
        JobState::Pending | JobState::Processing => panic!("{state} is not a finished state"),
    }

    job
}

pub async fn wait_for<F, Fut, T, E>(label: impl Display, f: F) -> T
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    wait_for_timeout(label, Duration::from_secs(5), f).await
}

pub async fn wait_for_timeout<F, Fut, T, E>(label: impl Display, timeout: Duration, f: F) -> T
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_check = 1000;
    let mut check_interval = 10;
    let start_time = OffsetDateTime::now_utc();
    let final_time = start_time + timeout;
    let mut last_error: E;

    loop {
        tokio::task::yield_now().await;
        match f().await {
            Ok(value) => return value,
            Err(e) => {
                tracing::trace!(%label, %e, "Checking... not ready yet");
                last_error = e;
            }
        };

        let now = OffsetDateTime::now_utc();
        if now >= final_time {
            panic!(
                "Timed out waiting for {} after {}ms: {}",
                label,
                timeout.as_millis(),
                last_error
            );
        }

        check_interval = std::cmp::min(check_interval * 2, max_check);
        let sleep_time = std::cmp::min(
            (final_time - now).whole_milliseconds() as u64,
            check_interval,
        );

        tokio::time::sleep(Duration::from_millis(sleep_time)).await;
    }
}

pub async fn wait_for_job_status(
    label: impl Display,
    queue: &ExportQueue,
    job_id: Uuid,
    desired_status: JobState,
) -> JobRecord {
    let requester = Requester::operator("test");
    wait_for(label, || async {
        let job = match queue.get_status(job_id, &requester).await {
            Ok(job) => job,
            Err(Error::NotFound) => return Err("Job not found".to_string()),
            Err(e) => panic!("{}", e),
        };

        if job.status == desired_status {
            Ok(job)
        } else if job.status.is_terminal() {
            panic!("job reached {} while waiting for {desired_status}", job.status);
        } else {
            Err(format!("job status {}", job.status))
        }
    })
    .await
}

pub static TRACING: Lazy<()> = Lazy::new(|| {
    if std::env::var("TEST_LOG").is_ok() {
        configure_tracing();
    }
});

fn configure_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    let tree = tracing_tree::HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);

    let subscriber = tracing_subscriber::Registry::default().with(tree);

    tracing::subscriber::set_global_default(subscriber).unwrap();
}
