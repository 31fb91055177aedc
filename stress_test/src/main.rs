use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use clap::Parser;
use eyre::{eyre, Result};
use export_queue::{
    DirectoryStorage, ExportOutput, ExportQueue, ExportRegistry, ExportTask, JobState, JobType,
    Owner, Requester, SweepReport,
};
use futures::future::try_join_all;
use temp_dir::TempDir;
use tracing::{event, Level};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter};
use uuid::Uuid;

#[derive(Parser, Debug)]
struct Args {
    #[arg(short, long, default_value_t = 2000)]
    num_jobs: usize,

    /// How many queues to open on the database. Each one sweeps independently.
    #[arg(long, default_value_t = 4)]
    num_queues: usize,

    #[arg(long, default_value_t = 20)]
    sweep_batch_size: usize,

    #[arg(long, default_value_t = 4)]
    num_submit_tasks: usize,

    /// Let the first queue also dispatch jobs as they are submitted, so dispatch and sweeps race.
    #[arg(long)]
    dispatch: bool,
}

type Invocations = Arc<Mutex<HashMap<Uuid, u32>>>;

fn registry(invocations: Invocations) -> ExportRegistry {
    let mut registry = ExportRegistry::new();
    registry.add_fn(JobType::FundsCsv, move |task: ExportTask| {
        let invocations = invocations.clone();
        async move {
            *invocations
                .lock()
                .map_err(|_| eyre!("invocation map poisoned"))?
                .entry(task.id)
                .or_default() += 1;

            Ok::<_, eyre::Report>(ExportOutput {
                content: format!("id\n{}\n", task.id).into_bytes(),
                filename: "funds.csv".to_string(),
                row_count: 1,
            })
        }
    });
    registry
}

async fn submit_task(queue: Arc<ExportQueue>, count: usize, owner: usize) -> Result<Vec<Uuid>> {
    let owner = Owner::new(format!("user-{owner}"), format!("user-{owner}@example.com"));
    let mut ids = Vec::with_capacity(count);
    for _ in 0..count {
        let job = queue
            .submit(JobType::FundsCsv, serde_json::Value::Null, owner.clone())
            .await?;
        ids.push(job.id);
    }
    Ok(ids)
}

async fn sweep_task(queue: Arc<ExportQueue>, submitting: Arc<AtomicBool>) -> Result<usize> {
    let mut executed = 0;
    loop {
        // Checked before sweeping so a job submitted mid-sweep is never missed.
        let done_submitting = !submitting.load(Ordering::SeqCst);
        let report = queue.sweep().run_once().await?;
        if report.errors > 0 {
            return Err(eyre!("sweep hit {} repository errors", report.errors));
        }

        executed += report.executed();
        if report == SweepReport::default() {
            if done_submitting {
                return Ok(executed);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn run() -> Result<()> {
    let args = Args::parse();

    let tree = tracing_tree::HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);
    let env_filter = EnvFilter::try_from_env("LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let subscriber = tracing_subscriber::Registry::default()
        .with(env_filter)
        .with(tree);
    tracing::subscriber::set_global_default(subscriber)?;

    let dir = TempDir::new()?;
    let path = dir.path().join("exports.db");
    let storage = Arc::new(DirectoryStorage::new(dir.path().join("artifacts")));
    let invocations = Invocations::default();

    let mut queues = Vec::with_capacity(args.num_queues);
    for i in 0..args.num_queues.max(1) {
        let queue = ExportQueue::builder(&path, registry(invocations.clone()), storage.clone())
            .dispatch_on_submit(args.dispatch && i == 0)
            .sweep_batch_size(args.sweep_batch_size)
            .build()
            .await?;
        queues.push(Arc::new(queue));
    }

    let start = tokio::time::Instant::now();
    let submitting = Arc::new(AtomicBool::new(true));
    let per_task = args.num_jobs / args.num_submit_tasks.max(1);

    let sweeps = queues
        .iter()
        .map(|queue| tokio::spawn(sweep_task(queue.clone(), submitting.clone())))
        .collect::<Vec<_>>();

    let submits = (0..args.num_submit_tasks.max(1))
        .map(|i| tokio::spawn(submit_task(queues[0].clone(), per_task, i)))
        .collect::<Vec<_>>();

    let mut ids = Vec::with_capacity(args.num_jobs);
    for submitted in try_join_all(submits).await? {
        ids.extend(submitted?);
    }
    submitting.store(false, Ordering::SeqCst);

    let mut swept = 0;
    for executed in try_join_all(sweeps).await? {
        swept += executed?;
    }

    // Dispatched jobs may still be running once the sweeps find nothing left to claim.
    for queue in &queues {
        queue.close(Duration::from_secs(600)).await?;
    }

    let elapsed = start.elapsed();
    println!(
        "Ran {} jobs in {:.2}s ({swept} by sweeps)",
        ids.len(),
        elapsed.as_secs_f64()
    );

    println!("Verifying results...");
    let operator = Requester::operator("stress-test");
    let reader = ExportQueue::builder(&path, registry(Invocations::default()), storage.clone())
        .dispatch_on_submit(false)
        .build()
        .await?;
    let counts = invocations
        .lock()
        .map_err(|_| eyre!("invocation map poisoned"))?
        .clone();

    for id in &ids {
        let job = reader.get_status(*id, &operator).await?;
        if job.status != JobState::Completed {
            return Err(eyre!("job {id} finished as {}", job.status));
        }

        match counts.get(id) {
            Some(1) => {}
            Some(n) => return Err(eyre!("job {id} ran {n} times")),
            None => return Err(eyre!("job {id} never ran")),
        }
    }

    event!(Level::INFO, checked = ids.len(), "verified");
    println!("{} jobs ok", ids.len());

    reader.close(Duration::from_secs(60)).await?;
    Ok(())
}

#[cfg(not(feature = "rt-multi-thread"))]
#[tokio::main(flavor = "current_thread")]
pub async fn main() -> Result<()> {
    color_eyre::install()?;
    run().await
}

#[cfg(feature = "rt-multi-thread")]
#[tokio::main(flavor = "multi_thread")]
pub async fn main() -> Result<()> {
    color_eyre::install()?;
    run().await
}
