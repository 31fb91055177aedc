//! Submits a few user exports, then polls until each one reaches a terminal state. Artifacts are
//! written under `export-queue-example/`.

use std::{path::Path, sync::Arc, time::Duration};

use export_queue::{
    DirectoryStorage, ExportOutput, ExportQueue, ExportRegistry, ExportTask, JobType, Owner,
    Requester,
};
use serde::Deserialize;
use tracing_subscriber::{layer::SubscriberExt, EnvFilter};

const USERS: &[(u32, &str, bool)] = &[
    (1, "alice", true),
    (2, "bob", false),
    (3, "carol", true),
    (4, "dave", true),
];

#[derive(Debug, Deserialize)]
struct UserFilter {
    #[serde(default)]
    active_only: bool,
}

async fn users_csv(task: ExportTask) -> Result<ExportOutput, eyre::Report> {
    let filter: UserFilter = task.json_payload()?;

    // Stand-in for a slow query.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let mut csv = String::from("id,name\n");
    let mut rows = 0;
    for (id, name, active) in USERS {
        if filter.active_only && !active {
            continue;
        }
        csv.push_str(&format!("{id},{name}\n"));
        rows += 1;
    }

    Ok(ExportOutput {
        content: csv.into_bytes(),
        filename: format!("users-{}.csv", task.id),
        row_count: rows,
    })
}

async fn analytics_csv(_task: ExportTask) -> Result<ExportOutput, eyre::Report> {
    Err(eyre::eyre!("analytics warehouse is offline"))
}

#[tokio::main(flavor = "current_thread")]
pub async fn main() -> Result<(), eyre::Report> {
    color_eyre::install()?;

    let tree = tracing_tree::HierarchicalLayer::new(2)
        .with_targets(true)
        .with_bracketed_fields(true);
    let env_filter = EnvFilter::try_from_env("LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = tracing_subscriber::Registry::default()
        .with(env_filter)
        .with(tree);
    tracing::subscriber::set_global_default(subscriber)?;

    let mut registry = ExportRegistry::new();
    registry
        .add_fn(JobType::UsersCsv, users_csv)
        .add_fn(JobType::AnalyticsCsv, analytics_csv);

    let storage = Arc::new(DirectoryStorage::new("export-queue-example"));
    let queue = ExportQueue::builder(Path::new("export-queue-example.db"), registry, storage)
        .sweep_interval(Duration::from_secs(5))
        .reap_interval(Duration::from_secs(3600))
        .build()
        .await?;

    let owner = Owner::new("user-1", "user-1@example.com");
    let jobs = vec![
        queue
            .submit(
                JobType::UsersCsv,
                serde_json::json!({ "active_only": true }),
                owner.clone(),
            )
            .await?,
        queue
            .submit(JobType::UsersCsv, serde_json::json!({}), owner.clone())
            .await?,
        queue
            .submit(JobType::AnalyticsCsv, serde_json::json!({}), owner.clone())
            .await?,
    ];

    // Excel exports have no handler here, so they are turned away at submission.
    let rejected = queue
        .submit(JobType::UsersExcel, serde_json::json!({}), owner.clone())
        .await;
    println!("users-excel submission: {}", rejected.unwrap_err());

    let requester = Requester::user("user-1");
    for job in jobs {
        loop {
            let status = queue.get_status(job.id, &requester).await?;
            if !status.status.is_terminal() {
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }

            match (&status.result, &status.error) {
                (Some(result), _) => println!(
                    "{} {}: {} rows at {}",
                    status.job_type, status.status, result.row_count, result.location
                ),
                (None, Some(error)) => {
                    println!("{} {}: {error}", status.job_type, status.status)
                }
                (None, None) => println!("{} {}", status.job_type, status.status),
            }
            break;
        }
    }

    let listed = queue.list_for_owner("user-1", 10).await?;
    println!("user-1 has {} jobs on record", listed.len());

    queue.close(Duration::from_secs(5)).await?;
    Ok(())
}
