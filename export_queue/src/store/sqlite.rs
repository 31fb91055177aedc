use std::{path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use rusqlite::{Connection, Row};
use smallvec::SmallVec;
use time::OffsetDateTime;
use tracing::{event, instrument, Level, Span};
use uuid::Uuid;

use super::{JobRepository, Transition};
use crate::{
    db_writer::{
        add_job::AddJobArgs, db_writer_worker, delete_finished::DeleteFinishedArgs,
        transition::TransitionJobArgs, DbOperation, DbOperationType,
    },
    log_error,
    shared_state::{from_db_time, to_db_time, SharedState, SharedStateData},
    Error, ExportResult, JobRecord, JobType, Owner, Result,
};

pub(crate) const JOB_COLUMNS: &str = r##"external_id, queue_name, job_type, owner_id,
    owner_contact, payload, status, progress, priority, scheduled_at, created_at, started_at,
    completed_at, failed_at, cancelled_at, last_error, result_filename, result_location,
    result_row_count, result_byte_size"##;

fn optional_time(row: &Row, idx: usize, column: &'static str) -> Result<Option<OffsetDateTime>> {
    row.get_ref(idx)?
        .as_i64_or_null()
        .map_err(|e| Error::ColumnType(e.into(), column))?
        .map(|t| from_db_time(t, column))
        .transpose()
}

/// Read a job from a row that selected [JOB_COLUMNS].
pub(crate) fn job_from_row(row: &Row) -> Result<JobRecord> {
    let payload = row
        .get_ref(5)?
        .as_str()
        .map_err(|e| Error::ColumnType(e.into(), "payload"))?;
    let payload = serde_json::from_str(payload).map_err(Error::PayloadError)?;

    let job_type = row
        .get_ref(2)?
        .as_str()
        .map_err(|e| Error::ColumnType(e.into(), "job_type"))?;
    let job_type = job_type
        .parse::<JobType>()
        .map_err(|_| Error::InvalidJobType(job_type.to_string()))?;

    let result_filename: Option<String> = row
        .get(16)
        .map_err(|e| Error::ColumnType(e, "result_filename"))?;
    let result = match result_filename {
        Some(filename) => Some(ExportResult {
            filename,
            location: row
                .get(17)
                .map_err(|e| Error::ColumnType(e, "result_location"))?,
            row_count: row
                .get::<_, i64>(18)
                .map_err(|e| Error::ColumnType(e, "result_row_count"))? as u64,
            byte_size: row
                .get::<_, i64>(19)
                .map_err(|e| Error::ColumnType(e, "result_byte_size"))? as u64,
        }),
        None => None,
    };

    Ok(JobRecord {
        id: row.get(0).map_err(|e| Error::ColumnType(e, "id"))?,
        queue_name: row.get(1).map_err(|e| Error::ColumnType(e, "queue_name"))?,
        job_type,
        owner: Owner {
            user_id: row.get(3).map_err(|e| Error::ColumnType(e, "owner_id"))?,
            contact: row
                .get(4)
                .map_err(|e| Error::ColumnType(e, "owner_contact"))?,
        },
        payload,
        status: row
            .get_ref(6)?
            .as_str()
            .map_err(|e| Error::ColumnType(e.into(), "status"))?
            .parse()?,
        progress: row.get(7).map_err(|e| Error::ColumnType(e, "progress"))?,
        priority: row.get(8).map_err(|e| Error::ColumnType(e, "priority"))?,
        scheduled_at: from_db_time(row.get(9)?, "scheduled_at")?,
        created_at: from_db_time(row.get(10)?, "created_at")?,
        started_at: optional_time(row, 11, "started_at")?,
        completed_at: optional_time(row, 12, "completed_at")?,
        failed_at: optional_time(row, 13, "failed_at")?,
        cancelled_at: optional_time(row, 14, "cancelled_at")?,
        error: row.get(15).map_err(|e| Error::ColumnType(e, "last_error"))?,
        result,
    })
}

/// A [JobRepository] stored in a SQLite database.
///
/// All writes go through a single writer thread, which applies them inside transactions. Reads
/// use a separate connection pool so they won't block the writes.
pub struct SqliteJobRepository {
    state: SharedState,
    db_write_worker: std::sync::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl SqliteJobRepository {
    /// Open or create a job database at the given path. Only jobs belonging to `queue_name`
    /// are visible through this repository.
    pub async fn open(path: &Path, queue_name: impl Into<String>) -> Result<Self> {
        let queue_name = queue_name.into();

        let mut conn = Connection::open(path).map_err(Error::open_database)?;
        // Setting the journal mode returns the new mode as a row.
        let journal_mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "wal", |row| row.get(0))
            .map_err(Error::open_database)?;
        if !journal_mode.eq_ignore_ascii_case("wal") {
            event!(Level::WARN, %journal_mode, "database is not in WAL mode");
        }
        conn.pragma_update(None, "synchronous", "normal")
            .map_err(Error::open_database)?;

        crate::migrations::migrate(&mut conn)?;

        let read_conn_pool = deadpool_sqlite::Config::new(path)
            .builder(deadpool_sqlite::Runtime::Tokio1)
            .map_err(Error::open_database)?
            .recycle_timeout(Some(Duration::from_secs(5 * 60)))
            .build()
            .map_err(Error::open_database)?;

        let (db_write_tx, db_write_rx) = tokio::sync::mpsc::channel(50);

        let state = SharedState(Arc::new(SharedStateData {
            queue_name: queue_name.clone(),
            db_write_tx,
            read_conn_pool,
        }));

        let db_write_worker =
            std::thread::spawn(move || db_writer_worker(conn, queue_name, db_write_rx));

        Ok(SqliteJobRepository {
            state,
            db_write_worker: std::sync::Mutex::new(Some(db_write_worker)),
        })
    }

    /// The name of the queue this repository is scoped to.
    pub fn queue_name(&self) -> &str {
        &self.state.queue_name
    }

    /// Flush pending writes and stop the writer thread. Operations attempted afterwards fail
    /// with [Error::QueueClosed].
    pub async fn close(&self) {
        let worker = {
            let mut holder = self
                .db_write_worker
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            holder.take()
        };

        if let Some(worker) = worker {
            self.state
                .db_write_tx
                .send(DbOperation {
                    span: Span::current(),
                    operation: DbOperationType::Close,
                })
                .await
                .ok();

            log_error(tokio::task::spawn_blocking(|| worker.join()).await);
        }
    }

    async fn write<T>(
        &self,
        make_op: impl FnOnce(tokio::sync::oneshot::Sender<Result<T>>) -> DbOperationType,
    ) -> Result<T> {
        let (result_tx, result_rx) = tokio::sync::oneshot::channel();
        self.state
            .db_write_tx
            .send(DbOperation {
                span: Span::current(),
                operation: make_op(result_tx),
            })
            .await
            .map_err(|_| Error::QueueClosed)?;
        result_rx.await.map_err(|_| Error::QueueClosed)?
    }

    async fn query_jobs(
        &self,
        query: String,
        params: Vec<(&'static str, rusqlite::types::Value)>,
    ) -> Result<SmallVec<[JobRecord; 1]>> {
        let conn = self.state.read_conn_pool.get().await?;
        conn.interact(move |conn| {
            let mut stmt = conn.prepare_cached(&query)?;
            let params = params
                .iter()
                .map(|(name, value)| (*name, value as &dyn rusqlite::ToSql))
                .collect::<Vec<_>>();
            let rows = stmt.query_and_then(params.as_slice(), job_from_row)?;
            rows.collect::<Result<SmallVec<[JobRecord; 1]>>>()
        })
        .await?
    }
}

#[async_trait]
impl JobRepository for SqliteJobRepository {
    #[instrument(level = "debug", skip_all, fields(id = %job.id, job_type = %job.job_type))]
    async fn insert(&self, job: &JobRecord) -> Result<()> {
        let mut job = job.clone();
        job.queue_name = self.state.queue_name.clone();
        self.write(|result_tx| DbOperationType::AddJob(AddJobArgs { job, result_tx }))
            .await
    }

    #[instrument(level = "trace", skip(self))]
    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>> {
        let query = format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE queue_name = $queue_name AND external_id = $id"
        );
        let rows = self
            .query_jobs(
                query,
                vec![
                    ("$queue_name", self.state.queue_name.clone().into()),
                    ("$id", rusqlite::types::Value::Blob(id.as_bytes().to_vec())),
                ],
            )
            .await?;

        Ok(rows.into_iter().next())
    }

    #[instrument(level = "trace", skip(self))]
    async fn list_for_owner(&self, owner_id: &str, limit: usize) -> Result<Vec<JobRecord>> {
        let query = format!(
            r##"SELECT {JOB_COLUMNS} FROM jobs
            WHERE queue_name = $queue_name AND owner_id = $owner_id
            ORDER BY created_at DESC, job_id DESC
            LIMIT $limit"##
        );
        let rows = self
            .query_jobs(
                query,
                vec![
                    ("$queue_name", self.state.queue_name.clone().into()),
                    ("$owner_id", owner_id.to_string().into()),
                    ("$limit", (limit as i64).into()),
                ],
            )
            .await?;

        Ok(rows.into_vec())
    }

    #[instrument(level = "trace", skip(self))]
    async fn ready_jobs(&self, now: OffsetDateTime, limit: usize) -> Result<Vec<JobRecord>> {
        let query = format!(
            r##"SELECT {JOB_COLUMNS} FROM jobs
            WHERE queue_name = $queue_name AND status = 'pending' AND scheduled_at <= $now
            ORDER BY priority DESC, scheduled_at ASC, job_id ASC
            LIMIT $limit"##
        );
        let rows = self
            .query_jobs(
                query,
                vec![
                    ("$queue_name", self.state.queue_name.clone().into()),
                    ("$now", to_db_time(now).into()),
                    ("$limit", (limit as i64).into()),
                ],
            )
            .await?;

        Ok(rows.into_vec())
    }

    #[instrument(level = "trace", skip(self))]
    async fn processing_started_before(
        &self,
        cutoff: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<JobRecord>> {
        let query = format!(
            r##"SELECT {JOB_COLUMNS} FROM jobs
            WHERE queue_name = $queue_name AND status = 'processing' AND started_at < $cutoff
            ORDER BY started_at ASC
            LIMIT $limit"##
        );
        let rows = self
            .query_jobs(
                query,
                vec![
                    ("$queue_name", self.state.queue_name.clone().into()),
                    ("$cutoff", to_db_time(cutoff).into()),
                    ("$limit", (limit as i64).into()),
                ],
            )
            .await?;

        Ok(rows.into_vec())
    }

    #[instrument(level = "debug", skip(self), fields(from = %transition.from, to = %transition.to))]
    async fn transition(&self, id: Uuid, transition: Transition) -> Result<Option<JobRecord>> {
        transition.validate()?;
        self.write(|result_tx| {
            DbOperationType::TransitionJob(TransitionJobArgs {
                id,
                transition,
                result_tx,
            })
        })
        .await
    }

    #[instrument(level = "debug", skip(self))]
    async fn delete_finished_before(&self, cutoff: OffsetDateTime) -> Result<Vec<Uuid>> {
        let cutoff = to_db_time(cutoff);
        self.write(|result_tx| {
            DbOperationType::DeleteFinished(DeleteFinishedArgs { cutoff, result_tx })
        })
        .await
    }
}
