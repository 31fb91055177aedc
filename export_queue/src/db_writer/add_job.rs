use rusqlite::{named_params, Connection};
use tokio::sync::oneshot;

use super::DbOperationResult;
use crate::{shared_state::to_db_time, Error, JobRecord, Result};

pub(crate) struct AddJobArgs {
    pub job: JobRecord,
    pub result_tx: oneshot::Sender<Result<()>>,
}

pub(crate) const INSERT_JOB_QUERY: &str = r##"
    INSERT INTO jobs
    (external_id, queue_name, job_type, owner_id, owner_contact, payload, status, progress,
        priority, scheduled_at, created_at, started_at, completed_at, failed_at, cancelled_at,
        last_error, result_filename, result_location, result_row_count, result_byte_size)
    VALUES
    ($external_id, $queue_name, $job_type, $owner_id, $owner_contact, $payload, $status, $progress,
        $priority, $scheduled_at, $created_at, $started_at, $completed_at, $failed_at, $cancelled_at,
        $last_error, $result_filename, $result_location, $result_row_count, $result_byte_size)
"##;

pub(crate) fn do_add_job(tx: &Connection, job: &JobRecord) -> Result<()> {
    let payload = serde_json::to_string(&job.payload).map_err(Error::PayloadError)?;
    let result = job.result.as_ref();

    let mut stmt = tx.prepare_cached(INSERT_JOB_QUERY)?;
    stmt.execute(named_params! {
        "$external_id": job.id,
        "$queue_name": job.queue_name,
        "$job_type": job.job_type.as_str(),
        "$owner_id": job.owner.user_id,
        "$owner_contact": job.owner.contact,
        "$payload": payload,
        "$status": job.status.as_str(),
        "$progress": job.progress,
        "$priority": job.priority,
        "$scheduled_at": to_db_time(job.scheduled_at),
        "$created_at": to_db_time(job.created_at),
        "$started_at": job.started_at.map(to_db_time),
        "$completed_at": job.completed_at.map(to_db_time),
        "$failed_at": job.failed_at.map(to_db_time),
        "$cancelled_at": job.cancelled_at.map(to_db_time),
        "$last_error": job.error,
        "$result_filename": result.map(|r| &r.filename),
        "$result_location": result.map(|r| &r.location),
        "$result_row_count": result.map(|r| r.row_count as i64),
        "$result_byte_size": result.map(|r| r.byte_size as i64),
    })?;

    Ok(())
}

pub(super) fn add_job(tx: &Connection, args: AddJobArgs) -> DbOperationResult {
    let AddJobArgs { job, result_tx } = args;
    let result = do_add_job(tx, &job);
    DbOperationResult::AddJob(super::OperationResult { result, result_tx })
}
