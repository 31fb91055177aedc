use rusqlite::{named_params, Connection, OptionalExtension};
use tokio::sync::oneshot;
use uuid::Uuid;

use super::DbOperationResult;
use crate::{
    shared_state::to_db_time,
    store::{job_from_row, Transition, JOB_COLUMNS},
    JobRecord, JobState, Result,
};

pub(crate) struct TransitionJobArgs {
    pub id: Uuid,
    pub transition: Transition,
    pub result_tx: oneshot::Sender<Result<Option<JobRecord>>>,
}

fn do_transition_job(
    tx: &Connection,
    queue_name: &str,
    id: Uuid,
    transition: &Transition,
) -> Result<Option<JobRecord>> {
    let at = to_db_time(transition.at);
    let at_for = |state: JobState| (transition.to == state).then_some(at);
    let result = transition.result.as_ref();

    // The status check in the WHERE clause is the compare-and-set: if another actor already moved
    // the job, no row matches and nothing is returned.
    let query = format!(
        r##"UPDATE jobs SET
            status = $to,
            progress = COALESCE($progress, progress),
            started_at = COALESCE($started_at, started_at),
            completed_at = COALESCE($completed_at, completed_at),
            failed_at = COALESCE($failed_at, failed_at),
            cancelled_at = COALESCE($cancelled_at, cancelled_at),
            last_error = COALESCE($error, last_error),
            result_filename = COALESCE($result_filename, result_filename),
            result_location = COALESCE($result_location, result_location),
            result_row_count = COALESCE($result_row_count, result_row_count),
            result_byte_size = COALESCE($result_byte_size, result_byte_size)
        WHERE queue_name = $queue_name AND external_id = $id AND status = $from
        RETURNING {JOB_COLUMNS}"##
    );

    let mut stmt = tx.prepare_cached(&query)?;
    let row = stmt
        .query_row(
            named_params! {
                "$to": transition.to.as_str(),
                "$from": transition.from.as_str(),
                "$queue_name": queue_name,
                "$id": id,
                "$progress": transition.to.progress(),
                "$started_at": at_for(JobState::Processing),
                "$completed_at": at_for(JobState::Completed),
                "$failed_at": at_for(JobState::Failed),
                "$cancelled_at": at_for(JobState::Cancelled),
                "$error": transition.error,
                "$result_filename": result.map(|r| &r.filename),
                "$result_location": result.map(|r| &r.location),
                "$result_row_count": result.map(|r| r.row_count as i64),
                "$result_byte_size": result.map(|r| r.byte_size as i64),
            },
            |row| Ok(job_from_row(row)),
        )
        .optional()?;

    row.transpose()
}

pub(super) fn transition_job(
    tx: &Connection,
    queue_name: &str,
    args: TransitionJobArgs,
) -> DbOperationResult {
    let TransitionJobArgs {
        id,
        transition,
        result_tx,
    } = args;
    let result = do_transition_job(tx, queue_name, id, &transition);
    DbOperationResult::TransitionJob(super::OperationResult { result, result_tx })
}
