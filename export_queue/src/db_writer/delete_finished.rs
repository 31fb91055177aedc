use rusqlite::{named_params, Connection};
use tokio::sync::oneshot;
use uuid::Uuid;

use super::DbOperationResult;
use crate::Result;

pub(crate) struct DeleteFinishedArgs {
    pub cutoff: i64,
    pub result_tx: oneshot::Sender<Result<Vec<Uuid>>>,
}

fn do_delete_finished(tx: &Connection, queue_name: &str, cutoff: i64) -> Result<Vec<Uuid>> {
    let mut stmt = tx.prepare_cached(
        r##"DELETE FROM jobs
        WHERE queue_name = $queue_name
            AND status IN ('completed', 'failed', 'cancelled')
            AND COALESCE(completed_at, failed_at, cancelled_at) < $cutoff
        RETURNING external_id"##,
    )?;

    let ids = stmt
        .query_map(
            named_params! {
                "$queue_name": queue_name,
                "$cutoff": cutoff,
            },
            |row| row.get::<_, Uuid>(0),
        )?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ids)
}

pub(super) fn delete_finished(
    tx: &Connection,
    queue_name: &str,
    args: DeleteFinishedArgs,
) -> DbOperationResult {
    let DeleteFinishedArgs { cutoff, result_tx } = args;
    let result = do_delete_finished(tx, queue_name, cutoff);
    DbOperationResult::DeleteFinished(super::OperationResult { result, result_tx })
}
