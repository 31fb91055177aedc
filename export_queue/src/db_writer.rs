use rusqlite::Connection;
use tracing::{event, instrument, Level};
use uuid::Uuid;

use self::{
    add_job::{add_job, AddJobArgs},
    delete_finished::{delete_finished, DeleteFinishedArgs},
    transition::{transition_job, TransitionJobArgs},
};
use crate::{error::Result, log_error, JobRecord};

pub(crate) mod add_job;
pub(crate) mod delete_finished;
pub(crate) mod transition;

pub(crate) struct DbOperation {
    pub operation: DbOperationType,
    pub span: tracing::Span,
}

pub(crate) enum DbOperationType {
    Close,
    AddJob(AddJobArgs),
    TransitionJob(TransitionJobArgs),
    DeleteFinished(DeleteFinishedArgs),
}

struct OperationResult<T> {
    result: Result<T>,
    result_tx: tokio::sync::oneshot::Sender<Result<T>>,
}

enum DbOperationResult {
    Close,
    AddJob(OperationResult<()>),
    TransitionJob(OperationResult<Option<JobRecord>>),
    DeleteFinished(OperationResult<Vec<Uuid>>),
}

impl DbOperationResult {
    fn is_ok(&self) -> bool {
        match self {
            DbOperationResult::Close => true,
            DbOperationResult::AddJob(result) => result.result.is_ok(),
            DbOperationResult::TransitionJob(result) => result.result.is_ok(),
            DbOperationResult::DeleteFinished(result) => result.result.is_ok(),
        }
    }

    fn send(self) {
        match self {
            DbOperationResult::Close => {}
            DbOperationResult::AddJob(result) => {
                result.result_tx.send(result.result).ok();
            }
            DbOperationResult::TransitionJob(result) => {
                result.result_tx.send(result.result).ok();
            }
            DbOperationResult::DeleteFinished(result) => {
                result.result_tx.send(result.result).ok();
            }
        };
    }
}

#[instrument(level = "trace", skip_all, fields(count = %operations.len()))]
fn process_operations(
    conn: &mut Connection,
    queue_name: &str,
    operations: &mut Vec<DbOperation>,
) -> Result<bool> {
    let mut results = Vec::with_capacity(operations.len());
    let mut closed = false;

    let mut tx = conn.transaction()?;
    for op in operations.drain(..) {
        let _span = op.span.enter();
        // Use savepoints within the batch to allow rollback as needed, but still a single
        // transaction for the whole batch since it's many times faster.
        match tx.savepoint() {
            Ok(mut sp) => {
                let result = match op.operation {
                    DbOperationType::AddJob(args) => add_job(&sp, args),
                    DbOperationType::TransitionJob(args) => transition_job(&sp, queue_name, args),
                    DbOperationType::DeleteFinished(args) => {
                        delete_finished(&sp, queue_name, args)
                    }
                    DbOperationType::Close => {
                        closed = true;
                        DbOperationResult::Close
                    }
                };

                let worked = result.is_ok();
                results.push(result);

                if worked {
                    log_error(sp.commit());
                } else {
                    log_error(sp.rollback());
                }
            }
            Err(e) => {
                event!(Level::ERROR, %e, "failed to create savepoint");
            }
        }
    }
    tx.commit()?;

    // Results go out only after the commit so that a caller who reads right after a write
    // always sees it.
    for result in results {
        result.send();
    }

    Ok(closed)
}

pub(crate) fn db_writer_worker(
    mut conn: Connection,
    queue_name: String,
    mut operations_rx: tokio::sync::mpsc::Receiver<DbOperation>,
) {
    const BATCH_SIZE: usize = 50;
    let mut operations = Vec::with_capacity(BATCH_SIZE);
    loop {
        operations.truncate(0);

        match operations_rx.blocking_recv() {
            Some(op) => operations.push(op),
            None => break,
        }

        // Get additional operations, if any are waiting.
        // This lets us process multiple operations in a batch for better efficiency.
        while operations.len() < BATCH_SIZE {
            match operations_rx.try_recv() {
                Ok(operation) => operations.push(operation),
                // Treat "empty" and "closed" as the same here. If it's closed then
                // we'll leave the loop next time around, after processing the last jobs below.
                Err(_) => break,
            }
        }

        match process_operations(&mut conn, &queue_name, &mut operations) {
            Ok(true) => break,
            Ok(false) => {}
            Err(e) => event!(Level::ERROR, %e),
        }
    }

    log_error(conn.close().map_err(|(_, e)| e));
}
