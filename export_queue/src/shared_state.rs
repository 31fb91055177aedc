use std::ops::Deref;
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::mpsc;

use crate::db_writer::DbOperation;

pub(crate) struct SharedStateData {
    pub queue_name: String,
    pub db_write_tx: mpsc::Sender<DbOperation>,
    /// Separate pool for read-only calls so they won't block the writes.
    pub read_conn_pool: deadpool_sqlite::Pool,
}

#[derive(Clone)]
pub(crate) struct SharedState(pub Arc<SharedStateData>);

impl Deref for SharedState {
    type Target = Arc<SharedStateData>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// The queue's clock. It follows the Tokio clock so that tests can pause and advance time.
#[derive(Clone)]
pub struct Time {
    start_instant: tokio::time::Instant,
    start_time: time::OffsetDateTime,
}

impl Time {
    /// Start a clock at the current wall-clock time.
    pub fn new() -> Self {
        let start_instant = tokio::time::Instant::now();
        let start_time = time::OffsetDateTime::now_utc();

        Time {
            start_instant,
            start_time,
        }
    }

    /// The current time, truncated to the millisecond precision that the database stores.
    pub fn now(&self) -> OffsetDateTime {
        let now = self.start_time + self.start_instant.elapsed();
        truncate_to_millis(now)
    }
}

impl Default for Time {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn truncate_to_millis(t: OffsetDateTime) -> OffsetDateTime {
    let nanos = t.nanosecond();
    t - time::Duration::nanoseconds((nanos % 1_000_000) as i64)
}

pub(crate) fn to_db_time(t: OffsetDateTime) -> i64 {
    (t.unix_timestamp_nanos() / 1_000_000) as i64
}

pub(crate) fn from_db_time(millis: i64, column: &'static str) -> crate::Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000)
        .map_err(|_| crate::Error::TimestampOutOfRange(column))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_time_round_trip() {
        let now = truncate_to_millis(OffsetDateTime::now_utc());
        let stored = to_db_time(now);
        assert_eq!(from_db_time(stored, "now").unwrap(), now);
    }

    #[tokio::test(start_paused = true)]
    async fn follows_tokio_clock() {
        let time = Time::new();
        let before = time.now();
        tokio::time::advance(std::time::Duration::from_secs(3600)).await;
        let after = time.now();
        assert!(after - before >= time::Duration::hours(1));
    }
}
