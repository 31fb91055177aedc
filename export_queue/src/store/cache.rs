use std::sync::Mutex;

use ahash::HashMap;
use async_trait::async_trait;
use time::OffsetDateTime;
use tracing::{event, Level};
use uuid::Uuid;

use super::{JobRepository, Transition};
use crate::{JobRecord, JobState, Result};

/// The default number of jobs a [CachedJobRepository] holds.
pub const DEFAULT_CACHE_CAPACITY: usize = 10_000;

/// A process-local cache layered over another [JobRepository].
///
/// Reads check the cache first and fall through to the inner repository on a miss. Every write
/// made through this object is written through to the inner repository and then reflected in the
/// cache. Nothing is shared with other processes, and entries are silently dropped when the
/// cache is full, so the inner repository stays the only source of truth. Listing queries and
/// compare-and-set decisions always go to the inner repository.
pub struct CachedJobRepository<R: JobRepository> {
    inner: R,
    capacity: usize,
    jobs: Mutex<HashMap<Uuid, JobRecord>>,
}

impl<R: JobRepository> CachedJobRepository<R> {
    /// Wrap `inner` with a cache of [DEFAULT_CACHE_CAPACITY] entries.
    pub fn new(inner: R) -> Self {
        Self::with_capacity(inner, DEFAULT_CACHE_CAPACITY)
    }

    /// Wrap `inner` with a cache holding at most `capacity` entries.
    pub fn with_capacity(inner: R, capacity: usize) -> Self {
        CachedJobRepository {
            inner,
            capacity,
            jobs: Mutex::new(HashMap::default()),
        }
    }

    /// The wrapped repository.
    pub fn inner(&self) -> &R {
        &self.inner
    }

    /// Look at the cached copy of a job without falling through to the inner repository.
    pub fn cached(&self, id: Uuid) -> Option<JobRecord> {
        self.lock().get(&id).cloned()
    }

    /// Drop every cached entry.
    pub fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, JobRecord>> {
        // The cache holds nothing that the inner repository doesn't, so a poisoned map is
        // still usable.
        self.jobs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cache a record produced by a write. An entry that is further along the state machine is
    /// kept, since writes from concurrent tasks can finish caching out of order.
    fn store(&self, job: JobRecord) {
        if self.capacity == 0 {
            return;
        }

        let mut jobs = self.lock();
        match jobs.get(&job.id) {
            Some(existing) if stage(existing.status) > stage(job.status) => {
                event!(Level::TRACE, id = %job.id, cached = %existing.status, stale = %job.status, "keeping newer cached job");
                return;
            }
            Some(_) => {}
            None => self.make_room(&mut jobs),
        }
        jobs.insert(job.id, job);
    }

    /// Cache a record read from the inner repository after a miss, unless a write cached a record
    /// while the read was in flight. Returns the record that is now current.
    fn fill(&self, job: JobRecord) -> JobRecord {
        if self.capacity == 0 {
            return job;
        }

        let mut jobs = self.lock();
        if let Some(existing) = jobs.get(&job.id) {
            if stage(existing.status) >= stage(job.status) {
                return existing.clone();
            }
        } else {
            self.make_room(&mut jobs);
        }
        jobs.insert(job.id, job.clone());
        job
    }

    fn make_room(&self, jobs: &mut HashMap<Uuid, JobRecord>) {
        if jobs.len() >= self.capacity {
            let evict = jobs.keys().next().copied();
            if let Some(evict) = evict {
                jobs.remove(&evict);
            }
        }
    }

    fn evict(&self, id: &Uuid) {
        self.lock().remove(id);
    }
}

/// How far along the state machine a job is. Jobs only ever move to a higher stage.
fn stage(state: JobState) -> u8 {
    match state {
        JobState::Pending => 0,
        JobState::Processing => 1,
        JobState::Completed | JobState::Failed | JobState::Cancelled => 2,
    }
}

#[async_trait]
impl<R: JobRepository> JobRepository for CachedJobRepository<R> {
    async fn insert(&self, job: &JobRecord) -> Result<()> {
        self.inner.insert(job).await?;
        self.store(job.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<JobRecord>> {
        if let Some(job) = self.cached(id) {
            return Ok(Some(job));
        }

        let job = self.inner.get(id).await?;
        Ok(job.map(|job| self.fill(job)))
    }

    async fn list_for_owner(&self, owner_id: &str, limit: usize) -> Result<Vec<JobRecord>> {
        self.inner.list_for_owner(owner_id, limit).await
    }

    async fn ready_jobs(&self, now: OffsetDateTime, limit: usize) -> Result<Vec<JobRecord>> {
        self.inner.ready_jobs(now, limit).await
    }

    async fn processing_started_before(
        &self,
        cutoff: OffsetDateTime,
        limit: usize,
    ) -> Result<Vec<JobRecord>> {
        self.inner.processing_started_before(cutoff, limit).await
    }

    async fn transition(&self, id: Uuid, transition: Transition) -> Result<Option<JobRecord>> {
        let updated = self.inner.transition(id, transition).await?;
        match &updated {
            Some(job) => self.store(job.clone()),
            None => {
                // Someone else changed or removed the job, so whatever we have cached is stale.
                event!(Level::TRACE, %id, "transition not applied, evicting cached job");
                self.evict(&id);
            }
        }
        Ok(updated)
    }

    async fn delete_finished_before(&self, cutoff: OffsetDateTime) -> Result<Vec<Uuid>> {
        let deleted = self.inner.delete_finished_before(cutoff).await?;
        let mut jobs = self.lock();
        for id in &deleted {
            jobs.remove(id);
        }
        Ok(deleted)
    }
}
