//! In-memory record store for tests, benchmarks and single-process embedding.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use cronq_core::{
    normalize_classname, AdhocTaskRecord, NewAdhocTask, QueueSummary, RunningCounts, TaskId,
    WorkerId,
};

use super::{ClaimByIdRequest, ClaimRequest, ClaimedTask, StoreError, TaskFilter, TaskStore};

#[derive(Debug, Default)]
struct Inner {
    tasks: BTreeMap<TaskId, AdhocTaskRecord>,
    last_id: i64,
}

impl Inner {
    fn running_counts(&self, now: DateTime<Utc>) -> RunningCounts {
        let mut counts = RunningCounts::default();
        for record in self.tasks.values().filter(|r| r.is_locked(now)) {
            counts.add(&record.classname, record.blocking, 1);
        }
        counts
    }

    fn held_by<'a>(
        &'a mut self,
        record: &AdhocTaskRecord,
        worker: WorkerId,
    ) -> Result<&'a mut AdhocTaskRecord, StoreError> {
        match self.tasks.get_mut(&record.id) {
            Some(stored) if stored.is_locked_by(worker) => Ok(stored),
            _ => Err(StoreError::LockLost(record.id)),
        }
    }
}

/// In-memory record store.
///
/// A single mutex guards the whole table, which makes every operation atomic
/// with respect to concurrent callers sharing the store through an `Arc`.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    inner: Mutex<Inner>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.lock().map(|inner| inner.tasks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, StoreError> {
        self.inner
            .lock()
            .map_err(|_| StoreError::Unavailable("in-memory store mutex poisoned".to_string()))
    }
}

#[async_trait::async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn enqueue(&self, task: NewAdhocTask, now: DateTime<Utc>) -> Result<TaskId, StoreError> {
        let mut inner = self.lock()?;
        let id = TaskId::new(inner.last_id + 1);
        let record = task.into_record(id, now)?;
        inner.last_id = id.get();
        inner.tasks.insert(id, record);
        Ok(id)
    }

    async fn get(&self, id: TaskId) -> Result<Option<AdhocTaskRecord>, StoreError> {
        Ok(self.lock()?.tasks.get(&id).cloned())
    }

    async fn claim_next(
        &self,
        request: &ClaimRequest<'_>,
    ) -> Result<Option<ClaimedTask>, StoreError> {
        let mut inner = self.lock()?;
        let lock = request.lock;

        let counts = inner.running_counts(lock.now);
        let admission = request.limiter.admission(&counts);
        if admission.is_closed() {
            return Ok(None);
        }

        // BTreeMap iterates in id order, which is the claim order.
        let candidate = inner
            .tasks
            .values()
            .filter(|r| r.is_claimable(lock.now))
            .filter(|r| request.classname.is_none_or(|c| r.classname == c))
            .find(|r| admission.admits(&r.classname, r.blocking))
            .map(|r| r.id);

        let Some(id) = candidate else {
            return Ok(None);
        };

        let slot = {
            let record = &inner.tasks[&id];
            request.limiter.reserve_for(&counts, record)?
        };
        let record = inner
            .tasks
            .get_mut(&id)
            .ok_or(StoreError::NotFound(id))?;
        record.lock(lock.worker, lock.now, lock.lock_until);

        Ok(Some(ClaimedTask {
            record: record.clone(),
            slot,
        }))
    }

    async fn claim_by_id(
        &self,
        id: TaskId,
        request: &ClaimByIdRequest<'_>,
    ) -> Result<ClaimedTask, StoreError> {
        let mut inner = self.lock()?;
        let lock = request.lock;
        let counts = inner.running_counts(lock.now);

        let record = inner.tasks.get(&id).ok_or(StoreError::NotFound(id))?;
        if record.is_locked(lock.now) {
            return Err(StoreError::AlreadyRunning(id));
        }
        let slot = match request.limiter {
            Some(limiter) => limiter.reserve_for(&counts, record)?,
            None => cronq_core::Slot {
                classname: record.classname.clone(),
                blocking: record.blocking,
            },
        };

        let record = inner.tasks.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.lock(lock.worker, lock.now, lock.lock_until);

        Ok(ClaimedTask {
            record: record.clone(),
            slot,
        })
    }

    async fn complete(&self, record: &AdhocTaskRecord, worker: WorkerId) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner.held_by(record, worker)?;
        inner.tasks.remove(&record.id);
        Ok(())
    }

    async fn reschedule(
        &self,
        record: &AdhocTaskRecord,
        worker: WorkerId,
        faildelay: u64,
        nextruntime: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.lock()?;
        inner
            .held_by(record, worker)?
            .reschedule(faildelay, nextruntime);
        Ok(())
    }

    async fn unlock_stale(&self, now: DateTime<Utc>) -> Result<Vec<TaskId>, StoreError> {
        let mut inner = self.lock()?;
        let mut released = Vec::new();
        for record in inner.tasks.values_mut() {
            if record.lockedby.is_some() && !record.is_locked(now) {
                record.unlock();
                released.push(record.id);
            }
        }
        Ok(released)
    }

    async fn running_counts(&self, now: DateTime<Utc>) -> Result<RunningCounts, StoreError> {
        Ok(self.lock()?.running_counts(now))
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<AdhocTaskRecord>, StoreError> {
        let filter = TaskFilter {
            classname: filter.classname.as_deref().map(normalize_classname),
            failed_only: filter.failed_only,
        };
        let inner = self.lock()?;
        Ok(inner
            .tasks
            .values()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect())
    }

    async fn summary(
        &self,
        now: DateTime<Utc>,
        classname: Option<&str>,
    ) -> Result<QueueSummary, StoreError> {
        let classname = classname.map(normalize_classname);
        let inner = self.lock()?;
        Ok(QueueSummary::from_records(
            inner
                .tasks
                .values()
                .filter(|r| classname.as_deref().is_none_or(|c| r.classname == c)),
            now,
        ))
    }
}
