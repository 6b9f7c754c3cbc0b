//! Durable ad-hoc task record store.
//!
//! The store is the single source of truth shared by independent worker
//! processes. Every claim is atomic: eligibility, limiter admission and the
//! lock write happen in one critical section of the backing storage, so two
//! concurrent claims can never return the same record and per-class ceilings
//! hold across processes.

pub mod in_memory;
pub mod sqlite;

use std::sync::Arc;

use chrono::{DateTime, Utc};

use cronq_core::{
    AdhocTaskRecord, ConcurrencyLimiter, DomainError, LimitDenied, NewAdhocTask, QueueSummary,
    RunningCounts, Slot, TaskId, WorkerId,
};

pub use in_memory::InMemoryTaskStore;
pub use sqlite::SqliteTaskStore;

/// Record store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("task {0} is already running")]
    AlreadyRunning(TaskId),
    #[error("concurrency limit reached: {0}")]
    LimitDenied(#[from] LimitDenied),
    #[error("lock on task {0} is no longer held by this worker")]
    LockLost(TaskId),
    #[error(transparent)]
    Validation(#[from] DomainError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    /// The store cannot be used safely for the rest of the invocation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StoreError::Unavailable(_) | StoreError::Storage(_))
    }
}

/// Lock parameters shared by both claim flavours.
#[derive(Debug, Clone, Copy)]
pub struct LockRequest {
    pub worker: WorkerId,
    pub now: DateTime<Utc>,
    pub lock_until: DateTime<Utc>,
}

/// Parameters for [`TaskStore::claim_next`].
#[derive(Debug, Clone)]
pub struct ClaimRequest<'a> {
    pub lock: LockRequest,
    /// Only consider this (normalized) classname.
    pub classname: Option<&'a str>,
    pub limiter: &'a ConcurrencyLimiter,
}

/// Parameters for [`TaskStore::claim_by_id`].
#[derive(Debug, Clone)]
pub struct ClaimByIdRequest<'a> {
    pub lock: LockRequest,
    /// `None` bypasses concurrency limits entirely.
    pub limiter: Option<&'a ConcurrencyLimiter>,
}

/// A record locked by the calling worker together with its reserved slot.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub record: AdhocTaskRecord,
    pub slot: Slot,
}

/// Listing filter for reporting.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub classname: Option<String>,
    pub failed_only: bool,
}

impl TaskFilter {
    pub fn matches(&self, record: &AdhocTaskRecord) -> bool {
        self.classname
            .as_deref()
            .is_none_or(|c| record.classname == c)
            && (!self.failed_only || record.is_failing())
    }
}

/// Ad-hoc task record store abstraction.
#[async_trait::async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new task; ids are assigned in increasing order.
    async fn enqueue(&self, task: NewAdhocTask, now: DateTime<Utc>) -> Result<TaskId, StoreError>;

    /// Get a task by ID.
    async fn get(&self, id: TaskId) -> Result<Option<AdhocTaskRecord>, StoreError>;

    /// Atomically lock the lowest-id record that is due, available and
    /// admitted by the limiter. Returns `None` if nothing qualifies.
    async fn claim_next(&self, request: &ClaimRequest<'_>)
    -> Result<Option<ClaimedTask>, StoreError>;

    /// Lock one specific record regardless of `nextruntime`.
    ///
    /// Fails with `NotFound`, `AlreadyRunning` (live lock held by anyone), or
    /// `LimitDenied` when a limiter is supplied.
    async fn claim_by_id(
        &self,
        id: TaskId,
        request: &ClaimByIdRequest<'_>,
    ) -> Result<ClaimedTask, StoreError>;

    /// Success path: delete the record if `worker` still holds its lock.
    async fn complete(&self, record: &AdhocTaskRecord, worker: WorkerId) -> Result<(), StoreError>;

    /// Failure path: unlock and persist backoff if `worker` still holds the lock.
    async fn reschedule(
        &self,
        record: &AdhocTaskRecord,
        worker: WorkerId,
        faildelay: u64,
        nextruntime: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Clear locks that expired before `now`; returns the released ids.
    async fn unlock_stale(&self, now: DateTime<Utc>) -> Result<Vec<TaskId>, StoreError>;

    /// Live locks, globally and per classname.
    async fn running_counts(&self, now: DateTime<Utc>) -> Result<RunningCounts, StoreError>;

    /// Records matching `filter`, ordered by id.
    async fn list(&self, filter: &TaskFilter) -> Result<Vec<AdhocTaskRecord>, StoreError>;

    /// Per-class summaries, optionally for a single classname.
    async fn summary(
        &self,
        now: DateTime<Utc>,
        classname: Option<&str>,
    ) -> Result<QueueSummary, StoreError>;

    /// Records with a non-zero fail delay.
    async fn find_failed(&self, classname: Option<&str>) -> Result<Vec<AdhocTaskRecord>, StoreError> {
        self.list(&TaskFilter {
            classname: classname.map(str::to_string),
            failed_only: true,
        })
        .await
    }
}

#[async_trait::async_trait]
impl<S> TaskStore for Arc<S>
where
    S: TaskStore + ?Sized,
{
    async fn enqueue(&self, task: NewAdhocTask, now: DateTime<Utc>) -> Result<TaskId, StoreError> {
        (**self).enqueue(task, now).await
    }

    async fn get(&self, id: TaskId) -> Result<Option<AdhocTaskRecord>, StoreError> {
        (**self).get(id).await
    }

    async fn claim_next(
        &self,
        request: &ClaimRequest<'_>,
    ) -> Result<Option<ClaimedTask>, StoreError> {
        (**self).claim_next(request).await
    }

    async fn claim_by_id(
        &self,
        id: TaskId,
        request: &ClaimByIdRequest<'_>,
    ) -> Result<ClaimedTask, StoreError> {
        (**self).claim_by_id(id, request).await
    }

    async fn complete(&self, record: &AdhocTaskRecord, worker: WorkerId) -> Result<(), StoreError> {
        (**self).complete(record, worker).await
    }

    async fn reschedule(
        &self,
        record: &AdhocTaskRecord,
        worker: WorkerId,
        faildelay: u64,
        nextruntime: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        (**self)
            .reschedule(record, worker, faildelay, nextruntime)
            .await
    }

    async fn unlock_stale(&self, now: DateTime<Utc>) -> Result<Vec<TaskId>, StoreError> {
        (**self).unlock_stale(now).await
    }

    async fn running_counts(&self, now: DateTime<Utc>) -> Result<RunningCounts, StoreError> {
        (**self).running_counts(now).await
    }

    async fn list(&self, filter: &TaskFilter) -> Result<Vec<AdhocTaskRecord>, StoreError> {
        (**self).list(filter).await
    }

    async fn summary(
        &self,
        now: DateTime<Utc>,
        classname: Option<&str>,
    ) -> Result<QueueSummary, StoreError> {
        (**self).summary(now, classname).await
    }

    async fn find_failed(&self, classname: Option<&str>) -> Result<Vec<AdhocTaskRecord>, StoreError> {
        (**self).find_failed(classname).await
    }
}
