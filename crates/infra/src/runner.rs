//! Run loop: drives claim → execute → reconcile for one worker invocation.
//!
//! Three modes share the same cycle:
//!
//! - **due**: claim the lowest-id due task until nothing is eligible, the
//!   task cap is hit, or the keep-alive deadline passes.
//! - **by id**: run exactly one task, ignoring its schedule and the limits.
//! - **failed**: run every task with a non-zero fail delay right away, in id
//!   order, still within the limits.
//!
//! Every coordination decision goes through the record store, so any number
//! of invocations (in this or other processes) may run at once.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use cronq_core::{
    normalize_classname, AdhocTaskRecord, BackoffPolicy, ConcurrencyLimiter, ConcurrencyLimits,
    TaskId, WorkerId,
};

use crate::config::QueueConfig;
use crate::executor::{TaskExecutor, TaskOutcome, TaskRegistry};
use crate::store::{
    ClaimByIdRequest, ClaimRequest, ClaimedTask, LockRequest, StoreError, TaskStore,
};

/// Per-invocation operator options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Only run tasks of this classname.
    pub classname: Option<String>,
    /// Keep polling for new work until this much time has passed.
    pub keep_alive: Option<Duration>,
    /// Stop after executing this many tasks.
    pub tasks_limit: Option<usize>,
    /// Disable concurrency ceilings and the per-task max runtime.
    pub ignore_limits: bool,
    /// Run even when the queue is disabled.
    pub force: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Due,
    ById(TaskId),
    Failed,
}

/// One worker invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub mode: RunMode,
    pub options: RunOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Nothing eligible is left.
    Drained,
    TasksLimitReached,
    KeepAliveExpired,
    /// Run-by-id finished its task.
    SingleTask,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskReport {
    pub id: TaskId,
    pub classname: String,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// What an invocation did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub worker: WorkerId,
    pub mode: RunMode,
    pub entries: Vec<TaskReport>,
    pub executed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Stale locks released before claiming.
    pub reclaimed: Vec<TaskId>,
    /// Candidates passed over because they were running or over a limit.
    pub skipped: usize,
    pub stop_reason: StopReason,
}

impl RunReport {
    fn new(worker: WorkerId, mode: RunMode) -> Self {
        Self {
            worker,
            mode,
            entries: Vec::new(),
            executed: 0,
            succeeded: 0,
            failed: 0,
            reclaimed: Vec::new(),
            skipped: 0,
            stop_reason: StopReason::Drained,
        }
    }

    fn record(&mut self, record: &AdhocTaskRecord, outcome: &TaskOutcome) {
        self.executed += 1;
        match &outcome.result {
            Ok(()) => self.succeeded += 1,
            Err(_) => self.failed += 1,
        }
        self.entries.push(TaskReport {
            id: record.id,
            classname: record.classname.clone(),
            success: outcome.is_success(),
            error: outcome.result.as_ref().err().map(ToString::to_string),
            duration_ms: outcome.duration.as_millis() as u64,
        });
    }

    fn limit_reached(&self, tasks_limit: Option<usize>) -> bool {
        tasks_limit.is_some_and(|limit| self.executed >= limit)
    }

    fn finish(mut self, reason: StopReason) -> Self {
        self.stop_reason = reason;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("ad-hoc task queue is disabled; use force to run anyway")]
    Disabled,
    #[error("task not found: {0}")]
    NotFound(TaskId),
    #[error("task {0} is already running")]
    AlreadyRunning(TaskId),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Drives ad-hoc task execution against a [`TaskStore`].
#[derive(Debug)]
pub struct AdhocTaskRunner<S> {
    store: S,
    executor: TaskExecutor,
    config: QueueConfig,
    limits: ConcurrencyLimits,
    backoff: BackoffPolicy,
    worker: WorkerId,
}

impl<S: TaskStore> AdhocTaskRunner<S> {
    pub fn new(store: S, registry: Arc<TaskRegistry>, config: QueueConfig) -> Self {
        let limits = config.concurrency_limits(&registry.concurrency_limits());
        let backoff = config.backoff_policy();
        Self {
            store,
            executor: TaskExecutor::new(registry),
            config,
            limits,
            backoff,
            worker: WorkerId::new(),
        }
    }

    /// Use a fixed worker identity instead of a fresh one.
    pub fn with_worker(mut self, worker: WorkerId) -> Self {
        self.worker = worker;
        self
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn limits(&self) -> &ConcurrencyLimits {
        &self.limits
    }

    pub async fn run(&self, invocation: &Invocation) -> Result<RunReport, RunError> {
        match invocation.mode {
            RunMode::Due => self.run_due(&invocation.options).await,
            RunMode::ById(id) => self.run_by_id(id, &invocation.options).await,
            RunMode::Failed => self.run_failed(&invocation.options).await,
        }
    }

    /// Run due tasks until drained, capped, or past the keep-alive deadline.
    pub async fn run_due(&self, options: &RunOptions) -> Result<RunReport, RunError> {
        self.check_enabled(options)?;
        let limiter = self.limiter(options);
        let classname = options.classname.as_deref().map(normalize_classname);
        let deadline = options.keep_alive.map(|keep_alive| Instant::now() + keep_alive);
        let mut report = RunReport::new(self.worker, RunMode::Due);

        info!(
            worker = %self.worker,
            classname = classname.as_deref().unwrap_or("*"),
            keep_alive_secs = options.keep_alive.map(|d| d.as_secs()),
            tasks_limit = options.tasks_limit,
            ignore_limits = options.ignore_limits,
            "running due ad-hoc tasks"
        );

        loop {
            if report.limit_reached(options.tasks_limit) {
                return Ok(self.finished(report, StopReason::TasksLimitReached));
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Ok(self.finished(report, StopReason::KeepAliveExpired));
            }

            let now = Utc::now();
            self.reclaim_stale(now, &mut report).await?;

            let request = ClaimRequest {
                lock: self.lock_request(now, options),
                classname: classname.as_deref(),
                limiter: &limiter,
            };
            let claimed = match self.store.claim_next(&request).await {
                Ok(claimed) => claimed,
                Err(StoreError::LimitDenied(denied)) => {
                    debug!(worker = %self.worker, %denied, "claim denied by concurrency limit");
                    report.skipped += 1;
                    None
                }
                Err(e) => return Err(self.abort(e)),
            };

            match claimed {
                Some(claimed) => self.execute(claimed, options, &mut report).await?,
                None => match deadline {
                    Some(deadline) => {
                        let remaining = deadline.saturating_duration_since(Instant::now());
                        if remaining.is_zero() {
                            return Ok(self.finished(report, StopReason::KeepAliveExpired));
                        }
                        tokio::time::sleep(self.config.poll_interval().min(remaining)).await;
                    }
                    None => return Ok(self.finished(report, StopReason::Drained)),
                },
            }
        }
    }

    /// Run one specific task regardless of its schedule and the limits.
    ///
    /// A classname filter in `options` is logged when it names another class
    /// but never applied.
    pub async fn run_by_id(&self, id: TaskId, options: &RunOptions) -> Result<RunReport, RunError> {
        self.check_enabled(options)?;
        let mut report = RunReport::new(self.worker, RunMode::ById(id));
        info!(worker = %self.worker, task_id = %id, "running ad-hoc task by id");

        let now = Utc::now();
        let request = ClaimByIdRequest {
            lock: self.lock_request(now, options),
            limiter: None,
        };
        let claimed = match self.store.claim_by_id(id, &request).await {
            Ok(claimed) => claimed,
            Err(StoreError::NotFound(id)) => return Err(RunError::NotFound(id)),
            Err(StoreError::AlreadyRunning(id)) => return Err(RunError::AlreadyRunning(id)),
            Err(e) => return Err(self.abort(e)),
        };
        if let Some(filter) = mismatched_classname_filter(options, &claimed.record.classname) {
            warn!(
                task_id = %id,
                classname = %claimed.record.classname,
                filter = %filter,
                "classname filter does not apply to run-by-id; running the task anyway"
            );
        }

        self.execute(claimed, options, &mut report).await?;
        Ok(self.finished(report, StopReason::SingleTask))
    }

    /// Run every currently failing task now, in id order.
    pub async fn run_failed(&self, options: &RunOptions) -> Result<RunReport, RunError> {
        self.check_enabled(options)?;
        let limiter = self.limiter(options);
        let classname = options.classname.as_deref().map(normalize_classname);
        let mut report = RunReport::new(self.worker, RunMode::Failed);

        let now = Utc::now();
        self.reclaim_stale(now, &mut report).await?;
        let failed = self
            .store
            .find_failed(classname.as_deref())
            .await
            .map_err(|e| self.abort(e))?;

        info!(
            worker = %self.worker,
            classname = classname.as_deref().unwrap_or("*"),
            candidates = failed.len(),
            "running failed ad-hoc tasks"
        );

        for candidate in failed {
            if report.limit_reached(options.tasks_limit) {
                return Ok(self.finished(report, StopReason::TasksLimitReached));
            }

            let request = ClaimByIdRequest {
                lock: self.lock_request(Utc::now(), options),
                limiter: Some(&limiter),
            };
            match self.store.claim_by_id(candidate.id, &request).await {
                Ok(claimed) => self.execute(claimed, options, &mut report).await?,
                Err(StoreError::NotFound(id)) => {
                    debug!(task_id = %id, "failed task disappeared before it could be claimed");
                    report.skipped += 1;
                }
                Err(StoreError::AlreadyRunning(id)) => {
                    debug!(task_id = %id, "failed task is already running elsewhere");
                    report.skipped += 1;
                }
                Err(StoreError::LimitDenied(denied)) => {
                    debug!(task_id = %candidate.id, %denied, "failed task skipped by concurrency limit");
                    report.skipped += 1;
                }
                Err(e) => return Err(self.abort(e)),
            }
        }

        Ok(self.finished(report, StopReason::Drained))
    }

    fn check_enabled(&self, options: &RunOptions) -> Result<(), RunError> {
        if self.config.enabled {
            return Ok(());
        }
        if options.force {
            warn!(worker = %self.worker, "ad-hoc task queue is disabled; running anyway (forced)");
            return Ok(());
        }
        Err(RunError::Disabled)
    }

    fn limiter(&self, options: &RunOptions) -> ConcurrencyLimiter {
        ConcurrencyLimiter::new(self.limits.clone()).ignoring_limits(options.ignore_limits)
    }

    fn max_runtime(&self, options: &RunOptions) -> Option<Duration> {
        (!options.ignore_limits).then(|| self.config.max_runtime())
    }

    fn lock_request(&self, now: DateTime<Utc>, options: &RunOptions) -> LockRequest {
        let ttl = match self.max_runtime(options) {
            Some(max_runtime) => max_runtime + self.config.lock_grace(),
            None => self.config.unbounded_lock(),
        };
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        LockRequest {
            worker: self.worker,
            now,
            lock_until: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    async fn reclaim_stale(&self, now: DateTime<Utc>, report: &mut RunReport) -> Result<(), RunError> {
        let released = self
            .store
            .unlock_stale(now)
            .await
            .map_err(|e| self.abort(e))?;
        for id in &released {
            warn!(worker = %self.worker, task_id = %id, "released expired lock");
        }
        report.reclaimed.extend(released);
        Ok(())
    }

    async fn execute(
        &self,
        claimed: ClaimedTask,
        options: &RunOptions,
        report: &mut RunReport,
    ) -> Result<(), RunError> {
        let ClaimedTask { record, slot } = claimed;
        info!(
            worker = %self.worker,
            task_id = %record.id,
            classname = %record.classname,
            blocking = slot.blocking,
            faildelay = record.faildelay,
            "executing ad-hoc task"
        );

        let outcome = self
            .executor
            .run(&record, self.worker, self.max_runtime(options))
            .await;
        let duration_ms = outcome.duration.as_millis() as u64;
        let now = Utc::now();

        let released = match &outcome.result {
            Ok(()) => {
                info!(task_id = %record.id, classname = %record.classname, duration_ms, "ad-hoc task completed");
                self.store.complete(&record, self.worker).await
            }
            Err(failure) => {
                let (faildelay, nextruntime) = if failure.is_timeout() {
                    self.backoff.on_timeout(&record, now)
                } else {
                    self.backoff.on_failure(&record, now)
                };
                warn!(
                    task_id = %record.id,
                    classname = %record.classname,
                    duration_ms,
                    error = %failure,
                    faildelay,
                    %nextruntime,
                    "ad-hoc task failed"
                );
                self.store
                    .reschedule(&record, self.worker, faildelay, nextruntime)
                    .await
            }
        };

        report.record(&record, &outcome);

        match released {
            Ok(()) => Ok(()),
            Err(StoreError::LockLost(id)) => {
                warn!(
                    worker = %self.worker,
                    task_id = %id,
                    "lock lost before the outcome was recorded; another worker owns the task"
                );
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(self.abort(e)),
            Err(e) => {
                warn!(task_id = %record.id, error = %e, "failed to record ad-hoc task outcome");
                Ok(())
            }
        }
    }

    fn abort(&self, err: StoreError) -> RunError {
        error!(worker = %self.worker, error = %err, "record store failure; aborting invocation");
        RunError::Store(err)
    }

    fn finished(&self, report: RunReport, reason: StopReason) -> RunReport {
        info!(
            worker = %self.worker,
            executed = report.executed,
            succeeded = report.succeeded,
            failed = report.failed,
            reclaimed = report.reclaimed.len(),
            skipped = report.skipped,
            stop_reason = ?reason,
            "ad-hoc task run finished"
        );
        report.finish(reason)
    }
}

/// The normalized classname filter when it names a different class.
fn mismatched_classname_filter(options: &RunOptions, classname: &str) -> Option<String> {
    let filter = normalize_classname(options.classname.as_deref()?);
    (filter != normalize_classname(classname)).then_some(filter)
}
