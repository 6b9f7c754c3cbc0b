//! Task handlers, the handler registry and the executor.
//!
//! The executor never touches the record store. It resolves the handler for a
//! record's classname, runs it on its own tokio task under an optional
//! wall-clock budget and returns a [`TaskOutcome`]; the run loop turns that
//! outcome into a store transition.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use cronq_core::{normalize_classname, AdhocTaskRecord, TaskFailure, TaskId, WorkerId};

/// Context handed to a handler for one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub task_id: TaskId,
    pub classname: String,
    /// Opaque identity the task should act as, if any.
    pub userid: Option<i64>,
    pub worker: WorkerId,
    pub started_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn for_record(record: &AdhocTaskRecord, worker: WorkerId, started_at: DateTime<Utc>) -> Self {
        Self {
            task_id: record.id,
            classname: record.classname.clone(),
            userid: record.userid,
            worker,
            started_at,
        }
    }
}

/// An ad-hoc task handler.
#[async_trait::async_trait]
pub trait AdhocTask: Send + Sync {
    async fn execute(&self, ctx: ExecutionContext, payload: serde_json::Value) -> anyhow::Result<()>;

    /// Per-class concurrency ceiling declared by the handler itself.
    ///
    /// Operator configuration takes precedence.
    fn concurrency_limit(&self) -> Option<usize> {
        None
    }
}

/// Adapts an async closure into an [`AdhocTask`].
pub struct FnTask<F, Fut> {
    f: F,
    concurrency_limit: Option<usize>,
    _fut: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnTask<F, Fut>
where
    F: Fn(ExecutionContext, serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            concurrency_limit: None,
            _fut: PhantomData,
        }
    }

    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }
}

#[async_trait::async_trait]
impl<F, Fut> AdhocTask for FnTask<F, Fut>
where
    F: Fn(ExecutionContext, serde_json::Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn execute(&self, ctx: ExecutionContext, payload: serde_json::Value) -> anyhow::Result<()> {
        (self.f)(ctx, payload).await
    }

    fn concurrency_limit(&self) -> Option<usize> {
        self.concurrency_limit
    }
}

/// Maps normalized classnames to handlers.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn AdhocTask>>,
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("classnames", &self.classnames())
            .finish()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the classname.
    pub fn register<T>(&mut self, classname: &str, task: T) -> &mut Self
    where
        T: AdhocTask + 'static,
    {
        self.handlers
            .insert(normalize_classname(classname), Arc::new(task));
        self
    }

    /// Register an async closure as a handler.
    pub fn register_fn<F, Fut>(&mut self, classname: &str, f: F) -> &mut Self
    where
        F: Fn(ExecutionContext, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(classname, FnTask::new(f))
    }

    pub fn get(&self, classname: &str) -> Option<Arc<dyn AdhocTask>> {
        self.handlers.get(&normalize_classname(classname)).cloned()
    }

    pub fn contains(&self, classname: &str) -> bool {
        self.handlers.contains_key(&normalize_classname(classname))
    }

    /// Registered classnames, sorted.
    pub fn classnames(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Concurrency ceilings declared by handlers.
    pub fn concurrency_limits(&self) -> HashMap<String, usize> {
        self.handlers
            .iter()
            .filter_map(|(classname, task)| {
                task.concurrency_limit()
                    .map(|limit| (classname.clone(), limit))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Result of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOutcome {
    pub result: Result<(), TaskFailure>,
    pub duration: Duration,
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

/// Runs handlers for claimed records.
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    registry: Arc<TaskRegistry>,
}

impl TaskExecutor {
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    /// Execute the handler for `record`.
    ///
    /// With `max_runtime` set, a handler still running when the budget
    /// elapses is aborted at its next await point and reported as a timeout.
    /// Handler errors and panics are reported as failures; they never escape.
    pub async fn run(
        &self,
        record: &AdhocTaskRecord,
        worker: WorkerId,
        max_runtime: Option<Duration>,
    ) -> TaskOutcome {
        let started = Instant::now();

        let Some(handler) = self.registry.get(&record.classname) else {
            return TaskOutcome {
                result: Err(TaskFailure::MissingHandler(record.classname.clone())),
                duration: started.elapsed(),
            };
        };

        let ctx = ExecutionContext::for_record(record, worker, Utc::now());
        let payload = record.payload.clone();
        debug!(task_id = %record.id, classname = %record.classname, "executing task");

        let mut handle = tokio::spawn(async move { handler.execute(ctx, payload).await });

        let joined = match max_runtime {
            Some(limit) => match tokio::time::timeout(limit, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    handle.abort();
                    warn!(
                        task_id = %record.id,
                        classname = %record.classname,
                        limit_secs = limit.as_secs_f64(),
                        "task exceeded maximum runtime; abandoned"
                    );
                    return TaskOutcome {
                        result: Err(TaskFailure::Timeout { limit }),
                        duration: started.elapsed(),
                    };
                }
            },
            None => handle.await,
        };

        let result = match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TaskFailure::Handler(format!("{e:#}"))),
            Err(e) if e.is_panic() => Err(TaskFailure::Panicked(panic_message(e.into_panic()))),
            Err(e) => Err(TaskFailure::Panicked(e.to_string())),
        };

        TaskOutcome {
            result,
            duration: started.elapsed(),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
