//! Integration tests for the full claim → execute → reconcile pipeline.
//!
//! Tests: Enqueue → TaskStore → AdhocTaskRunner → TaskExecutor → TaskStore
//!
//! Verifies:
//! - Success deletes, failure backs off, timeouts count as failures
//! - Concurrency ceilings hold across concurrent runners and processes
//! - Expired locks are reclaimed after a crash
//! - Keep-alive, task cap, run-by-id and run-failed modes

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use chrono::Utc;

    use cronq_core::{ConcurrencyLimiter, NewAdhocTask, TaskFailure, TaskId, WorkerId};

    use crate::config::QueueConfig;
    use crate::executor::TaskRegistry;
    use crate::runner::{AdhocTaskRunner, RunError, RunOptions, StopReason};
    use crate::store::{
        ClaimByIdRequest, ClaimRequest, InMemoryTaskStore, LockRequest, SqliteTaskStore,
        TaskStore,
    };

    fn config() -> QueueConfig {
        QueueConfig {
            poll_interval_ms: 20,
            ..Default::default()
        }
    }

    fn runner<S: TaskStore>(store: S, registry: TaskRegistry) -> AdhocTaskRunner<S> {
        AdhocTaskRunner::new(store, Arc::new(registry), config())
    }

    async fn enqueue(store: &impl TaskStore, classname: &str) -> TaskId {
        store
            .enqueue(NewAdhocTask::new(classname, serde_json::json!({})), Utc::now())
            .await
            .unwrap()
    }

    /// Tracks how many handler instances of one class run at once.
    #[derive(Default)]
    struct InFlight {
        current: AtomicUsize,
        peak: AtomicUsize,
        runs: Mutex<HashMap<TaskId, usize>>,
    }

    impl InFlight {
        async fn enter(&self, id: TaskId, hold: Duration) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            *self.runs.lock().unwrap().entry(id).or_default() += 1;
            tokio::time::sleep(hold).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn tracked(registry: &mut TaskRegistry, classname: &str, tracker: Arc<InFlight>) {
        registry.register_fn(classname, move |ctx, _| {
            let tracker = tracker.clone();
            async move {
                tracker.enter(ctx.task_id, Duration::from_millis(15)).await;
                Ok(())
            }
        });
    }

    #[tokio::test]
    async fn successful_task_is_deleted() {
        let store = InMemoryTaskStore::arc();
        let id = enqueue(&store, "A").await;

        let mut registry = TaskRegistry::new();
        registry.register_fn("A", |_, _| async { Ok(()) });

        let report = runner(store.clone(), registry)
            .run_due(&RunOptions::default())
            .await
            .unwrap();

        assert_eq!(report.executed, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.entries[0].id, id);
        assert_eq!(report.stop_reason, StopReason::Drained);
        assert!(store.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failing_task_backs_off_and_doubles() {
        let store = InMemoryTaskStore::arc();
        let id = enqueue(&store, "B").await;

        let mut registry = TaskRegistry::new();
        registry.register_fn("B", |_, _| async { anyhow::bail!("upstream unavailable") });
        let runner = runner(store.clone(), registry);

        let before = Utc::now();
        let report = runner.run_due(&RunOptions::default()).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(
            report.entries[0].error.as_deref(),
            Some("handler failed: upstream unavailable")
        );

        let record = store.get(id).await.unwrap().unwrap();
        assert_eq!(record.faildelay, 60);
        assert!(record.lockedby.is_none());
        assert!(record.nextruntime >= before + chrono::Duration::seconds(60));
        assert!(record.nextruntime <= Utc::now() + chrono::Duration::seconds(60));

        // Not eligible again right away.
        let rerun = runner.run_due(&RunOptions::default()).await.unwrap();
        assert_eq!(rerun.executed, 0);

        // Eligible once the delay has passed.
        let limiter = ConcurrencyLimiter::unlimited();
        let at = record.nextruntime;
        let due_again = ClaimRequest {
            lock: LockRequest {
                worker: WorkerId::new(),
                now: at,
                lock_until: at + chrono::Duration::seconds(1),
            },
            classname: None,
            limiter: &limiter,
        };
        let claimed = store.claim_next(&due_again).await.unwrap().unwrap();
        assert_eq!(claimed.record.id, id);
        store.unlock_stale(at + chrono::Duration::seconds(2)).await.unwrap();

        // A second failure doubles the delay.
        runner.run_failed(&RunOptions::default()).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().unwrap().faildelay, 120);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn per_class_ceiling_holds_across_concurrent_runners() {
        let store = InMemoryTaskStore::arc();
        for _ in 0..2 {
            enqueue(&store, "X").await;
        }

        let tracker = Arc::new(InFlight::default());
        let mut cfg = config();
        cfg.class_limits.insert("X".into(), 1);

        let make = || {
            let mut registry = TaskRegistry::new();
            tracked(&mut registry, "X", tracker.clone());
            AdhocTaskRunner::new(store.clone(), Arc::new(registry), cfg.clone())
        };
        let (first, second) = (make(), make());

        let options = RunOptions::default();
        let (a, b) = tokio::join!(first.run_due(&options), second.run_due(&options));
        let executed = a.unwrap().executed + b.unwrap().executed;

        assert_eq!(executed, 2);
        assert_eq!(tracker.peak.load(Ordering::SeqCst), 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn second_claim_is_denied_until_the_first_releases() {
        let store = InMemoryTaskStore::arc();
        let first_id = enqueue(&store, "X").await;
        let second_id = enqueue(&store, "X").await;

        let limiter = ConcurrencyLimiter::new(
            cronq_core::ConcurrencyLimits::default().with_class_limit("X", 1),
        );
        let worker = WorkerId::new();
        let now = Utc::now();
        let request = ClaimRequest {
            lock: LockRequest {
                worker,
                now,
                lock_until: now + chrono::Duration::seconds(60),
            },
            classname: Some("X"),
            limiter: &limiter,
        };

        let first = store.claim_next(&request).await.unwrap().unwrap();
        assert_eq!(first.record.id, first_id);
        assert!(store.claim_next(&request).await.unwrap().is_none());

        store.complete(&first.record, worker).await.unwrap();
        let second = store.claim_next(&request).await.unwrap().unwrap();
        assert_eq!(second.record.id, second_id);
    }

    #[tokio::test]
    async fn run_by_id_unknown_task_is_not_found() {
        let store = InMemoryTaskStore::arc();
        let existing = enqueue(&store, "A").await;

        let err = runner(store.clone(), TaskRegistry::new())
            .run_by_id(TaskId::new(999), &RunOptions::default())
            .await
            .unwrap_err();

        assert!(matches!(err, RunError::NotFound(id) if id == TaskId::new(999)));
        let untouched = store.get(existing).await.unwrap().unwrap();
        assert!(untouched.lockedby.is_none());
        assert_eq!(untouched.faildelay, 0);
    }

    #[tokio::test]
    async fn run_by_id_ignores_schedule_and_limits() {
        let store = InMemoryTaskStore::arc();
        let id = store
            .enqueue(
                NewAdhocTask::new("X", serde_json::json!({})).delayed(Utc::now(), Duration::from_secs(3600)),
                Utc::now(),
            )
            .await
            .unwrap();

        let mut cfg = config();
        cfg.class_limits.insert("X".into(), 0);
        let mut registry = TaskRegistry::new();
        registry.register_fn("X", |_, _| async { Ok(()) });
        let runner = AdhocTaskRunner::new(store.clone(), Arc::new(registry), cfg);

        let report = runner.run_by_id(id, &RunOptions::default()).await.unwrap();
        assert_eq!(report.stop_reason, StopReason::SingleTask);
        assert_eq!(report.succeeded, 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn run_by_id_refuses_a_running_task() {
        let store = InMemoryTaskStore::arc();
        let id = enqueue(&store, "A").await;

        let limiter = ConcurrencyLimiter::unlimited();
        let now = Utc::now();
        store
            .claim_next(&ClaimRequest {
                lock: LockRequest {
                    worker: WorkerId::new(),
                    now,
                    lock_until: now + chrono::Duration::seconds(600),
                },
                classname: None,
                limiter: &limiter,
            })
            .await
            .unwrap()
            .unwrap();

        let err = runner(store, TaskRegistry::new())
            .run_by_id(id, &RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::AlreadyRunning(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_a_failure_and_the_loop_moves_on() {
        let store = InMemoryTaskStore::arc();
        let slow = enqueue(&store, "Slow").await;
        let fast = enqueue(&store, "Fast").await;

        let mut registry = TaskRegistry::new();
        registry.register_fn("Slow", |_, _| async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        });
        registry.register_fn("Fast", |_, _| async { Ok(()) });

        let mut cfg = config();
        cfg.max_runtime_secs = 1;
        let report = AdhocTaskRunner::new(store.clone(), Arc::new(registry), cfg)
            .run_due(&RunOptions::default())
            .await
            .unwrap();

        assert_eq!(report.executed, 2);
        assert_eq!(report.entries[0].id, slow);
        assert_eq!(
            report.entries[0].error,
            Some(TaskFailure::Timeout { limit: Duration::from_secs(1) }.to_string())
        );
        assert_eq!(report.entries[1].id, fast);
        assert!(report.entries[1].success);

        let record = store.get(slow).await.unwrap().unwrap();
        assert_eq!(record.faildelay, 60);
        assert!(record.lockedby.is_none());
    }

    #[tokio::test]
    async fn missing_handler_goes_through_backoff() {
        let store = InMemoryTaskStore::arc();
        let id = enqueue(&store, "\\unknown\\task").await;

        let report = runner(store.clone(), TaskRegistry::new())
            .run_due(&RunOptions::default())
            .await
            .unwrap();

        assert_eq!(report.failed, 1);
        assert_eq!(store.get(id).await.unwrap().unwrap().faildelay, 60);
    }

    #[tokio::test]
    async fn tasks_limit_caps_one_invocation() {
        let store = InMemoryTaskStore::arc();
        for _ in 0..5 {
            enqueue(&store, "A").await;
        }
        let mut registry = TaskRegistry::new();
        registry.register_fn("A", |_, _| async { Ok(()) });

        let report = runner(store.clone(), registry)
            .run_due(&RunOptions {
                tasks_limit: Some(2),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(report.executed, 2);
        assert_eq!(report.stop_reason, StopReason::TasksLimitReached);
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn keep_alive_picks_up_late_work_then_expires() {
        let store = InMemoryTaskStore::arc();
        let mut registry = TaskRegistry::new();
        registry.register_fn("A", |_, _| async { Ok(()) });
        let runner = runner(store.clone(), registry);

        let producer = {
            let store = store.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(80)).await;
                enqueue(&store, "A").await
            })
        };

        let started = std::time::Instant::now();
        let report = runner
            .run_due(&RunOptions {
                keep_alive: Some(Duration::from_millis(300)),
                ..Default::default()
            })
            .await
            .unwrap();
        let late = producer.await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(report.stop_reason, StopReason::KeepAliveExpired);
        assert_eq!(report.executed, 1);
        assert_eq!(report.entries[0].id, late);
    }

    #[tokio::test]
    async fn run_failed_only_runs_failing_tasks_in_id_order() {
        let store = InMemoryTaskStore::arc();
        let ids = [
            enqueue(&store, "A").await,
            enqueue(&store, "B").await,
            enqueue(&store, "A").await,
        ];

        // First pass fails everything of class A.
        let mut failing = TaskRegistry::new();
        failing.register_fn("A", |_, _| async { anyhow::bail!("nope") });
        runner(store.clone(), failing)
            .run_due(&RunOptions {
                classname: Some("A".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        let mut registry = TaskRegistry::new();
        registry.register_fn("A", |_, _| async { Ok(()) });
        registry.register_fn("B", |_, _| async { Ok(()) });
        let report = runner(store.clone(), registry)
            .run_failed(&RunOptions::default())
            .await
            .unwrap();

        let ran: Vec<TaskId> = report.entries.iter().map(|e| e.id).collect();
        assert_eq!(ran, vec![ids[0], ids[2]]);
        assert_eq!(report.succeeded, 2);
        // The never-failed task is left for the normal schedule.
        assert!(store.get(ids[1]).await.unwrap().is_some());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn run_failed_honours_tasks_limit() {
        let store = InMemoryTaskStore::arc();
        for _ in 0..3 {
            enqueue(&store, "A").await;
        }
        let mut failing = TaskRegistry::new();
        failing.register_fn("A", |_, _| async { anyhow::bail!("nope") });
        runner(store.clone(), failing)
            .run_due(&RunOptions::default())
            .await
            .unwrap();

        let mut registry = TaskRegistry::new();
        registry.register_fn("A", |_, _| async { Ok(()) });
        let report = runner(store.clone(), registry)
            .run_failed(&RunOptions {
                tasks_limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(report.executed, 1);
        assert_eq!(report.stop_reason, StopReason::TasksLimitReached);
        assert_eq!(store.find_failed(None).await.unwrap().len(), 2);
    }

    /// One failing `X` task plus an `X` task held by another live worker.
    async fn failing_task_behind_a_busy_class(store: &Arc<InMemoryTaskStore>) -> (TaskId, TaskId) {
        let failed = enqueue(store, "X").await;
        let mut failing = TaskRegistry::new();
        failing.register_fn("X", |_, _| async { anyhow::bail!("nope") });
        runner(store.clone(), failing)
            .run_due(&RunOptions::default())
            .await
            .unwrap();
        assert_eq!(store.get(failed).await.unwrap().unwrap().faildelay, 60);

        let busy = enqueue(store, "X").await;
        let now = Utc::now();
        store
            .claim_by_id(
                busy,
                &ClaimByIdRequest {
                    lock: LockRequest {
                        worker: WorkerId::new(),
                        now,
                        lock_until: now + chrono::Duration::seconds(600),
                    },
                    limiter: None,
                },
            )
            .await
            .unwrap();
        (failed, busy)
    }

    #[tokio::test]
    async fn run_failed_skips_tasks_over_their_class_limit() {
        let store = InMemoryTaskStore::arc();
        let (failed, busy) = failing_task_behind_a_busy_class(&store).await;

        let mut cfg = config();
        cfg.class_limits.insert("X".into(), 1);
        let mut registry = TaskRegistry::new();
        registry.register_fn("X", |_, _| async { Ok(()) });
        let report = AdhocTaskRunner::new(store.clone(), Arc::new(registry), cfg)
            .run_failed(&RunOptions::default())
            .await
            .unwrap();

        assert_eq!(report.executed, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.stop_reason, StopReason::Drained);
        let record = store.get(failed).await.unwrap().unwrap();
        assert_eq!(record.faildelay, 60);
        assert!(record.lockedby.is_none());
        assert!(store.get(busy).await.unwrap().unwrap().lockedby.is_some());
    }

    #[tokio::test]
    async fn run_failed_with_ignore_limits_runs_past_a_full_class() {
        let store = InMemoryTaskStore::arc();
        let (failed, busy) = failing_task_behind_a_busy_class(&store).await;

        let mut cfg = config();
        cfg.class_limits.insert("X".into(), 1);
        let mut registry = TaskRegistry::new();
        registry.register_fn("X", |_, _| async { Ok(()) });
        let report = AdhocTaskRunner::new(store.clone(), Arc::new(registry), cfg)
            .run_failed(&RunOptions {
                ignore_limits: true,
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(report.executed, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.skipped, 0);
        assert_eq!(report.entries[0].id, failed);
        assert!(store.get(failed).await.unwrap().is_none());
        assert!(store.get(busy).await.unwrap().unwrap().lockedby.is_some());
    }

    #[tokio::test]
    async fn expired_lock_of_crashed_worker_is_reclaimed() {
        let store = InMemoryTaskStore::arc();
        let id = enqueue(&store, "A").await;

        // A worker claims and then dies without releasing.
        let limiter = ConcurrencyLimiter::unlimited();
        let now = Utc::now();
        store
            .claim_next(&ClaimRequest {
                lock: LockRequest {
                    worker: WorkerId::new(),
                    now: now - chrono::Duration::seconds(120),
                    lock_until: now - chrono::Duration::seconds(60),
                },
                classname: None,
                limiter: &limiter,
            })
            .await
            .unwrap()
            .unwrap();

        let mut registry = TaskRegistry::new();
        registry.register_fn("A", |_, _| async { Ok(()) });
        let report = runner(store.clone(), registry)
            .run_due(&RunOptions::default())
            .await
            .unwrap();

        assert_eq!(report.reclaimed, vec![id]);
        assert_eq!(report.succeeded, 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn lost_lock_is_logged_and_the_record_survives() {
        let store = InMemoryTaskStore::arc();
        let id = enqueue(&store, "A").await;

        // The handler's lock is cleared under it, as a stale sweep would.
        let mut registry = TaskRegistry::new();
        let sweeper = store.clone();
        registry.register_fn("A", move |_, _| {
            let sweeper = sweeper.clone();
            async move {
                sweeper
                    .unlock_stale(Utc::now() + chrono::Duration::days(7))
                    .await?;
                Ok::<(), anyhow::Error>(())
            }
        });

        let report = runner(store.clone(), registry)
            .run_due(&RunOptions {
                tasks_limit: Some(1),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(report.succeeded, 1);
        let record = store.get(id).await.unwrap().unwrap();
        assert!(record.lockedby.is_none());
    }

    #[tokio::test]
    async fn disabled_queue_requires_force() {
        let store = InMemoryTaskStore::arc();
        enqueue(&store, "A").await;
        let mut registry = TaskRegistry::new();
        registry.register_fn("A", |_, _| async { Ok(()) });

        let mut cfg = config();
        cfg.enabled = false;
        let runner = AdhocTaskRunner::new(store.clone(), Arc::new(registry), cfg);

        assert!(matches!(
            runner.run_due(&RunOptions::default()).await,
            Err(RunError::Disabled)
        ));
        assert_eq!(store.len(), 1);

        let report = runner
            .run_due(&RunOptions {
                force: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(report.executed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn sqlite_workers_sharing_a_file_never_double_run() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("queue.db").display());

        let first_store = SqliteTaskStore::connect(&url).await.unwrap();
        let second_store = SqliteTaskStore::connect(&url).await.unwrap();

        let mut ids = Vec::new();
        for i in 0..12 {
            let classname = if i % 3 == 0 { "X" } else { "A" };
            ids.push(enqueue(&first_store, classname).await);
        }

        let limited = Arc::new(InFlight::default());
        let unlimited = Arc::new(InFlight::default());
        let mut cfg = config();
        cfg.class_limits.insert("X".into(), 1);

        let make = |store: SqliteTaskStore| {
            let mut registry = TaskRegistry::new();
            tracked(&mut registry, "X", limited.clone());
            tracked(&mut registry, "A", unlimited.clone());
            AdhocTaskRunner::new(store, Arc::new(registry), cfg.clone())
        };
        let (first, second) = (make(first_store.clone()), make(second_store));

        let options = RunOptions::default();
        let (a, b) = tokio::join!(first.run_due(&options), second.run_due(&options));
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.executed + b.executed, ids.len());
        assert_eq!(limited.peak.load(Ordering::SeqCst), 1);

        let mut runs = limited.runs.lock().unwrap().clone();
        runs.extend(unlimited.runs.lock().unwrap().iter().map(|(k, v)| (*k, *v)));
        assert_eq!(runs.len(), ids.len());
        assert!(runs.values().all(|count| *count == 1));

        assert!(first_store.summary(Utc::now(), None).await.unwrap().is_empty());
    }
}
