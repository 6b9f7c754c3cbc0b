//! Worker entry point wiring: configuration, record store, handler registry.
//!
//! Applications embed this crate, register their handlers and call
//! [`run_worker`]. The `cronq-worker` binary has no handlers of its own, so it
//! only reports the queue through [`queue_summary`].

pub mod invocation;

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tracing::info;

use cronq_core::{normalize_classname, QueueSummary};
use cronq_infra::{
    AdhocTaskRunner, Invocation, QueueConfig, RunReport, SqliteTaskStore, TaskRegistry, TaskStore,
};

pub use invocation::{parse_invocation, InvocationError};

/// Run one invocation against the SQLite store named by `config`.
///
/// Refuses to start without handlers: every claimed task would fail and
/// have its fail delay doubled.
pub async fn run_worker(
    registry: TaskRegistry,
    config: QueueConfig,
    invocation: &Invocation,
) -> anyhow::Result<RunReport> {
    if registry.is_empty() {
        anyhow::bail!("no task handlers registered; refusing to claim tasks");
    }
    info!(handlers = ?registry.classnames(), "task handlers registered");

    let store = open_store(&config).await?;

    let runner = AdhocTaskRunner::new(store, Arc::new(registry), config);
    let report = runner
        .run(invocation)
        .await
        .context("ad-hoc task invocation failed")?;
    Ok(report)
}

/// Read-only per-class overview, optionally narrowed to one classname.
pub async fn queue_summary(
    config: &QueueConfig,
    classname: Option<&str>,
) -> anyhow::Result<QueueSummary> {
    let store = open_store(config).await?;
    let classname = classname.map(normalize_classname);
    let summary = store
        .summary(Utc::now(), classname.as_deref())
        .await
        .context("failed to summarize the task queue")?;
    Ok(summary)
}

async fn open_store(config: &QueueConfig) -> anyhow::Result<SqliteTaskStore> {
    SqliteTaskStore::connect(&config.database_url)
        .await
        .with_context(|| format!("failed to open task store at {}", config.database_url))
}
