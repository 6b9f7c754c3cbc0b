//! Infrastructure layer: record stores, handler execution, the run loop and
//! configuration.

pub mod config;
pub mod executor;
pub mod runner;
pub mod store;

#[cfg(test)]
mod integration_tests;

pub use config::{ConfigError, QueueConfig};
pub use executor::{AdhocTask, ExecutionContext, FnTask, TaskExecutor, TaskOutcome, TaskRegistry};
pub use runner::{
    AdhocTaskRunner, Invocation, RunError, RunMode, RunOptions, RunReport, StopReason, TaskReport,
};
pub use store::{
    ClaimByIdRequest, ClaimRequest, ClaimedTask, InMemoryTaskStore, LockRequest, SqliteTaskStore,
    StoreError, TaskFilter, TaskStore,
};
