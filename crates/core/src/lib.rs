//! `cronq-core`: ad-hoc task queue building blocks.
//!
//! This crate contains **pure domain** primitives (no storage or runtime
//! concerns): records, backoff, concurrency limits and summaries.

pub mod backoff;
pub mod error;
pub mod id;
pub mod limits;
pub mod record;
pub mod summary;

pub use backoff::BackoffPolicy;
pub use error::{DomainError, DomainResult, LimitDenied, TaskFailure};
pub use id::{TaskId, WorkerId};
pub use limits::{Admission, ConcurrencyLimiter, ConcurrencyLimits, RunningCounts, Slot};
pub use record::{normalize_classname, AdhocTaskRecord, NewAdhocTask, TaskState};
pub use summary::{ClassSummary, QueueSummary};
