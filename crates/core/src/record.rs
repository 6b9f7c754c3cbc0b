//! Ad-hoc task records and their derived states.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::id::{TaskId, WorkerId};

/// Normalize a classname for storage and comparison.
///
/// Strips surrounding whitespace and a leading namespace separator, so
/// `\mod\task\foo` and `mod\task\foo` name the same class.
pub fn normalize_classname(classname: &str) -> String {
    classname.trim().trim_start_matches('\\').to_string()
}

/// A task waiting to be enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAdhocTask {
    pub classname: String,
    pub payload: serde_json::Value,
    /// Earliest execution time; `None` means "now".
    pub nextruntime: Option<DateTime<Utc>>,
    pub blocking: bool,
    /// Opaque identity the task should run as.
    pub userid: Option<i64>,
}

impl NewAdhocTask {
    pub fn new(classname: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            classname: classname.into(),
            payload,
            nextruntime: None,
            blocking: false,
            userid: None,
        }
    }

    /// Schedule the task for later execution.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.nextruntime = Some(at);
        self
    }

    /// Schedule the task with a delay from `now`.
    pub fn delayed(mut self, now: DateTime<Utc>, delay: Duration) -> Self {
        self.nextruntime = Some(now + chrono::Duration::from_std(delay).unwrap_or_default());
        self
    }

    pub fn blocking(mut self, blocking: bool) -> Self {
        self.blocking = blocking;
        self
    }

    pub fn run_as(mut self, userid: i64) -> Self {
        self.userid = Some(userid);
        self
    }

    /// Validate and turn into a stored record with the given id.
    pub fn into_record(self, id: TaskId, now: DateTime<Utc>) -> DomainResult<AdhocTaskRecord> {
        let classname = normalize_classname(&self.classname);
        if classname.is_empty() {
            return Err(DomainError::validation("classname must not be empty"));
        }

        Ok(AdhocTaskRecord {
            id,
            classname,
            payload: self.payload,
            nextruntime: self.nextruntime.unwrap_or(now),
            faildelay: 0,
            lockedby: None,
            lockexpiry: None,
            timestarted: None,
            blocking: self.blocking,
            userid: self.userid,
            timecreated: now,
        })
    }
}

/// A queued ad-hoc task as persisted by the record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdhocTaskRecord {
    pub id: TaskId,
    pub classname: String,
    pub payload: serde_json::Value,
    /// Not eligible before this instant.
    pub nextruntime: DateTime<Utc>,
    /// Current failure backoff in seconds; 0 = never failed.
    pub faildelay: u64,
    pub lockedby: Option<WorkerId>,
    pub lockexpiry: Option<DateTime<Utc>>,
    /// When the current holder claimed the record.
    pub timestarted: Option<DateTime<Utc>>,
    pub blocking: bool,
    pub userid: Option<i64>,
    pub timecreated: DateTime<Utc>,
}

/// Derived scheduling state of a record at some instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Unlocked and eligible.
    Due,
    /// Unlocked, `nextruntime` in the future.
    Waiting,
    /// Held by a live lock.
    Running,
    /// Lock expired without a completion signal.
    Stuck,
}

impl AdhocTaskRecord {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.nextruntime <= now
    }

    /// Held by a non-expired lock.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.lockedby.is_some() && self.lockexpiry.is_some_and(|expiry| expiry >= now)
    }

    /// Unlocked, or the previous holder's lock has expired.
    pub fn is_available(&self, now: DateTime<Utc>) -> bool {
        !self.is_locked(now)
    }

    /// Eligible for `claim_next`: due and available.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.is_due(now) && self.is_available(now)
    }

    pub fn is_failing(&self) -> bool {
        self.faildelay > 0
    }

    pub fn is_locked_by(&self, worker: WorkerId) -> bool {
        self.lockedby == Some(worker)
    }

    pub fn state(&self, now: DateTime<Utc>) -> TaskState {
        match (self.lockedby, self.is_locked(now)) {
            (Some(_), true) => TaskState::Running,
            (Some(_), false) => TaskState::Stuck,
            (None, _) if self.is_due(now) => TaskState::Due,
            (None, _) => TaskState::Waiting,
        }
    }

    /// Mark as claimed by `worker` until `lockexpiry`.
    pub fn lock(&mut self, worker: WorkerId, now: DateTime<Utc>, lockexpiry: DateTime<Utc>) {
        self.lockedby = Some(worker);
        self.lockexpiry = Some(lockexpiry);
        self.timestarted = Some(now);
    }

    pub fn unlock(&mut self) {
        self.lockedby = None;
        self.lockexpiry = None;
        self.timestarted = None;
    }

    /// Unlock and persist new backoff state.
    pub fn reschedule(&mut self, faildelay: u64, nextruntime: DateTime<Utc>) {
        self.unlock();
        self.faildelay = faildelay;
        self.nextruntime = nextruntime;
    }
}
