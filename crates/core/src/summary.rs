//! Read-only queue summaries for listing surfaces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record::{AdhocTaskRecord, TaskState};

/// Aggregate counts for one classname.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassSummary {
    pub classname: String,
    pub count: usize,
    pub due: usize,
    pub waiting: usize,
    pub running: usize,
    pub stuck: usize,
    pub failing: usize,
    /// Earliest `nextruntime` in the class.
    pub next_runtime: Option<DateTime<Utc>>,
}

impl ClassSummary {
    pub fn empty(classname: impl Into<String>) -> Self {
        Self {
            classname: classname.into(),
            count: 0,
            due: 0,
            waiting: 0,
            running: 0,
            stuck: 0,
            failing: 0,
            next_runtime: None,
        }
    }

    /// Fold one record into the summary.
    pub fn observe(&mut self, record: &AdhocTaskRecord, now: DateTime<Utc>) {
        self.count += 1;
        match record.state(now) {
            TaskState::Due => self.due += 1,
            TaskState::Waiting => self.waiting += 1,
            TaskState::Running => self.running += 1,
            TaskState::Stuck => self.stuck += 1,
        }
        if record.is_failing() {
            self.failing += 1;
        }
        self.next_runtime = Some(match self.next_runtime {
            Some(current) => current.min(record.nextruntime),
            None => record.nextruntime,
        });
    }

    fn merge(&mut self, other: &ClassSummary) {
        self.count += other.count;
        self.due += other.due;
        self.waiting += other.waiting;
        self.running += other.running;
        self.stuck += other.stuck;
        self.failing += other.failing;
        self.next_runtime = match (self.next_runtime, other.next_runtime) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
    }
}

/// Per-class summaries, ordered by classname.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSummary {
    pub classes: Vec<ClassSummary>,
}

impl QueueSummary {
    /// Build from a set of records evaluated at `now`.
    pub fn from_records<'a>(
        records: impl IntoIterator<Item = &'a AdhocTaskRecord>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut by_class: std::collections::BTreeMap<&str, ClassSummary> =
            std::collections::BTreeMap::new();
        for record in records {
            by_class
                .entry(record.classname.as_str())
                .or_insert_with(|| ClassSummary::empty(record.classname.clone()))
                .observe(record, now);
        }
        Self {
            classes: by_class.into_values().collect(),
        }
    }

    pub fn class(&self, classname: &str) -> Option<&ClassSummary> {
        self.classes.iter().find(|c| c.classname == classname)
    }

    /// Totals across all classes.
    pub fn total(&self) -> ClassSummary {
        let mut total = ClassSummary::empty("*");
        for class in &self.classes {
            total.merge(class);
        }
        total
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}
