//! Concurrency ceilings derived from live locks.
//!
//! Workers are independent processes, so the limiter keeps no counters of
//! its own. The record store counts live locks ([`RunningCounts`]) inside the
//! same atomic section that writes the claim, and the limiter decides from
//! that snapshot. A [`Slot`] is therefore the claimed record's lock: it is
//! released by completing, rescheduling, or letting the lock expire.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::LimitDenied;
use crate::record::{normalize_classname, AdhocTaskRecord};

/// Configured ceilings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyLimits {
    /// Ordinary (non-blocking) tasks running at once, across all classes.
    pub global: usize,
    /// Blocking tasks running at once; a separate pool from `global`.
    pub blocking: usize,
    /// Per-classname ceilings. Classes not listed are only bound by the pools.
    pub per_class: HashMap<String, usize>,
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            global: 3,
            blocking: 1,
            per_class: HashMap::new(),
        }
    }
}

impl ConcurrencyLimits {
    pub fn with_class_limit(mut self, classname: &str, limit: usize) -> Self {
        self.per_class.insert(normalize_classname(classname), limit);
        self
    }

    pub fn class_limit(&self, classname: &str) -> Option<usize> {
        self.per_class.get(classname).copied()
    }
}

/// Live-lock counts at one instant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningCounts {
    /// All live locks, blocking included.
    pub total: usize,
    pub blocking: usize,
    pub per_class: HashMap<String, usize>,
}

impl RunningCounts {
    pub fn add(&mut self, classname: &str, blocking: bool, count: usize) {
        self.total += count;
        if blocking {
            self.blocking += count;
        }
        *self.per_class.entry(classname.to_string()).or_default() += count;
    }

    pub fn ordinary(&self) -> usize {
        self.total.saturating_sub(self.blocking)
    }

    pub fn of_class(&self, classname: &str) -> usize {
        self.per_class.get(classname).copied().unwrap_or(0)
    }
}

/// A reserved execution slot for one claimed record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slot {
    pub classname: String,
    pub blocking: bool,
}

/// What a claim may pick, given a counts snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// Classes at or over their ceiling.
    pub excluded_classnames: BTreeSet<String>,
    pub ordinary_open: bool,
    pub blocking_open: bool,
}

impl Admission {
    pub fn admits(&self, classname: &str, blocking: bool) -> bool {
        let pool_open = if blocking {
            self.blocking_open
        } else {
            self.ordinary_open
        };
        pool_open && !self.excluded_classnames.contains(classname)
    }

    /// Nothing could be claimed at all.
    pub fn is_closed(&self) -> bool {
        !self.ordinary_open && !self.blocking_open
    }
}

/// Enforces [`ConcurrencyLimits`], or nothing when limits are ignored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrencyLimiter {
    limits: ConcurrencyLimits,
    ignore_limits: bool,
}

impl ConcurrencyLimiter {
    pub fn new(limits: ConcurrencyLimits) -> Self {
        Self {
            limits,
            ignore_limits: false,
        }
    }

    /// A limiter that admits everything.
    pub fn unlimited() -> Self {
        Self {
            limits: ConcurrencyLimits::default(),
            ignore_limits: true,
        }
    }

    pub fn ignoring_limits(mut self, ignore: bool) -> Self {
        self.ignore_limits = ignore;
        self
    }

    pub fn ignores_limits(&self) -> bool {
        self.ignore_limits
    }

    pub fn limits(&self) -> &ConcurrencyLimits {
        &self.limits
    }

    /// Try to take a slot for a task of `classname`.
    pub fn reserve(
        &self,
        counts: &RunningCounts,
        classname: &str,
        blocking: bool,
    ) -> Result<Slot, LimitDenied> {
        let slot = Slot {
            classname: classname.to_string(),
            blocking,
        };
        if self.ignore_limits {
            return Ok(slot);
        }

        if let Some(limit) = self.limits.class_limit(classname) {
            let running = counts.of_class(classname);
            if running >= limit {
                return Err(LimitDenied::PerClass {
                    classname: classname.to_string(),
                    running,
                    limit,
                });
            }
        }

        if blocking {
            if counts.blocking >= self.limits.blocking {
                return Err(LimitDenied::Blocking {
                    running: counts.blocking,
                    limit: self.limits.blocking,
                });
            }
        } else if counts.ordinary() >= self.limits.global {
            return Err(LimitDenied::Global {
                running: counts.ordinary(),
                limit: self.limits.global,
            });
        }

        Ok(slot)
    }

    /// Reserve a slot for a concrete record.
    pub fn reserve_for(
        &self,
        counts: &RunningCounts,
        record: &AdhocTaskRecord,
    ) -> Result<Slot, LimitDenied> {
        self.reserve(counts, &record.classname, record.blocking)
    }

    /// Summarize which records a claim may pick from `counts`.
    pub fn admission(&self, counts: &RunningCounts) -> Admission {
        if self.ignore_limits {
            return Admission {
                excluded_classnames: BTreeSet::new(),
                ordinary_open: true,
                blocking_open: true,
            };
        }

        let excluded_classnames = self
            .limits
            .per_class
            .iter()
            .filter(|(classname, limit)| counts.of_class(classname) >= **limit)
            .map(|(classname, _)| classname.clone())
            .collect();

        Admission {
            excluded_classnames,
            ordinary_open: counts.ordinary() < self.limits.global,
            blocking_open: counts.blocking < self.limits.blocking,
        }
    }
}
