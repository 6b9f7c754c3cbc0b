//! Worker invocation read from environment variables.
//!
//! `CRONQ_TASK_ID` selects run-by-id and wins over `CRONQ_FAILED`; otherwise
//! the worker runs due tasks. Zero keep-alive or task cap means "unset".

use std::time::Duration;

use cronq_core::TaskId;
use cronq_infra::config::{parse_flag, parse_value, ConfigError};
use cronq_infra::{Invocation, RunMode, RunOptions};

pub const ENV_TASK_ID: &str = "CRONQ_TASK_ID";
pub const ENV_FAILED: &str = "CRONQ_FAILED";
pub const ENV_CLASSNAME: &str = "CRONQ_CLASSNAME";
pub const ENV_KEEP_ALIVE: &str = "CRONQ_KEEP_ALIVE";
pub const ENV_TASKS_LIMIT: &str = "CRONQ_TASKS_LIMIT";
pub const ENV_IGNORE_LIMITS: &str = "CRONQ_IGNORE_LIMITS";
pub const ENV_FORCE: &str = "CRONQ_FORCE";

#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    #[error(transparent)]
    InvalidValue(#[from] ConfigError),
    #[error("{ENV_TASK_ID} must be a positive task id, got {0:?}")]
    InvalidTaskId(String),
}

/// Build an invocation from a key lookup (normally the process environment).
pub fn parse_invocation<F>(lookup: F) -> Result<Invocation, InvocationError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    let classname = get(ENV_CLASSNAME).map(|c| c.trim().to_string());
    let keep_alive = match get(ENV_KEEP_ALIVE) {
        Some(v) => Some(parse_value::<u64>(ENV_KEEP_ALIVE, &v)?),
        None => None,
    }
    .filter(|secs| *secs > 0)
    .map(Duration::from_secs);
    let tasks_limit = match get(ENV_TASKS_LIMIT) {
        Some(v) => Some(parse_value::<usize>(ENV_TASKS_LIMIT, &v)?),
        None => None,
    }
    .filter(|limit| *limit > 0);
    let ignore_limits = match get(ENV_IGNORE_LIMITS) {
        Some(v) => parse_flag(ENV_IGNORE_LIMITS, &v)?,
        None => false,
    };
    let force = match get(ENV_FORCE) {
        Some(v) => parse_flag(ENV_FORCE, &v)?,
        None => false,
    };
    let failed = match get(ENV_FAILED) {
        Some(v) => parse_flag(ENV_FAILED, &v)?,
        None => false,
    };

    let mode = match get(ENV_TASK_ID) {
        Some(v) => {
            let id: TaskId = v
                .trim()
                .parse()
                .map_err(|_| InvocationError::InvalidTaskId(v.clone()))?;
            RunMode::ById(id)
        }
        None if failed => RunMode::Failed,
        None => RunMode::Due,
    };

    Ok(Invocation {
        mode,
        options: RunOptions {
            classname,
            keep_alive,
            tasks_limit,
            ignore_limits,
            force,
        },
    })
}
