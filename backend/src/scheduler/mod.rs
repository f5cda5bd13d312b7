//! Task lifecycle engine: clock registry, supervisor, listener, and the
//! pieces every job shares (cursor ranges, error classification).

pub mod classifier;
pub mod cursor;
pub mod job;
pub mod listener;
pub mod registry;
pub mod supervisor;

pub use classifier::{ErrorClassifier, RunError, Severity};
pub use cursor::{next_range, CursorRange};
pub use job::{CursorJob, CursorJobRunner, JobCatalog, JobContext, JobError, JobKind, TaskFn, TaskRunner};
pub use listener::{Listener, ListenerEvent};
pub use registry::Registry;
pub use supervisor::{listener_id, TaskState, TaskSupervisor, TickOutcome};

use cron::Schedule;
use std::str::FromStr;
use thiserror::Error;

use crate::database::StoreError;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },
    #[error("task not registered: {0}")]
    NotRegistered(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Parses a cron expression. Seconds-first 6/7-field expressions are taken
/// as-is; classic 5-field expressions get a leading `0` seconds field.
pub fn parse_cron(expression: &str) -> Result<Schedule, SchedulerError> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    };

    Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCron {
        expression: expression.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cron_accepts_both_syntaxes() {
        assert!(parse_cron("0 */10 * * * *").is_ok());
        assert!(parse_cron("*/5 * * * *").is_ok());
        assert!(parse_cron("  0 0 * * * * 2030 ").is_ok());
    }

    #[test]
    fn test_parse_cron_rejects_garbage() {
        let err = parse_cron("every tuesday").unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidCron { .. }));
        assert!(err.to_string().contains("every tuesday"));
        assert!(parse_cron("").is_err());
        assert!(parse_cron("99 * * * * *").is_err());
    }
}
