//! Per-task listener: reconciles the persisted desired state (`enabled`,
//! `cron`) with the live task clock.
//!
//! The listener runs on its own clock, independent of the task's, so a
//! disabled or panicked task can still be brought back by flipping its row.
//! Read failures are logged and swallowed; the next listener tick retries.

use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::parse_cron;
use super::supervisor::TaskSupervisor;
use crate::database::TaskStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    Restarted,
    Stopped,
    Halted,
    Rescheduled(String),
    InvalidCron(String),
}

struct Observed {
    enabled: bool,
    cron: String,
}

pub struct Listener {
    task_id: String,
    supervisor: Weak<TaskSupervisor>,
    store: Arc<dyn TaskStore>,
    observed: Mutex<Observed>,
}

impl Listener {
    pub fn new(
        task_id: &str,
        enabled: bool,
        cron: &str,
        supervisor: Weak<TaskSupervisor>,
        store: Arc<dyn TaskStore>,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            supervisor,
            store,
            observed: Mutex::new(Observed {
                enabled,
                cron: cron.to_string(),
            }),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Records that the supervisor disabled the task after a fatal failure,
    /// so the next `enabled=true` read from the row counts as a manual restart.
    pub async fn note_halted(&self) {
        self.observed.lock().await.enabled = false;
    }

    /// One listener tick. Returns what changed.
    pub async fn reconcile(&self) -> Vec<ListenerEvent> {
        let id = self.task_id.as_str();
        let mut observed = self.observed.lock().await;
        let mut events = Vec::new();

        let record = match self.store.get_task(id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(task = id, "listener could not read task row: {}", e);
                return events;
            }
        };
        let Some(supervisor) = self.supervisor.upgrade() else {
            return events;
        };

        if record.enabled != observed.enabled {
            if record.enabled {
                match supervisor.start(id).await {
                    Ok(()) => {
                        info!(task = id, "manual restart");
                        events.push(ListenerEvent::Restarted);
                    }
                    Err(e) => {
                        warn!(task = id, "manual restart failed, will retry: {}", e);
                        return events;
                    }
                }
            } else {
                if let Err(e) = supervisor.stop(id) {
                    warn!(task = id, "failed to stop clock: {}", e);
                }
                if record.panicked {
                    debug!(task = id, "task halted after fatal failure");
                    events.push(ListenerEvent::Halted);
                } else {
                    info!(task = id, "manual stop");
                    events.push(ListenerEvent::Stopped);
                }
            }
            observed.enabled = record.enabled;
        }

        if record.cron != observed.cron {
            match parse_cron(&record.cron) {
                Ok(_) => {
                    let applied = if record.enabled {
                        supervisor.set_cron(id, &record.cron)
                    } else {
                        supervisor.replace_cron(id, &record.cron)
                    };
                    match applied {
                        Ok(()) => {
                            info!(task = id, cron = %record.cron, "cron changed");
                            events.push(ListenerEvent::Rescheduled(record.cron.clone()));
                        }
                        Err(e) => warn!(task = id, "failed to apply cron change: {}", e),
                    }
                }
                Err(e) => {
                    warn!(task = id, "ignoring invalid cron: {}", e);
                    events.push(ListenerEvent::InvalidCron(record.cron.clone()));
                }
            }
            observed.cron = record.cron;
        }

        events
    }
}
