//! Clock registry.
//!
//! One entry per id (tasks and their listeners alike). Each entry owns a cron
//! schedule, a tick callback, and, while active, a tokio task that sleeps until
//! the next upcoming time and spawns the callback. Ticks are fire-and-forget:
//! a slow callback never delays the clock, overlap handling is the
//! supervisor's job.

use chrono::Utc;
use cron::Schedule;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{parse_cron, SchedulerError};

pub type TickFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct ClockEntry {
    expression: String,
    schedule: Schedule,
    tick: TickFn,
    handle: Option<JoinHandle<()>>,
}

impl ClockEntry {
    fn is_active(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    fn halt(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[derive(Default)]
pub struct Registry {
    entries: DashMap<String, ClockEntry>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Adds (or replaces) a stopped clock. A replaced clock is halted first.
    pub fn insert(&self, id: &str, expression: &str, tick: TickFn) -> Result<(), SchedulerError> {
        let schedule = parse_cron(expression)?;
        let entry = ClockEntry {
            expression: expression.to_string(),
            schedule,
            tick,
            handle: None,
        };

        if let Some(mut previous) = self.entries.insert(id.to_string(), entry) {
            previous.halt();
            debug!(clock = id, "replaced existing clock");
        }
        Ok(())
    }

    pub fn remove(&self, id: &str) -> bool {
        match self.entries.remove(id) {
            Some((_, mut entry)) => {
                entry.halt();
                true
            }
            None => false,
        }
    }

    /// Starts the clock. Starting an active clock is a no-op.
    pub fn start(&self, id: &str) -> Result<(), SchedulerError> {
        let mut entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| SchedulerError::NotRegistered(id.to_string()))?;

        if entry.is_active() {
            return Ok(());
        }
        let handle = spawn_clock(id.to_string(), entry.schedule.clone(), entry.tick.clone());
        entry.handle = Some(handle);
        debug!(clock = id, cron = %entry.expression, "clock started");
        Ok(())
    }

    /// Stops future ticks. A tick already in flight runs to completion.
    pub fn stop(&self, id: &str) -> Result<(), SchedulerError> {
        let mut entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| SchedulerError::NotRegistered(id.to_string()))?;
        entry.halt();
        debug!(clock = id, "clock stopped");
        Ok(())
    }

    /// Swaps the schedule. With `restart` the clock is (re)started on the new
    /// schedule; otherwise it keeps its current active/stopped state.
    pub fn reschedule(&self, id: &str, expression: &str, restart: bool) -> Result<(), SchedulerError> {
        let schedule = parse_cron(expression)?;
        let mut entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| SchedulerError::NotRegistered(id.to_string()))?;

        let was_active = entry.is_active();
        entry.halt();
        entry.expression = expression.to_string();
        entry.schedule = schedule;

        if restart || was_active {
            let handle = spawn_clock(id.to_string(), entry.schedule.clone(), entry.tick.clone());
            entry.handle = Some(handle);
        }
        debug!(clock = id, cron = expression, "clock rescheduled");
        Ok(())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.entries.get(id).map(|e| e.is_active()).unwrap_or(false)
    }

    pub fn expression(&self, id: &str) -> Option<String> {
        self.entries.get(id).map(|e| e.expression.clone())
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Halts every clock. Entries stay registered.
    pub fn shutdown(&self) {
        for mut entry in self.entries.iter_mut() {
            entry.halt();
        }
    }
}

fn spawn_clock(id: String, schedule: Schedule, tick: TickFn) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                warn!(clock = %id, "schedule has no upcoming times, clock exits");
                break;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;
            tokio::spawn(tick());
        }
    })
}
