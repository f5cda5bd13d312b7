//! Task supervisor.
//!
//! Owns the tick path for every registered task: an in-process re-entrancy
//! guard, the persisted lifecycle flags, and the mapping from a classified
//! failure to "retry next tick" or "halt until an operator intervenes".
//!
//! ```text
//! Idle --tick--> Running --ok / recoverable--> Idle
//!                   |
//!                   +--fatal--> Panicked --listener sees enabled=true--> Idle
//! ```

use dashmap::DashMap;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::classifier::{ErrorClassifier, RunError};
use super::job::{JobCatalog, JobError, TaskRunner};
use super::listener::{Listener, ListenerEvent};
use super::registry::{Registry, TickFn};
use super::{parse_cron, SchedulerError};
use crate::database::TaskStore;

pub const LISTENER_SUFFIX: &str = "-LISTENER";
pub const DEFAULT_LISTENER_CRON: &str = "0 */10 * * * *";

const HALT_PERSIST_RETRIES: u32 = 2;
const HALT_RETRY_DELAY: Duration = Duration::from_millis(100);

pub fn listener_id(task_id: &str) -> String {
    format!("{}{}", task_id, LISTENER_SUFFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Running,
    Panicked,
}

/// What a single tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Dropped: a run was already in flight, the task is panicked, or unknown.
    Skipped,
    Completed(Value),
    Failed(RunError),
}

struct TaskSlot {
    runner: Arc<dyn TaskRunner>,
    running: Arc<AtomicBool>,
    panicked: Arc<AtomicBool>,
    listener: Arc<Listener>,
}

/// Holds the re-entrancy flag for the duration of one run.
struct RunGuard {
    flag: Arc<AtomicBool>,
}

impl RunGuard {
    fn acquire(flag: Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

pub struct TaskSupervisor {
    registry: Arc<Registry>,
    store: Arc<dyn TaskStore>,
    classifier: Arc<ErrorClassifier>,
    slots: DashMap<String, TaskSlot>,
    listener_cron: String,
    this: Weak<TaskSupervisor>,
}

impl TaskSupervisor {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<dyn TaskStore>,
        classifier: ErrorClassifier,
        listener_cron: &str,
    ) -> Result<Arc<Self>, SchedulerError> {
        parse_cron(listener_cron)?;
        Ok(Arc::new_cyclic(|this| Self {
            registry,
            store,
            classifier: Arc::new(classifier),
            slots: DashMap::new(),
            listener_cron: listener_cron.to_string(),
            this: this.clone(),
        }))
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    /// Registers a task clock and its listener clock (started). A new task
    /// clock starts stopped.
    ///
    /// Re-registering an id swaps the runner and both clocks but keeps the
    /// task's run guard and panicked flag, so a run already in flight still
    /// excludes new ticks, and a task clock that was running keeps running.
    /// The listener's view of the desired state is seeded from the persisted row.
    pub async fn register(&self, id: &str, cron: &str, runner: Arc<dyn TaskRunner>) -> Result<(), SchedulerError> {
        parse_cron(cron)?;
        let record = self.store.get_task(id).await?;

        let listener = Arc::new(Listener::new(
            id,
            record.enabled,
            &record.cron,
            self.this.clone(),
            self.store.clone(),
        ));
        let was_active = self.registry.is_active(id);

        self.registry.insert(id, cron, self.task_tick(id))?;
        self.registry
            .insert(&listener_id(id), &self.listener_cron, listener_tick(listener.clone()))?;

        let (running, panicked) = match self.slots.get(id) {
            Some(slot) => (slot.running.clone(), slot.panicked.clone()),
            None => (
                Arc::new(AtomicBool::new(false)),
                Arc::new(AtomicBool::new(record.panicked)),
            ),
        };
        self.slots.insert(
            id.to_string(),
            TaskSlot {
                runner,
                running,
                panicked,
                listener,
            },
        );

        self.registry.start(&listener_id(id))?;
        if was_active {
            self.registry.start(id)?;
        }
        debug!(task = id, cron, restarted = was_active, "registered");
        Ok(())
    }

    /// Starts the task clock. Recovers a panicked task.
    pub async fn start(&self, id: &str) -> Result<(), SchedulerError> {
        let panicked = self
            .slots
            .get(id)
            .map(|slot| slot.panicked.clone())
            .ok_or_else(|| SchedulerError::NotRegistered(id.to_string()))?;

        if panicked.load(Ordering::Acquire) {
            self.store.clear_panicked(id).await?;
            panicked.store(false, Ordering::Release);
            info!(task = id, "recovered from panicked state");
        }
        self.registry.start(id)
    }

    pub fn stop(&self, id: &str) -> Result<(), SchedulerError> {
        self.registry.stop(id)
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.slots.contains_key(id) && self.registry.contains(id)
    }

    /// Reschedules and restarts the task clock.
    pub fn set_cron(&self, id: &str, cron: &str) -> Result<(), SchedulerError> {
        self.registry.reschedule(id, cron, true)
    }

    /// Swaps the schedule without changing whether the clock runs.
    pub fn replace_cron(&self, id: &str, cron: &str) -> Result<(), SchedulerError> {
        self.registry.reschedule(id, cron, false)
    }

    pub fn state(&self, id: &str) -> Option<TaskState> {
        self.slots.get(id).map(|slot| {
            if slot.running.load(Ordering::Acquire) {
                TaskState::Running
            } else if slot.panicked.load(Ordering::Acquire) {
                TaskState::Panicked
            } else {
                TaskState::Idle
            }
        })
    }

    /// Task ids with a registered run function.
    pub fn task_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.slots.iter().map(|s| s.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Runs one listener reconciliation for `id` outside of its clock.
    pub async fn poll_listener(&self, id: &str) -> Option<Vec<ListenerEvent>> {
        let listener = self.slots.get(id).map(|slot| slot.listener.clone())?;
        Some(listener.reconcile().await)
    }

    /// Brings every persisted task under supervision.
    ///
    /// Clears stale `running`/`panicked` flags first (a crash mid-run leaves
    /// them set), then registers each row found in `catalog` and starts the
    /// enabled ones. Rows with no run function are disabled.
    pub async fn boot(&self, catalog: &JobCatalog) -> Result<(), SchedulerError> {
        let reset = self.store.reset_all().await?;
        debug!("reset lifecycle flags on {} task rows", reset);

        for record in self.store.list_tasks().await? {
            let Some(runner) = catalog.get(&record.id) else {
                warn!(task = %record.id, "task not implemented, disabling");
                if let Err(e) = self.store.set_enabled(&record.id, false).await {
                    error!(task = %record.id, "failed to disable unimplemented task: {}", e);
                }
                continue;
            };

            if let Err(e) = self.register(&record.id, &record.cron, runner.clone()).await {
                error!(task = %record.id, "failed to register: {}", e);
                continue;
            }
            if record.enabled {
                self.start(&record.id).await?;
                info!(task = %record.id, cron = %record.cron, "scheduled");
            } else {
                info!(task = %record.id, "registered disabled; listener only");
            }
        }
        Ok(())
    }

    /// Halts every clock. In-flight runs finish on their own.
    pub fn shutdown(&self) {
        self.registry.shutdown();
        info!("all clocks stopped");
    }

    /// One tick of the task clock.
    pub async fn tick(&self, id: &str) -> TickOutcome {
        let Some((runner, running, panicked)) = self
            .slots
            .get(id)
            .map(|slot| (slot.runner.clone(), slot.running.clone(), slot.panicked.clone()))
        else {
            warn!(task = id, "tick for unregistered task");
            return TickOutcome::Skipped;
        };

        if panicked.load(Ordering::Acquire) {
            debug!(task = id, "tick dropped: task is panicked");
            return TickOutcome::Skipped;
        }
        let Some(_guard) = RunGuard::acquire(running) else {
            debug!(task = id, "tick dropped: previous run still in flight");
            return TickOutcome::Skipped;
        };

        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let result = self.execute(id, runner.as_ref()).await;
        let elapsed = started.elapsed().as_secs_f64();

        match result {
            Ok(payload) => {
                if let Err(e) = self.store.finish_run(id, elapsed).await {
                    error!(task = id, %run_id, "failed to record run completion: {}", e);
                }
                info!(task = id, %run_id, duration = elapsed, payload = %payload, "run succeeded");
                TickOutcome::Completed(payload)
            }
            Err(err) => {
                let verdict = self.classifier.classify(&err);
                match &verdict {
                    RunError::Recoverable { code } => {
                        warn!(task = id, %run_id, code = %code, "recoverable failure, retrying next tick: {}", err);
                        if let Err(e) = self.store.release(id).await {
                            error!(task = id, %run_id, "failed to release task: {}", e);
                        }
                    }
                    RunError::Fatal { code, message } => {
                        error!(task = id, %run_id, code = %code, "fatal failure, halting task: {}", message);
                        self.halt(id, run_id, &panicked).await;
                    }
                }
                TickOutcome::Failed(verdict)
            }
        }
    }

    /// Persists the halt, then applies it: panicked flag, stopped clock, and
    /// the listener told that `enabled` is now false. When the row cannot be
    /// written the task is left scheduled, so the row and the clock agree and
    /// the next run fails (and halts) again.
    async fn halt(&self, id: &str, run_id: Uuid, panicked: &AtomicBool) {
        let mut attempt = 0;
        loop {
            match self.store.mark_panicked(id).await {
                Ok(()) => break,
                Err(e) if attempt < HALT_PERSIST_RETRIES => {
                    attempt += 1;
                    warn!(task = id, %run_id, attempt, "failed to persist panicked state, retrying: {}", e);
                    tokio::time::sleep(HALT_RETRY_DELAY * attempt).await;
                }
                Err(e) => {
                    error!(task = id, %run_id, "failed to persist panicked state, task stays scheduled: {}", e);
                    return;
                }
            }
        }

        panicked.store(true, Ordering::Release);
        if let Err(e) = self.registry.stop(id) {
            error!(task = id, "failed to stop clock: {}", e);
        }
        let listener = self.slots.get(id).map(|slot| slot.listener.clone());
        if let Some(listener) = listener {
            listener.note_halted().await;
        }
    }

    async fn execute(&self, id: &str, runner: &dyn TaskRunner) -> Result<Value, JobError> {
        self.store.mark_running(id).await?;
        let record = self.store.get_task(id).await?;
        runner.run(record).await
    }

    fn task_tick(&self, id: &str) -> TickFn {
        let this = self.this.clone();
        let id = id.to_string();
        Arc::new(move || {
            let this = this.clone();
            let id = id.clone();
            Box::pin(async move {
                if let Some(supervisor) = this.upgrade() {
                    supervisor.tick(&id).await;
                }
            })
        })
    }
}

fn listener_tick(listener: Arc<Listener>) -> TickFn {
    Arc::new(move || {
        let listener = listener.clone();
        Box::pin(async move {
            listener.reconcile().await;
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{InMemoryStorage, TaskRecord};
    use crate::scheduler::TaskFn;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn supervisor(storage: &InMemoryStorage) -> Arc<TaskSupervisor> {
        TaskSupervisor::new(
            Registry::new(),
            Arc::new(storage.clone()),
            ErrorClassifier::default(),
            DEFAULT_LISTENER_CRON,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_register_creates_both_clocks() {
        let storage = InMemoryStorage::new();
        storage.insert_task(TaskRecord::new("job", "0 * * * * *"));
        let sup = supervisor(&storage);

        sup.register("job", "0 * * * * *", TaskFn::arc(|_| async { Ok(json!({})) }))
            .await
            .unwrap();

        assert!(sup.is_registered("job"));
        assert!(!sup.registry().is_active("job"));
        assert!(sup.registry().is_active("job-LISTENER"));
        assert_eq!(sup.state("job"), Some(TaskState::Idle));
        assert_eq!(sup.state("other"), None);

        sup.start("job").await.unwrap();
        assert!(sup.registry().is_active("job"));
        sup.stop("job").unwrap();
        assert!(!sup.registry().is_active("job"));
        assert!(sup.registry().is_active("job-LISTENER"));
        sup.shutdown();
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_cron() {
        let storage = InMemoryStorage::new();
        storage.insert_task(TaskRecord::new("job", "0 * * * * *"));
        let sup = supervisor(&storage);

        let err = sup
            .register("job", "whenever", TaskFn::arc(|_| async { Ok(json!({})) }))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidCron { .. }));
        assert!(!sup.is_registered("job"));
    }

    #[tokio::test]
    async fn test_success_records_duration() {
        let storage = InMemoryStorage::new();
        storage.insert_task(TaskRecord::new("job", "0 * * * * *"));
        let sup = supervisor(&storage);
        sup.register("job", "0 * * * * *", TaskFn::arc(|_| async { Ok(json!({ "pairs": 3 })) }))
            .await
            .unwrap();

        let outcome = sup.tick("job").await;
        assert_eq!(outcome, TickOutcome::Completed(json!({ "pairs": 3 })));

        let task = storage.task("job").unwrap();
        assert!(!task.running);
        let duration = task.last_run_duration_seconds.unwrap();
        assert_eq!(duration.split('.').nth(1).map(str::len), Some(3));
        sup.shutdown();
    }

    #[tokio::test]
    async fn test_fatal_failure_halts_task() {
        let storage = InMemoryStorage::new();
        storage.insert_task(TaskRecord::new("job", "0 * * * * *"));
        let sup = supervisor(&storage);
        sup.register(
            "job",
            "0 * * * * *",
            TaskFn::arc(|_| async { Err(JobError::Validation("required oracle feed field absent".into())) }),
        )
        .await
        .unwrap();
        sup.start("job").await.unwrap();

        let outcome = sup.tick("job").await;
        assert!(matches!(outcome, TickOutcome::Failed(RunError::Fatal { .. })));
        assert_eq!(sup.state("job"), Some(TaskState::Panicked));
        assert!(!sup.registry().is_active("job"));

        let task = storage.task("job").unwrap();
        assert!(task.panicked && !task.enabled && !task.running);

        assert_eq!(sup.tick("job").await, TickOutcome::Skipped);
        sup.shutdown();
    }

    #[tokio::test]
    async fn test_reregister_during_run_keeps_single_flight() {
        let storage = InMemoryStorage::new();
        storage.insert_task(TaskRecord::new("job", "0 0 0 1 1 *"));
        let sup = supervisor(&storage);

        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let slow = |current: Arc<AtomicUsize>, peak: Arc<AtomicUsize>| {
            TaskFn::arc(move |_| {
                let current = current.clone();
                let peak = peak.clone();
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(json!({}))
                }
            })
        };

        sup.register("job", "0 0 0 1 1 *", slow(current.clone(), peak.clone()))
            .await
            .unwrap();
        sup.start("job").await.unwrap();

        let in_flight = tokio::spawn({
            let sup = sup.clone();
            async move { sup.tick("job").await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        sup.register("job", "0 0 0 1 1 *", slow(current.clone(), peak.clone()))
            .await
            .unwrap();
        assert!(sup.registry().is_active("job"));
        assert_eq!(sup.state("job"), Some(TaskState::Running));
        assert_eq!(sup.tick("job").await, TickOutcome::Skipped);

        assert!(matches!(in_flight.await.unwrap(), TickOutcome::Completed(_)));
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(matches!(sup.tick("job").await, TickOutcome::Completed(_)));
        sup.shutdown();
    }

    #[tokio::test]
    async fn test_unpersisted_halt_leaves_task_scheduled() {
        let storage = InMemoryStorage::new();
        storage.insert_task(TaskRecord::new("job", "0 0 0 1 1 *"));
        let sup = supervisor(&storage);

        let calls = Arc::new(AtomicUsize::new(0));
        let runner = {
            let storage = storage.clone();
            let calls = calls.clone();
            TaskFn::arc(move |_| {
                // The first run's halt cannot be written at all; the second
                // one succeeds after a single retry
                match calls.fetch_add(1, Ordering::SeqCst) {
                    0 => storage.fail_next_writes(HALT_PERSIST_RETRIES as usize + 1),
                    _ => storage.fail_next_writes(1),
                }
                async { Err(JobError::Validation("required oracle feed field absent".into())) }
            })
        };
        sup.register("job", "0 0 0 1 1 *", runner).await.unwrap();
        sup.start("job").await.unwrap();

        assert!(matches!(sup.tick("job").await, TickOutcome::Failed(RunError::Fatal { .. })));
        assert_eq!(sup.state("job"), Some(TaskState::Idle));
        assert!(sup.registry().is_active("job"));
        let task = storage.task("job").unwrap();
        assert!(task.enabled && !task.panicked);

        assert!(matches!(sup.tick("job").await, TickOutcome::Failed(RunError::Fatal { .. })));
        assert_eq!(sup.state("job"), Some(TaskState::Panicked));
        assert!(!sup.registry().is_active("job"));
        let task = storage.task("job").unwrap();
        assert!(task.panicked && !task.enabled);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        sup.shutdown();
    }

    #[tokio::test]
    async fn test_recoverable_failure_releases_task() {
        let storage = InMemoryStorage::new();
        storage.insert_task(TaskRecord::new("job", "0 * * * * *"));
        let sup = supervisor(&storage);
        sup.register(
            "job",
            "0 * * * * *",
            TaskFn::arc(|_| async {
                Err(JobError::Chain(crate::chain::ChainError::Transport(
                    "request timeout after 30s".into(),
                )))
            }),
        )
        .await
        .unwrap();
        sup.start("job").await.unwrap();

        let outcome = sup.tick("job").await;
        assert_eq!(
            outcome,
            TickOutcome::Failed(RunError::Recoverable { code: "timeout".into() })
        );
        assert_eq!(sup.state("job"), Some(TaskState::Idle));
        assert!(sup.registry().is_active("job"));

        let task = storage.task("job").unwrap();
        assert!(task.enabled && !task.panicked && !task.running);
        sup.shutdown();
    }

    #[tokio::test]
    async fn test_store_failure_during_tick_is_classified() {
        let storage = InMemoryStorage::new();
        storage.insert_task(TaskRecord::new("job", "0 * * * * *"));
        let sup = supervisor(&storage);
        sup.register("job", "0 * * * * *", TaskFn::arc(|_| async { Ok(json!({})) }))
            .await
            .unwrap();

        storage.fail_next_reads(1);
        let outcome = sup.tick("job").await;
        assert_eq!(
            outcome,
            TickOutcome::Failed(RunError::Recoverable { code: "transport".into() })
        );
        assert!(matches!(sup.tick("job").await, TickOutcome::Completed(_)));
        sup.shutdown();
    }
}
