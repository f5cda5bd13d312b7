use alloy::primitives::Address;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::models::{NewToken, TaskRecord, Token};
use super::store::{format_duration, Storage, StorageTx, StoreError, TaskStore};

#[derive(Default)]
struct MemoryState {
    tasks: BTreeMap<String, TaskRecord>,
    tokens: Vec<Token>,
    failing_reads: usize,
    failing_writes: usize,
}

impl MemoryState {
    fn task_mut(&mut self, id: &str) -> Result<&mut TaskRecord, StoreError> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::TaskNotFound(id.to_string()))
    }

    fn has_token(&self, network_id: i64, address: Address) -> bool {
        self.tokens
            .iter()
            .any(|t| t.network_id == network_id && t.address == address)
    }
}

/// In-process storage with the same create-if-not-exists and transaction
/// semantics as [`PgStorage`](super::repository::PgStorage).
///
/// Writes made inside a transaction are staged and only become visible to
/// other readers on commit.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    state: Arc<Mutex<MemoryState>>,
    next_token_id: Arc<AtomicI64>,
    open_transactions: Arc<AtomicUsize>,
    transactions_begun: Arc<AtomicUsize>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a test panicked mid-write; the map itself is intact.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_task(&self, record: TaskRecord) {
        self.lock().tasks.insert(record.id.clone(), record);
    }

    pub fn task(&self, id: &str) -> Option<TaskRecord> {
        self.lock().tasks.get(id).cloned()
    }

    /// Committed tokens, in insertion order.
    pub fn tokens(&self) -> Vec<Token> {
        self.lock().tokens.clone()
    }

    pub fn token(&self, network_id: i64, address: Address) -> Option<Token> {
        self.lock()
            .tokens
            .iter()
            .find(|t| t.network_id == network_id && t.address == address)
            .cloned()
    }

    /// Seeds an already-known token outside of any transaction.
    pub fn insert_token(&self, token: NewToken) -> Token {
        let id = self.next_token_id.fetch_add(1, Ordering::SeqCst) + 1;
        let token = token.into_token(id);
        self.lock().tokens.push(token.clone());
        token
    }

    /// Makes the next `count` task reads fail as if the database were unreachable.
    pub fn fail_next_reads(&self, count: usize) {
        self.lock().failing_reads = count;
    }

    /// Makes the next `count` task row updates fail the same way.
    pub fn fail_next_writes(&self, count: usize) {
        self.lock().failing_writes = count;
    }

    pub fn open_transactions(&self) -> usize {
        self.open_transactions.load(Ordering::SeqCst)
    }

    pub fn transactions_begun(&self) -> usize {
        self.transactions_begun.load(Ordering::SeqCst)
    }

    fn check_read(&self) -> Result<(), StoreError> {
        let mut state = self.lock();
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(StoreError::Unavailable("connection reset by peer".to_string()));
        }
        Ok(())
    }

    fn update<F>(&self, id: &str, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut TaskRecord),
    {
        let mut state = self.lock();
        if state.failing_writes > 0 {
            state.failing_writes -= 1;
            return Err(StoreError::Unavailable("connection reset by peer".to_string()));
        }
        f(state.task_mut(id)?);
        Ok(())
    }
}

#[async_trait]
impl TaskStore for InMemoryStorage {
    async fn list_tasks(&self) -> Result<Vec<TaskRecord>, StoreError> {
        self.check_read()?;
        Ok(self.lock().tasks.values().cloned().collect())
    }

    async fn get_task(&self, id: &str) -> Result<TaskRecord, StoreError> {
        self.check_read()?;
        self.task(id).ok_or_else(|| StoreError::TaskNotFound(id.to_string()))
    }

    async fn ensure_task(&self, record: &TaskRecord) -> Result<bool, StoreError> {
        let mut state = self.lock();
        if state.tasks.contains_key(&record.id) {
            return Ok(false);
        }
        state.tasks.insert(record.id.clone(), record.clone());
        Ok(true)
    }

    async fn reset_all(&self) -> Result<u64, StoreError> {
        let mut state = self.lock();
        for task in state.tasks.values_mut() {
            task.running = false;
            task.panicked = false;
        }
        Ok(state.tasks.len() as u64)
    }

    async fn mark_running(&self, id: &str) -> Result<(), StoreError> {
        self.update(id, |t| t.running = true)
    }

    async fn finish_run(&self, id: &str, duration_seconds: f64) -> Result<(), StoreError> {
        self.update(id, |t| {
            t.running = false;
            t.last_run_duration_seconds = Some(format_duration(duration_seconds));
        })
    }

    async fn release(&self, id: &str) -> Result<(), StoreError> {
        self.update(id, |t| t.running = false)
    }

    async fn mark_panicked(&self, id: &str) -> Result<(), StoreError> {
        self.update(id, |t| {
            t.running = false;
            t.panicked = true;
            t.enabled = false;
        })
    }

    async fn clear_panicked(&self, id: &str) -> Result<(), StoreError> {
        self.update(id, |t| t.panicked = false)
    }

    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), StoreError> {
        self.update(id, |t| t.enabled = enabled)
    }

    async fn set_cron(&self, id: &str, cron: &str) -> Result<(), StoreError> {
        self.update(id, |t| t.cron = cron.to_string())
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn begin(&self) -> Result<Box<dyn StorageTx>, StoreError> {
        self.open_transactions.fetch_add(1, Ordering::SeqCst);
        self.transactions_begun.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(InMemoryTx {
            storage: self.clone(),
            staged_tokens: Vec::new(),
            cursor_writes: Vec::new(),
            aux_writes: Vec::new(),
            finished: false,
        }))
    }

    async fn find_tokens(&self, network_id: i64, addresses: &[Address]) -> Result<Vec<Token>, StoreError> {
        Ok(self
            .lock()
            .tokens
            .iter()
            .filter(|t| t.network_id == network_id && addresses.contains(&t.address))
            .cloned()
            .collect())
    }
}

struct InMemoryTx {
    storage: InMemoryStorage,
    staged_tokens: Vec<Token>,
    cursor_writes: Vec<(String, i64)>,
    aux_writes: Vec<(String, Value)>,
    finished: bool,
}

impl InMemoryTx {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.finished {
            return Err(StoreError::TransactionFinished);
        }
        Ok(())
    }

    fn close(&mut self) {
        if !self.finished {
            self.finished = true;
            self.storage.open_transactions.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl StorageTx for InMemoryTx {
    async fn find_tokens(&mut self, network_id: i64, addresses: &[Address]) -> Result<Vec<Token>, StoreError> {
        self.ensure_open()?;
        let state = self.storage.lock();
        Ok(state
            .tokens
            .iter()
            .chain(self.staged_tokens.iter())
            .filter(|t| t.network_id == network_id && addresses.contains(&t.address))
            .cloned()
            .collect())
    }

    async fn insert_tokens(&mut self, tokens: &[NewToken]) -> Result<u64, StoreError> {
        self.ensure_open()?;
        let mut inserted = 0;
        for token in tokens {
            let exists = self.storage.lock().has_token(token.network_id, token.address)
                || self
                    .staged_tokens
                    .iter()
                    .any(|t| t.network_id == token.network_id && t.address == token.address);
            if exists {
                continue;
            }
            let id = self.storage.next_token_id.fetch_add(1, Ordering::SeqCst) + 1;
            self.staged_tokens.push(token.clone().into_token(id));
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn save_cursor(&mut self, task_id: &str, cursor: i64) -> Result<(), StoreError> {
        self.ensure_open()?;
        if !self.storage.lock().tasks.contains_key(task_id) {
            return Err(StoreError::TaskNotFound(task_id.to_string()));
        }
        self.cursor_writes.push((task_id.to_string(), cursor));
        Ok(())
    }

    async fn save_auxiliary_data(&mut self, task_id: &str, data: Value) -> Result<(), StoreError> {
        self.ensure_open()?;
        if !self.storage.lock().tasks.contains_key(task_id) {
            return Err(StoreError::TaskNotFound(task_id.to_string()));
        }
        self.aux_writes.push((task_id.to_string(), data));
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        {
            let mut state = self.storage.lock();
            for token in self.staged_tokens.drain(..) {
                // Another transaction may have committed the same address meanwhile
                if !state.has_token(token.network_id, token.address) {
                    state.tokens.push(token);
                }
            }
            for (id, cursor) in self.cursor_writes.drain(..) {
                state.task_mut(&id)?.cursor = Some(cursor);
            }
            for (id, data) in self.aux_writes.drain(..) {
                state.task_mut(&id)?.auxiliary_data = Some(data);
            }
        }
        self.close();
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.staged_tokens.clear();
        self.cursor_writes.clear();
        self.aux_writes.clear();
        self.close();
        Ok(())
    }
}

impl Drop for InMemoryTx {
    fn drop(&mut self) {
        self.close();
    }
}
