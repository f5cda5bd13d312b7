use alloy::primitives::Address;
use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use super::models::{NewToken, TaskRecord, Token};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("transaction already finished")]
    TransactionFinished,
}

/// Lifecycle persistence for task rows.
///
/// Every method is a single autocommitted statement; none of them participate
/// in a job's batch transaction.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn list_tasks(&self) -> Result<Vec<TaskRecord>, StoreError>;
    async fn get_task(&self, id: &str) -> Result<TaskRecord, StoreError>;

    /// Inserts the row unless one with the same id exists. Returns true when inserted.
    async fn ensure_task(&self, record: &TaskRecord) -> Result<bool, StoreError>;

    /// Boot-time reset: `running=false, panicked=false` on every row.
    async fn reset_all(&self) -> Result<u64, StoreError>;

    async fn mark_running(&self, id: &str) -> Result<(), StoreError>;
    /// Successful run: `running=false` plus the run duration.
    async fn finish_run(&self, id: &str, duration_seconds: f64) -> Result<(), StoreError>;
    /// Recoverable failure: `running=false` only.
    async fn release(&self, id: &str) -> Result<(), StoreError>;
    /// Fatal failure: `running=false, panicked=true, enabled=false`.
    async fn mark_panicked(&self, id: &str) -> Result<(), StoreError>;
    async fn clear_panicked(&self, id: &str) -> Result<(), StoreError>;

    // Operator-facing desired state
    async fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), StoreError>;
    async fn set_cron(&self, id: &str, cron: &str) -> Result<(), StoreError>;
}

/// Storage that can open batch transactions.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn StorageTx>, StoreError>;

    /// Committed tokens only, read outside any transaction.
    async fn find_tokens(&self, network_id: i64, addresses: &[Address]) -> Result<Vec<Token>, StoreError>;
}

/// One open storage transaction.
///
/// Dropping an unfinished transaction rolls it back.
#[async_trait]
pub trait StorageTx: Send {
    async fn find_tokens(&mut self, network_id: i64, addresses: &[Address]) -> Result<Vec<Token>, StoreError>;

    /// Create-if-not-exists keyed on `(network_id, address)`. Returns the number
    /// of rows actually inserted.
    async fn insert_tokens(&mut self, tokens: &[NewToken]) -> Result<u64, StoreError>;

    async fn save_cursor(&mut self, task_id: &str, cursor: i64) -> Result<(), StoreError>;
    async fn save_auxiliary_data(&mut self, task_id: &str, data: Value) -> Result<(), StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;
    async fn rollback(&mut self) -> Result<(), StoreError>;
}

/// Formats a run duration the way the `last_run_duration_seconds` column stores it.
pub fn format_duration(seconds: f64) -> String {
    format!("{:.3}", seconds)
}
