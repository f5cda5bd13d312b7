//! Job abstractions.
//!
//! The supervisor only knows [`TaskRunner`]: something that takes the current
//! [`TaskRecord`] and either returns a JSON payload for the success log or a
//! [`JobError`] for the classifier. Cursor-driven sweeps implement
//! [`CursorJob`] instead and are wrapped in [`CursorJobRunner`], which owns the
//! range selection, the batch transaction, and the cursor advance.

use alloy::primitives::Address;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use super::cursor::next_range;
use crate::chain::{ChainError, PairSource, TokenProbe};
use crate::database::{Storage, StorageTx, StoreError, TaskConfig, TaskRecord, TxScope};

#[derive(Error, Debug)]
pub enum JobError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("missing required config: {0}")]
    MissingConfig(String),
    #[error("invalid task config: {0}")]
    InvalidConfig(#[from] serde_json::Error),
    #[error("validation failed: {0}")]
    Validation(String),
}

/// Job families; protocol variation is data, not subclassing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    PairDiscovery,
    NftDiscovery,
    FarmSweep,
    PriceSweep,
}

impl JobKind {
    pub fn default_chunk(&self) -> u64 {
        match self {
            JobKind::PairDiscovery | JobKind::NftDiscovery => 10,
            JobKind::FarmSweep => 30,
            JobKind::PriceSweep => 100,
        }
    }

    pub fn requires_metadata_path(&self) -> bool {
        matches!(self, JobKind::NftDiscovery)
    }
}

/// Read-only context handed to a job at construction.
#[derive(Clone)]
pub struct JobContext {
    pub network_id: i64,
    pub network_name: String,
    pub contract_address: Address,
    pub storage: Arc<dyn Storage>,
    pub pairs: Arc<dyn PairSource>,
    pub probe: Arc<dyn TokenProbe>,
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("network_id", &self.network_id)
            .field("network_name", &self.network_name)
            .field("contract_address", &self.contract_address)
            .finish()
    }
}

#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, record: TaskRecord) -> Result<Value, JobError>;
}

/// Run functions keyed by task id.
pub type JobCatalog = HashMap<String, Arc<dyn TaskRunner>>;

/// Closure-backed [`TaskRunner`]; produces a fresh future per run.
pub struct TaskFn<F> {
    f: F,
}

impl<F, Fut> TaskFn<F>
where
    F: Fn(TaskRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
{
    pub fn arc(f: F) -> Arc<dyn TaskRunner> {
        Arc::new(Self { f })
    }
}

#[async_trait]
impl<F, Fut> TaskRunner for TaskFn<F>
where
    F: Fn(TaskRecord) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, JobError>> + Send + 'static,
{
    async fn run(&self, record: TaskRecord) -> Result<Value, JobError> {
        let fut: BoxFuture<'static, _> = Box::pin((self.f)(record));
        fut.await
    }
}

/// A sweep over an append-only on-chain list, processed in cursor order.
///
/// Each batch goes through [`prepare`](CursorJob::prepare) with no transaction
/// open (network reads, validation) and then through
/// [`reconcile`](CursorJob::reconcile) inside the batch transaction.
#[async_trait]
pub trait CursorJob: Send + Sync + 'static {
    type Item: Send + Sync + 'static;
    type Prepared: Send + 'static;

    fn kind(&self) -> JobKind;

    async fn total_count(&self) -> Result<u64, JobError>;

    async fn fetch_batch(&self, indices: &[u64]) -> Result<Vec<Option<Self::Item>>, JobError>;

    async fn prepare(&self, config: &TaskConfig, batch: Vec<Self::Item>) -> Result<Self::Prepared, JobError>;

    /// Persists one prepared batch inside `tx`. Must be idempotent: a batch
    /// whose commit failed is fetched and reconciled again on the next run.
    async fn reconcile(
        &self,
        tx: &mut dyn StorageTx,
        config: &TaskConfig,
        prepared: Self::Prepared,
    ) -> Result<Value, JobError>;
}

pub struct CursorJobRunner<J> {
    job: J,
    storage: Arc<dyn Storage>,
}

impl<J: CursorJob> CursorJobRunner<J> {
    pub fn new(job: J, storage: Arc<dyn Storage>) -> Self {
        Self { job, storage }
    }

    pub fn arc(job: J, storage: Arc<dyn Storage>) -> Arc<dyn TaskRunner> {
        Arc::new(Self::new(job, storage))
    }

    pub fn job(&self) -> &J {
        &self.job
    }
}

#[async_trait]
impl<J: CursorJob> TaskRunner for CursorJobRunner<J> {
    async fn run(&self, record: TaskRecord) -> Result<Value, JobError> {
        let config = record.task_config()?;
        let kind = self.job.kind();
        if kind.requires_metadata_path() && config.metadata_path.is_none() {
            return Err(JobError::MissingConfig(format!("metadataPath for task {}", record.id)));
        }

        let total = self.job.total_count().await?;
        let range = next_range(total, record.cursor_position(), config.chunk_or(kind.default_chunk()));
        if !range.has_work {
            debug!(task = %record.id, "nothing new: cursor {} of {}", range.start, total);
            return Ok(json!({ "hasWork": false, "cursor": range.start, "total": total }));
        }

        let fetched = self.job.fetch_batch(&range.indices()).await?;
        let requested = fetched.len();
        let batch: Vec<J::Item> = fetched.into_iter().flatten().collect();
        let missing = requested - batch.len();

        let prepared = self.job.prepare(&config, batch).await?;

        let mut scope = TxScope::begin(self.storage.as_ref(), record.id.clone()).await?;
        let result: Result<Value, JobError> = async {
            let outcome = self.job.reconcile(scope.tx(), &config, prepared).await?;
            scope.tx().save_cursor(&record.id, range.end as i64).await?;
            Ok(outcome)
        }
        .await;
        let outcome = scope.finish(result).await?;

        info!(task = %record.id, "processed range [{}, {}) of {}", range.start, range.end, total);
        Ok(json!({
            "hasWork": true,
            "start": range.start,
            "end": range.end,
            "total": total,
            "missing": missing,
            "outcome": outcome,
        }))
    }
}
