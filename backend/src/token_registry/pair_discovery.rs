use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use super::discovery_engine::{PreparedBatch, TokenDiscoveryPipeline};
use super::validation_service::{ProbeFailurePolicy, TokenValidationService};
use crate::chain::PairInfo;
use crate::database::{StorageTx, TaskConfig};
use crate::scheduler::{CursorJob, ErrorClassifier, JobContext, JobError, JobKind};

/// Walks a factory's pair list and feeds each batch through the discovery
/// pipeline.
pub struct PairDiscoveryJob {
    ctx: JobContext,
    pipeline: TokenDiscoveryPipeline,
}

impl PairDiscoveryJob {
    pub fn new(ctx: JobContext, classifier: Arc<ErrorClassifier>, policy: ProbeFailurePolicy) -> Self {
        let validation = TokenValidationService::new(ctx.probe.clone(), classifier, policy);
        let pipeline = TokenDiscoveryPipeline::new(ctx.network_id, validation);
        Self { ctx, pipeline }
    }

    pub fn context(&self) -> &JobContext {
        &self.ctx
    }
}

#[async_trait]
impl CursorJob for PairDiscoveryJob {
    type Item = PairInfo;
    type Prepared = PreparedBatch;

    fn kind(&self) -> JobKind {
        JobKind::PairDiscovery
    }

    async fn total_count(&self) -> Result<u64, JobError> {
        Ok(self.ctx.pairs.total_count().await?)
    }

    async fn fetch_batch(&self, indices: &[u64]) -> Result<Vec<Option<PairInfo>>, JobError> {
        Ok(self.ctx.pairs.fetch_batch(indices).await?)
    }

    async fn prepare(&self, config: &TaskConfig, batch: Vec<PairInfo>) -> Result<PreparedBatch, JobError> {
        self.pipeline
            .prepare(self.ctx.storage.as_ref(), &batch, config.max_retry)
            .await
    }

    async fn reconcile(
        &self,
        tx: &mut dyn StorageTx,
        _config: &TaskConfig,
        prepared: PreparedBatch,
    ) -> Result<Value, JobError> {
        let report = self.pipeline.persist(tx, prepared).await?;
        Ok(json!({
            "network": self.ctx.network_name,
            "factory": self.ctx.contract_address,
            "report": report,
        }))
    }
}
