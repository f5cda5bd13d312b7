use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use chainsync_backend::chain::RpcChainClient;
use chainsync_backend::config::{AppConfig, NetworkConfig};
use chainsync_backend::database::{MigrationRunner, PgStorage, TaskRecord, TaskStore};
use chainsync_backend::scheduler::{
    CursorJobRunner, ErrorClassifier, JobCatalog, JobContext, Registry, TaskRunner, TaskSupervisor,
};
use chainsync_backend::token_registry::{PairDiscoveryJob, ProbeFailurePolicy};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = AppConfig::load().context("loading configuration")?;
    info!("Starting chainsync with {} networks", config.networks.len());

    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
        .connect(&config.database.url)
        .await
        .context("connecting to database")?;

    MigrationRunner::new(pool.clone()).run_migrations().await?;

    let storage = Arc::new(PgStorage::new(pool));
    let classifier = Arc::new(ErrorClassifier::default());

    let mut catalog = JobCatalog::new();
    for network in &config.networks {
        match discovery_runner(network, &storage, &classifier).await {
            Ok((task_id, runner)) => {
                catalog.insert(task_id, runner);
            }
            Err(e) => error!("Network {} not scheduled: {:#}", network.name, e),
        }
    }

    let supervisor = TaskSupervisor::new(
        Registry::new(),
        storage.clone(),
        classifier.as_ref().clone(),
        &config.listener_cron,
    )?;
    supervisor.boot(&catalog).await?;
    info!("Supervising {} tasks", supervisor.task_ids().len());

    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received");
    supervisor.shutdown();

    Ok(())
}

/// Seeds the network's rows and builds its pair discovery runner.
async fn discovery_runner(
    network: &NetworkConfig,
    storage: &Arc<PgStorage>,
    classifier: &Arc<ErrorClassifier>,
) -> anyhow::Result<(String, Arc<dyn TaskRunner>)> {
    let factory = network.factory()?;
    let task_id = network.discovery_task_id();

    storage.ensure_network(network.id, &network.name, network.chain_id).await?;
    storage
        .ensure_task(&TaskRecord::new(task_id.clone(), network.discovery_cron.clone()))
        .await?;

    let client = Arc::new(RpcChainClient::connect(&network.rpc_url, &network.factory_address)?);
    let ctx = JobContext {
        network_id: network.id,
        network_name: network.name.clone(),
        contract_address: factory,
        storage: storage.clone(),
        pairs: client.clone(),
        probe: client,
    };

    let job = PairDiscoveryJob::new(ctx, classifier.clone(), ProbeFailurePolicy::default());
    Ok((task_id, CursorJobRunner::arc(job, storage.clone())))
}
