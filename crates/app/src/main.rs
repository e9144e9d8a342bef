mod dispatch;
mod problem;
mod queue;
mod reconcile;
mod router;
mod signature;
mod sync;
mod telemetry;
mod webhook;

#[cfg(test)]
mod test_support;

use std::{net::SocketAddr, sync::Arc};

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use url::Url;

use invoice_sync_chain::JsonRpcClient;
use invoice_sync_core::Normalizer;
use invoice_sync_storage::Database;
use invoice_sync_util::{load_env_file, AppConfig};

use crate::dispatch::EventRouter;
use crate::reconcile::ReconcileService;
use crate::signature::SignatureVerifier;
use crate::sync::Synchronizer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    load_env_file();
    let config = AppConfig::from_env()?;

    telemetry::init_tracing(&config)?;
    let metrics = telemetry::init_metrics()?;

    let database = Database::connect(&config.database_url).await?;
    database.run_migrations().await?;
    info!(stage = "storage", url = %config.database_url, "database ready");

    let contracts = &config.chain.contract_addresses;
    if contracts.is_empty() {
        warn!(
            stage = "normalizer",
            "INVOICE_CONTRACT_ADDRESSES is empty; every delivered log will be dropped"
        );
    }
    let normalizer = Arc::new(Normalizer::new(
        config.chain.amount_decimals,
        config.chain.network.clone(),
        contracts,
    ));
    let router = Arc::new(EventRouter::new(Synchronizer::new(
        database.clone(),
        Arc::new(Utc::now),
    )));

    let shutdown = CancellationToken::new();
    let (queue, workers) = queue::partitioned(router.clone(), &config.sync);
    let mut tasks = workers.spawn(shutdown.clone());
    info!(stage = "queue", partitions = config.sync.partitions, "partition consumers started");

    let reconcile = match config.chain.rpc_url.as_deref() {
        Some(_) if contracts.is_empty() => {
            warn!(
                stage = "reconcile",
                "INVOICE_CONTRACT_ADDRESSES is empty; reconciliation disabled"
            );
            None
        }
        Some(raw) => {
            let chain = JsonRpcClient::new(Url::parse(raw)?, config.chain.rpc_timeout)?;
            let (service, worker) = ReconcileService::new(
                database.clone(),
                chain,
                router,
                normalizer.clone(),
                contracts.clone(),
                config.reconcile.clone(),
                Arc::new(Utc::now),
                shutdown.clone(),
            );
            tasks.push(worker.spawn());
            Some(service)
        }
        None => {
            warn!(stage = "reconcile", "CHAIN_RPC_URL not set; reconciliation disabled");
            None
        }
    };

    let state = router::AppState::new(
        metrics,
        database,
        normalizer,
        SignatureVerifier::new(config.webhook_secrets.clone()),
        queue,
        reconcile,
        config.admin_token.clone(),
    );

    let addr: SocketAddr = config.bind_addr;
    info!(stage = "app", %addr, env = %config.environment.as_str(), "starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let served = axum::serve(listener, router::app_router(state))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(stage = "app", error = %err, "failed to listen for shutdown signal");
            }
            info!(stage = "app", "shutdown requested");
        })
        .await;

    // In-flight requests have finished enqueuing; consumers now drain what
    // is buffered and stop.
    shutdown.cancel();
    for task in tasks {
        if let Err(err) = task.await {
            error!(stage = "app", error = %err, "background task failed");
        }
    }

    served.map_err(|err| err.into())
}
