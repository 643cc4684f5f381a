//! Wallet Relayer - shared-signer transaction execution for the SMS/chat wallet
//!
//! Initializes the signer pool for the active network and serves the execution
//! API the command router calls into.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use wallet_relayer::api::{self, AppState};
use wallet_relayer::chain::{HttpRpcClient, RpcClient, SignerPool};
use wallet_relayer::config::Settings;
use wallet_relayer::metrics::MetricsServer;
use wallet_relayer::tx::{EthersSubmitter, Executor, GasEstimator, PendingNonceTable};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    init_logging();

    info!("Starting Wallet Relayer v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let settings = Settings::load()?;
    let network = settings.active_network()?;
    info!("Loaded configuration for network {}", settings.active_network);

    // Initialize signer pool
    let pending = Arc::new(PendingNonceTable::new());
    let pool = Arc::new(SignerPool::new(pending.clone()));
    pool.init(network)
        .await
        .context("Failed to initialize signer pool")?;

    let rpc = HttpRpcClient::new(network.url.clone())?;
    for address in pool.addresses()? {
        match rpc.transaction_count(address).await {
            Ok(nonce) => info!("Signer {:?} on-chain nonce {}", address, nonce),
            Err(e) => warn!("Could not fetch nonce for signer {:?}: {}", address, e),
        }
    }

    let contract = pool.contract(&settings.executor.contract)?.clone();
    match wallet_relayer::chain::rpc::is_contract(&rpc, contract.address).await {
        Ok(true) => info!("Contract {} found at {:?}", contract.name, contract.address),
        Ok(false) => warn!("No code at {:?} for contract {}", contract.address, contract.name),
        Err(e) => warn!("Could not check code for contract {}: {}", contract.name, e),
    }

    // Initialize executor
    let submitter = EthersSubmitter::new(
        contract.clone(),
        GasEstimator::new(network.gas_limit),
        settings.executor.confirmations,
    );
    let executor = Arc::new(Executor::new(
        pool.clone(),
        pending,
        rpc,
        submitter,
        settings.executor.retry.clone(),
    ));
    info!("Executor initialized for contract {}", contract.name);

    // Start API server
    let api_handle = tokio::spawn({
        let state = AppState {
            executor: executor.clone(),
            contract,
            abort_unless_unconfirmed_rpc_error: settings.executor.abort_unless_unconfirmed_rpc_error,
        };
        let config = settings.api.clone();
        async move {
            if let Err(e) = api::run_server(config, state).await {
                error!("API server error: {}", e);
            }
        }
    });

    // Start metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    info!("Wallet Relayer is running");
    info!("API server: http://{}:{}", settings.api.host, settings.api.port);
    if settings.metrics.enabled {
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
    }

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutdown signal received, stopping...");

    api_handle.abort();
    if let Some(h) = metrics_handle {
        h.abort();
    }

    match executor.pending_by_signer() {
        Ok(signers) => {
            for (address, count) in signers.into_iter().filter(|(_, c)| *c > 0) {
                warn!("Stopping with {} in-flight reservations for {:?}", count, address);
            }
        }
        Err(e) => warn!("Could not read pending reservations: {}", e),
    }

    info!("Wallet Relayer stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,wallet_relayer=debug,hyper=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
