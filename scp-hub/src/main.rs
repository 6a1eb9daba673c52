//! SCP hub HTTP server.
//!
//! # Usage
//!
//! ```bash
//! HUB_PRIVATE_KEY=0x... cargo run -p scp-hub --release
//!
//! # Verify first payments on-chain
//! RPC_URL=https://... CONTRACT_ADDRESS=0x... cargo run -p scp-hub
//!
//! # Configure logging level
//! RUST_LOG=debug cargo run -p scp-hub
//! ```
//!
//! See [`scp_hub::config`] for every variable.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use alloy_signer_local::PrivateKeySigner;
use axum::http::Method;
use scp::networks::settlement_contract;
use scp_evm::ledger::EvmLedger;
use scp_evm::provider::RpcSelector;
use scp_hub::config::HubConfig;
use scp_hub::store::HubStore;
use scp_hub::util::SigDown;
use scp_hub::{HubService, hub_router};
use tokio_util::sync::CancellationToken;
use tower_http::cors;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;
use url::Url;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        tracing::error!("Hub failed: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = HubConfig::load()?;
    let chain_id = config.chain_id();
    let signer: PrivateKeySigner = config
        .private_key()?
        .parse()
        .map_err(|e| format!("Invalid HUB_PRIVATE_KEY: {e}"))?;
    let contract = settlement_contract(chain_id, config.contract_address);

    let store = match &config.store_path {
        Some(path) => HubStore::open(path).await?,
        None => {
            tracing::warn!("STORE_PATH not set; hub state is kept in memory only");
            HubStore::memory()
        }
    };

    let mut hub = HubService::new(signer.clone(), chain_id, contract)
        .with_name(config.hub_name.clone())
        .with_default_asset(config.default_asset())
        .with_fee(config.fee)
        .with_store(Arc::new(store))
        .with_sweep_interval(config.quote_sweep_interval_sec);

    match (&config.rpc_url, config.contract_address) {
        (Some(rpc_url), Some(contract_address)) => {
            let _: Url = rpc_url
                .parse()
                .map_err(|e| format!("Invalid RPC_URL: {e}"))?;
            let selector = Arc::new(RpcSelector::new(chain_id, Some(rpc_url.clone())));
            if let Err(e) = selector.url().await {
                tracing::warn!(error = %e, "No responsive RPC yet; retried on first channel check");
            }
            hub = hub.with_ledger(Arc::new(EvmLedger::with_selector(
                selector,
                signer,
                chain_id,
                contract_address,
            )));
            tracing::info!(contract = %contract_address, "On-chain channel verification enabled");
        }
        _ => tracing::warn!(
            "RPC_URL or CONTRACT_ADDRESS unset; first payments on new channels will be refused"
        ),
    }
    if let Some(token) = &config.admin_token {
        hub = hub.with_admin_token(token.clone());
    } else {
        tracing::info!("HUB_ADMIN_TOKEN unset; webhook and event endpoints disabled");
    }

    let hub = Arc::new(hub);
    tracing::info!(
        hub = %hub.address(),
        name = %config.hub_name,
        chain_id,
        asset = %config.default_asset(),
        "Loaded configuration"
    );

    let sig_down = SigDown::try_new()?;
    let shutdown = sig_down.cancellation_token();
    let sweeper = tokio::spawn(sweep_quotes(
        Arc::clone(&hub),
        Duration::from_secs(config.quote_sweep_interval_sec.max(1)),
        shutdown.clone(),
    ));

    let app = hub_router(Arc::clone(&hub))
        .layer(TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST, Method::PATCH, Method::DELETE])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(config.host, config.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Hub listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    sig_down.recv().await;
    sweeper.await?;
    hub.webhooks().shutdown().await;
    tracing::info!("Hub shut down gracefully");
    Ok(())
}

/// Sweeps expired quotes even when no quote requests arrive.
async fn sweep_quotes(hub: Arc<HubService>, every: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = hub.sweep_expired_quotes().await {
                    tracing::warn!(error = %e, "Quote sweep failed");
                }
            }
        }
    }
}
