//! SCP payee gateway HTTP server.
//!
//! # Usage
//!
//! ```bash
//! PAYEE_PRIVATE_KEY=0x... cargo run -p scp-payee --release
//!
//! # Persist the replay cache across restarts
//! REPLAY_STORE_PATH=./data/replay.json cargo run -p scp-payee
//!
//! # Configure logging level
//! RUST_LOG=debug cargo run -p scp-payee
//! ```
//!
//! See [`scp_payee::config`] for every variable.

use std::net::SocketAddr;
use std::sync::Arc;

use alloy_signer_local::PrivateKeySigner;
use axum::http::Method;
use scp::hub_client::HubClient;
use scp::timestamp::{Clock, SystemClock};
use scp_evm::ChannelDomain;
use scp_payee::config::PayeeConfig;
use scp_payee::registration::register_with_hubs;
use scp_payee::replay::{FileReplayStore, MemoryReplayStore, ReplayStore};
use scp_payee::{Gateway, PaymentVerifier, payee_router};
use tower_http::cors;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        tracing::error!("Payee failed: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = PayeeConfig::load()?;
    let signer: PrivateKeySigner = config
        .private_key()?
        .parse()
        .map_err(|e| format!("Invalid PAYEE_PRIVATE_KEY: {e}"))?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let replay: Arc<dyn ReplayStore> = match &config.replay_store_path {
        Some(path) => Arc::new(
            FileReplayStore::open(
                path,
                config.replay_ttl_sec,
                config.replay_max_entries,
                Arc::clone(&clock),
            )
            .await?,
        ),
        None => {
            tracing::warn!("REPLAY_STORE_PATH not set; replay protection resets on restart");
            Arc::new(MemoryReplayStore::new(
                config.replay_ttl_sec,
                config.replay_max_entries,
                Arc::clone(&clock),
            ))
        }
    };

    let mut hubs = Vec::new();
    for url in config.hub_urls() {
        let mut client = HubClient::new(&url).map_err(|e| format!("Invalid hub URL {url}: {e}"))?;
        if let Some(token) = &config.admin_token {
            client = client.with_admin_token(token);
        }
        hubs.push(client);
    }
    let default_hub = hubs.first().cloned();
    let webhook_hubs = hubs.clone();

    let verifier = PaymentVerifier::new(
        signer.address(),
        ChannelDomain::new(config.chain_id(), config.contract()),
        hubs,
        Arc::clone(&clock),
    )
    .with_hub_confirmation(!config.perf_mode);
    let trusted = verifier.resolve_hubs().await;
    if trusted == 0 {
        tracing::warn!("No hub reachable yet; hub tickets are refused until one resolves");
    }
    if config.perf_mode {
        tracing::warn!("PERF_MODE on; hub payments are not confirmed with the hub");
    }

    let fee_model = match &default_hub {
        Some(hub) => match hub.info().await {
            Ok(info) => Some(info.fee_policy),
            Err(e) => {
                tracing::debug!(error = %e, "Using the default fee model");
                None
            }
        },
        None => None,
    };

    let addr = SocketAddr::new(config.host, config.port);
    let public_url = config
        .public_url
        .clone()
        .unwrap_or_else(|| format!("http://{addr}"));
    let mut gateway = Gateway::new(verifier, replay)
        .with_routes(config.routes())
        .with_resource_base(&public_url)
        .with_payment_mode(config.payment_mode, config.pay_once_ttl_sec)
        .with_clock(clock);
    if let Some(fee_model) = fee_model {
        gateway = gateway.with_fee_model(fee_model);
    }
    let gateway = Arc::new(gateway);
    tracing::info!(
        payee = %gateway.payee(),
        chain_id = config.chain_id(),
        routes = ?gateway.route_paths().collect::<Vec<_>>(),
        mode = ?gateway.payment_mode(),
        "Loaded configuration"
    );

    if !webhook_hubs.is_empty() {
        let gateway = Arc::clone(&gateway);
        let callback = public_url.clone();
        tokio::spawn(async move {
            let registered = register_with_hubs(&webhook_hubs, &callback, gateway.inbox()).await;
            tracing::info!(registered, hubs = webhook_hubs.len(), "Webhook registration finished");
        });
    }

    let app = payee_router(Arc::clone(&gateway))
        .layer(TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any)
                .expose_headers(cors::Any),
        );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Payee listening on http://{addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    gateway.close().await;
    tracing::info!("Payee shut down gracefully");
    Ok(())
}

/// Resolves on SIGTERM or Ctrl+C.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT, shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}
