//! OIDC Gateway
//!
//! Relying-party HTTP service:
//! 1. Loads client settings and secrets
//! 2. Sends browsers to the identity provider on `/login`
//! 3. Verifies the provider's response on `/callback` and keeps the tokens
//!    server-side, keyed by a session cookie
//! 4. Serves `/userinfo`, `/health` and `/metrics`

mod config;
mod error;
mod metrics;
mod routes;
mod sessions;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use token_storage::StorageDriver;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use oidc_client::{HttpClient, JwtProcessor, ProviderConfig};

use crate::config::Config;
use crate::routes::{AppState, Stats, build_router};
use crate::sessions::SessionStore;

/// How long in-flight requests get to finish after a shutdown signal
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between sweeps of idle sessions and expired cache entries
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    // JSON output, filter from LOG_LEVEL then RUST_LOG
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting oidc-gateway");

    let prometheus_handle = metrics::install_recorder();

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    let client_secret = config
        .provider
        .client_secret
        .clone()
        .context("client secret not resolved")?;
    let secure_cookies = config.provider.settings.redirect_url.starts_with("https://");

    let provider = ProviderConfig::new(config.provider.settings.clone(), client_secret)
        .context("invalid provider settings")?;
    let jwt = JwtProcessor::for_provider(&provider, Vec::new());
    let http = HttpClient::new(&config.http.options()).context("failed to build HTTP client")?;

    info!(
        listen_addr = %config.server.listen_addr,
        public_url = config.server.public_url.as_deref().unwrap_or(""),
        provider_url = provider.provider_url(),
        client_id = provider.client_id(),
        scopes = ?provider.scopes(),
        pkce = jwt.code_challenge_method().unwrap_or("none"),
        storage = ?config.storage.driver,
        state_binding = config.storage.state_signing_key.is_some(),
        max_sessions = config.storage.max_sessions,
        "configuration loaded"
    );
    if config.storage.state_signing_key.is_none() {
        warn!("OIDC_STATE_SIGNING_KEY not set, state bundles are not bound to sessions");
    }

    let sessions = SessionStore::new(&config.storage);
    let sweeper = sessions.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PURGE_INTERVAL);
        loop {
            interval.tick().await;
            let idle = sweeper.purge_idle().await;
            if idle > 0 {
                info!(purged = idle, "dropped idle sessions");
            }
            if sweeper.driver() == StorageDriver::Cache {
                let expired = sweeper.cache().purge_expired().await;
                if expired > 0 {
                    info!(purged = expired, "purged expired cache entries");
                }
            }
        }
    });

    let app_state = AppState {
        provider: Arc::new(provider),
        jwt: Arc::new(jwt),
        http: Arc::new(http),
        sessions,
        stats: Arc::new(Stats::new()),
        prometheus: prometheus_handle,
        secure_cookies,
    };

    let app = build_router(app_state, config.server.max_connections);

    let listen_addr = config.server.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "accepting requests");

    // The drain timer starts at signal receipt, not at server start
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => info!("all in-flight requests drained"),
        Ok(Ok(Err(e))) => error!(error = %e, "server error during shutdown"),
        Ok(Err(e)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
