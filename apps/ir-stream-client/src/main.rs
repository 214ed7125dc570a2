//! IR Stream Client Binary
//!
//! Runs the streaming client with its HTTP query surface.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin ir-stream-client
//! ```
//!
//! # Environment Variables
//!
//! - `IR_API_KEY` / `IR_API_SECRET`: API credentials for balance channels (optional)
//! - `IR_WS_URL`: WebSocket endpoint (default: wss://ws.independentreserve.com/v2)
//! - `IR_HTTP_PORT`: HTTP port for health, metrics and queries (default: 8083, 0 disables)
//! - `IR_CACHE_TIMEOUT_SECS`: Idle eviction timeout (default: 300)
//! - `IR_PINNED_CHANNELS`: Comma-separated channels kept subscribed (default: none)
//! - `OTEL_ENABLED`: Export spans over OTLP (default: false)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use ir_stream_client::infrastructure::telemetry;
use ir_stream_client::{ClientConfig, HttpServer, StreamClient, WebSocketConnector, init_metrics};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("failed to install rustls crypto provider");
    }

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting IR stream client");

    let _metrics_handle = init_metrics().context("failed to install metrics recorder")?;

    let config = ClientConfig::from_env().context("invalid configuration")?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let client = StreamClient::start(&config, Arc::new(WebSocketConnector))
        .context("failed to start stream client")?;

    let http = if config.server.http_port == 0 {
        tracing::info!("HTTP server disabled");
        None
    } else {
        let state = Arc::new(client.http_state(env!("CARGO_PKG_VERSION")));
        let server = HttpServer::new(config.server.http_port, state, shutdown_token.clone());
        Some(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                tracing::error!(error = %e, "HTTP server error");
            }
        }))
    };

    tracing::info!("Stream client ready");

    await_shutdown(shutdown_token).await;

    let stopped = async {
        client.shutdown().await;
        if let Some(http) = http {
            let _ = http.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, stopped).await.is_err() {
        tracing::warn!(
            timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
            "shutdown timed out"
        );
    }

    tracing::info!("Stream client stopped");
    Ok(())
}

/// Log the parsed configuration.
fn log_config(config: &ClientConfig) {
    tracing::info!(
        url = %config.websocket.url,
        authenticated = config.credentials.is_some(),
        http_port = config.server.http_port,
        idle_timeout_secs = config.cache.idle_timeout.as_secs(),
        sweep_interval_secs = config.cache.sweep_interval.as_secs(),
        pinned = config.cache.pinned_channels.len(),
        "Configuration loaded"
    );
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        for dir in cwd.ancestors().skip(1) {
            let env_path = dir.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn await_shutdown(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl+C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown_token.cancel();
}
