use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use wsbox::config::{load_config, setup_resolver, setup_tls_connector};
use wsbox::logging::init_logging;
use wsbox::server::{AppState, serve};
use wsbox::ws_probe::prelude::Prober;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    let config = load_config()?;
    init_logging(config.debug);
    tracing::debug!("Debug logging enabled");

    let resolver = setup_resolver(&config.dns_hosts);
    let connector = setup_tls_connector(config.tls_insecure_skip_verify)?;
    if config.tls_insecure_skip_verify {
        tracing::warn!("TLS certificate verification is disabled for wss targets");
    }

    let listener = TcpListener::bind(config.listen_address).await?;
    tracing::info!(
        address = %listener.local_addr()?,
        timeout = ?config.timeout,
        "Starting WebSocket Connection Exporter"
    );
    tracing::info!(
        "Probe endpoint: {}?target=wss://example.com/path/token",
        config.probe_path
    );

    let state = Arc::new(AppState::new(config, Prober::new(resolver, connector))?);

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    serve(listener, state, shutdown).await?;
    Ok(())
}

/// Cancels `shutdown` on Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    shutdown.cancel();
}
