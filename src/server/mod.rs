//! HTTP front end: the probe endpoint, the exporter's own metrics and a
//! landing page, served over HTTP/1.1 with one task per connection.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::metrics::ExporterMetrics;
use crate::ws_probe::prelude::Prober;

pub mod handler;

use handler::Body;

/// Shared application state.
pub struct AppState {
    pub config: AppConfig,
    pub prober: Prober,
    pub metrics: ExporterMetrics,
}

impl AppState {
    pub fn new(config: AppConfig, prober: Prober) -> prometheus::Result<Self> {
        Ok(Self {
            config,
            prober,
            metrics: ExporterMetrics::new()?,
        })
    }
}

/// Dispatches a request by path.
pub async fn route<B>(state: Arc<AppState>, req: Request<B>) -> Response<Body> {
    let (parts, _) = req.into_parts();
    let path = parts.uri.path();

    let known = path == state.config.probe_path || path == state.config.metrics_path || path == "/";
    if !known {
        return handler::not_found();
    }
    if parts.method != Method::GET && parts.method != Method::HEAD {
        return handler::method_not_allowed();
    }

    if path == state.config.probe_path {
        handler::probe(&state, &parts).await
    } else if path == state.config.metrics_path {
        handler::exporter_metrics(&state)
    } else {
        handler::landing_page(&state)
    }
}

/// Accepts connections until `shutdown` is cancelled.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => {
                info!("shutting down");
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(connection) => connection,
                Err(err) => {
                    warn!(error = %err, "failed to accept connection");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            },
        };

        let state = state.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(route(state, req).await) }
            });

            if let Err(err) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                debug!(%peer, error = %err, "connection closed with error");
            }
        });
    }
}
