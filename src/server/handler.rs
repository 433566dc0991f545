use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{CONTENT_TYPE, HeaderMap, HeaderValue};
use hyper::http::request::Parts;
use hyper::{Response, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::metrics::{self, render_probe_result};
use crate::ws_probe::prelude::*;

use super::AppState;

/// Header Prometheus sends with the scrape timeout it will enforce.
pub const SCRAPE_TIMEOUT_HEADER: &str = "x-prometheus-scrape-timeout-seconds";

/// Head start given to the collector so the response still arrives before it
/// gives up on the scrape.
const SCRAPE_TIMEOUT_OFFSET: f64 = 0.5;

pub type Body = Full<Bytes>;

pub(crate) fn text_response(
    status: StatusCode,
    content_type: &'static str,
    body: impl Into<Bytes>,
) -> Response<Body> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn plain(status: StatusCode, body: &'static str) -> Response<Body> {
    text_response(status, "text/plain; charset=utf-8", body)
}

/// Value of the first `target` query parameter, or `None` when that value is
/// empty. Later `target` parameters are ignored.
pub fn target_param(query: Option<&str>) -> Option<String> {
    url::form_urlencoded::parse(query?.as_bytes())
        .find(|(key, _)| key == "target")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

/// The configured timeout, narrowed to what the collector is willing to wait.
pub fn probe_deadline(timeout: Duration, headers: &HeaderMap) -> Duration {
    let scrape_timeout = headers
        .get(SCRAPE_TIMEOUT_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<f64>().ok())
        .filter(|seconds| seconds.is_finite() && *seconds > 0.0);

    match scrape_timeout {
        Some(seconds) if seconds - SCRAPE_TIMEOUT_OFFSET < timeout.as_secs_f64() => {
            Duration::from_secs_f64((seconds - SCRAPE_TIMEOUT_OFFSET).max(0.0))
        }
        _ => timeout,
    }
}

/// Runs one probe against the `target` query parameter and renders its result.
///
/// A failed probe is still a `200`; only a missing target is a client error.
pub async fn probe(state: &AppState, parts: &Parts) -> Response<Body> {
    let Some(target) = target_param(parts.uri.query()) else {
        state.metrics.invalid_request();
        debug!("probe request without target");
        return plain(StatusCode::BAD_REQUEST, "Target parameter is missing\n");
    };

    let deadline = probe_deadline(state.config.timeout, &parts.headers);
    debug!(target_url = %target, ?deadline, "received probe request");

    // Cancelled when this handler is dropped, e.g. because the client hung up.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let mut result = ProbeResult::new();
    let start = Instant::now();
    let success = state
        .prober
        .probe(&target, deadline, &cancel, &mut result)
        .await;
    debug!(
        target_url = %target,
        success,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "probe completed"
    );

    state.metrics.observe(&result);

    match render_probe_result(&result) {
        Ok(body) => text_response(StatusCode::OK, metrics::CONTENT_TYPE, body),
        Err(err) => {
            error!(error = %err, "failed to render probe metrics");
            plain(StatusCode::INTERNAL_SERVER_ERROR, "Failed to render metrics\n")
        }
    }
}

/// The exporter's own metrics.
pub fn exporter_metrics(state: &AppState) -> Response<Body> {
    match state.metrics.render() {
        Ok(body) => text_response(StatusCode::OK, metrics::CONTENT_TYPE, body),
        Err(err) => {
            error!(error = %err, "failed to render exporter metrics");
            plain(StatusCode::INTERNAL_SERVER_ERROR, "Failed to render metrics\n")
        }
    }
}

pub fn landing_page(state: &AppState) -> Response<Body> {
    let page = format!(
        r#"<html>
<head><title>WebSocket Connection Exporter</title></head>
<body>
<h1>WebSocket Connection Exporter</h1>
<p>Visit <a href="{metrics}">Metrics</a> to see metrics.</p>
<p>Visit <a href="{probe}?target={example}">Probe</a> to probe a WebSocket endpoint.</p>
<p>This exporter tests WebSocket connection establishment and measures connection latency.</p>
</body>
</html>
"#,
        metrics = state.config.metrics_path,
        probe = state.config.probe_path,
        example = "wss://example.com/path/token",
    );
    text_response(StatusCode::OK, "text/html; charset=utf-8", page)
}

pub fn not_found() -> Response<Body> {
    plain(StatusCode::NOT_FOUND, "Not Found\n")
}

pub fn method_not_allowed() -> Response<Body> {
    plain(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed\n")
}
