use prometheus::{Encoder, Gauge, Registry, TextEncoder};

use crate::ws_probe::result::ProbeResult;

pub mod exporter;

pub use exporter::ExporterMetrics;

/// Content type of the text exposition format.
pub const CONTENT_TYPE: &str = prometheus::TEXT_FORMAT;

const PROBE_SUCCESS_METRIC: &str = "probe_success";
const PROBE_DURATION_METRIC: &str = "probe_duration_seconds";
const PROBE_WEBSOCKET_UP_METRIC: &str = "probe_websocket_up";
const PROBE_WEBSOCKET_CONNECTION_DURATION_METRIC: &str =
    "probe_websocket_connection_duration_seconds";
const PROBE_WEBSOCKET_STATUS_METRIC: &str = "probe_websocket_status_code";
const PROBE_WEBSOCKET_SSL_METRIC: &str = "probe_websocket_ssl";
const PROBE_DNS_LOOKUP_TIME_METRIC: &str = "probe_dns_lookup_time_seconds";
const PROBE_SSL_EARLIEST_EXPIRY_METRIC: &str = "probe_ssl_earliest_cert_expiry";

fn bool_to_f64(value: bool) -> f64 {
    if value { 1.0 } else { 0.0 }
}

fn register_gauge(
    registry: &Registry,
    name: &str,
    help: &str,
    value: f64,
) -> prometheus::Result<()> {
    let gauge = Gauge::new(name, help)?;
    gauge.set(value);
    registry.register(Box::new(gauge))
}

/// Builds a throwaway registry holding the gauges of one probe.
///
/// The four core gauges are always present, even for a failed probe, so a
/// collector can tell "probed and failed" apart from "never probed":
///    - `probe_websocket_up`: 1 when the handshake completed.
///    - `probe_websocket_connection_duration_seconds`: dial start to handshake completion.
///    - `probe_success`: overall outcome.
///    - `probe_duration_seconds`: total time spent in the probe.
///
/// `probe_websocket_ssl` is always present as well. The status code, DNS
/// lookup time and certificate expiry only appear when the probe got that far.
pub fn probe_registry(result: &ProbeResult) -> prometheus::Result<Registry> {
    let registry = Registry::new();

    register_gauge(
        &registry,
        PROBE_WEBSOCKET_UP_METRIC,
        "Displays whether the WebSocket connection was successful",
        bool_to_f64(result.connection_established),
    )?;
    register_gauge(
        &registry,
        PROBE_WEBSOCKET_CONNECTION_DURATION_METRIC,
        "Duration of the WebSocket connection establishment",
        result.connection_duration_seconds,
    )?;
    register_gauge(
        &registry,
        PROBE_SUCCESS_METRIC,
        "Displays whether or not the probe was a success",
        bool_to_f64(result.probe_success),
    )?;
    register_gauge(
        &registry,
        PROBE_DURATION_METRIC,
        "Returns how long the probe took to complete in seconds",
        result.probe_duration_seconds,
    )?;
    register_gauge(
        &registry,
        PROBE_WEBSOCKET_SSL_METRIC,
        "Indicates if TLS was used for the connection",
        bool_to_f64(result.tls),
    )?;

    if let Some(status) = result.status_code {
        register_gauge(
            &registry,
            PROBE_WEBSOCKET_STATUS_METRIC,
            "HTTP status code of the WebSocket upgrade response",
            f64::from(status),
        )?;
    }
    if let Some(dns_time) = result.dns_lookup_seconds {
        register_gauge(
            &registry,
            PROBE_DNS_LOOKUP_TIME_METRIC,
            "Returns the time taken for probe dns lookup in seconds",
            dns_time,
        )?;
    }
    if let Some(expiry) = result.cert_expiry_seconds {
        register_gauge(
            &registry,
            PROBE_SSL_EARLIEST_EXPIRY_METRIC,
            "Returns last SSL chain expiry in unixtime",
            expiry,
        )?;
    }

    Ok(registry)
}

/// Renders one probe as text exposition format.
pub fn render_probe_result(result: &ProbeResult) -> prometheus::Result<String> {
    encode(&probe_registry(result)?)
}

pub fn encode(registry: &Registry) -> prometheus::Result<String> {
    let mut buf = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buf)?;
    String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
