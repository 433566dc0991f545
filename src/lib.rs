//! wsbox probes WebSocket endpoints on behalf of Prometheus, in the spirit of
//! the blackbox exporter: a scrape of `/probe?target=wss://...` attempts one
//! handshake and answers with gauges describing how it went.

pub mod config;
pub mod logging;
pub mod metrics;
pub mod server;
pub mod ws_probe;
