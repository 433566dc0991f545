use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use clap::builder::BoolishValueParser;
use tokio_native_tls::TlsConnector as TokioTlsConnector;
use trust_dns_resolver::{
    TokioAsyncResolver,
    config::{NameServerConfig, NameServerConfigGroup, Protocol, ResolverConfig, ResolverOpts},
};

use super::error::ConfigError;
use super::probe_config::FileConfig;

pub const DEFAULT_LISTEN_ADDRESS: &str = ":9095";
pub const DEFAULT_METRICS_PATH: &str = "/metrics";
pub const DEFAULT_PROBE_PATH: &str = "/probe";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Command line flags. Each one can also be given through its environment
/// variable and falls back to the YAML file, then to the built-in default.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "wsbox", version, about = "WebSocket connection exporter for Prometheus")]
pub struct Cli {
    /// Path to an optional YAML configuration file
    #[arg(long = "config.file", env = "CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Address to listen on for telemetry (default :9095)
    #[arg(long = "web.listen-address", env = "LISTEN_ADDRESS")]
    pub listen_address: Option<String>,

    /// Path under which to expose metrics (default /metrics)
    #[arg(long = "web.telemetry-path", env = "METRICS_PATH")]
    pub metrics_path: Option<String>,

    /// Path under which to expose the probe endpoint (default /probe)
    #[arg(long = "web.probe-path", env = "PROBE_PATH")]
    pub probe_path: Option<String>,

    /// Timeout for a probe, e.g. 10s or 500ms (default 10s)
    #[arg(long, env = "PROBE_TIMEOUT", value_parser = parse_duration)]
    pub timeout: Option<Duration>,

    /// Enable debug logging
    #[arg(
        long,
        env = "DEBUG",
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    pub debug: Option<bool>,

    /// Comma separated name server IPs; the system resolver is used when unset
    #[arg(long = "dns.hosts", env = "DNS_HOSTS", value_delimiter = ',')]
    pub dns_hosts: Option<Vec<String>>,

    /// Accept invalid certificates and host names on wss targets
    #[arg(
        long = "tls.insecure-skip-verify",
        env = "TLS_INSECURE_SKIP_VERIFY",
        num_args = 0..=1,
        default_missing_value = "true",
        value_parser = BoolishValueParser::new()
    )]
    pub tls_insecure_skip_verify: Option<bool>,
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub listen_address: SocketAddr,
    pub metrics_path: String,
    pub probe_path: String,
    pub timeout: Duration,
    pub debug: bool,
    pub dns_hosts: Vec<IpAddr>,
    pub tls_insecure_skip_verify: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_address: SocketAddr::from(([0, 0, 0, 0], 9095)),
            metrics_path: DEFAULT_METRICS_PATH.to_string(),
            probe_path: DEFAULT_PROBE_PATH.to_string(),
            timeout: DEFAULT_TIMEOUT,
            debug: false,
            dns_hosts: Vec::new(),
            tls_insecure_skip_verify: false,
        }
    }
}

impl AppConfig {
    /// Merges flags over the file config over the defaults and validates the result.
    pub fn resolve(cli: Cli, file: FileConfig) -> Result<Self, ConfigError> {
        let listen_address = parse_listen_address(
            cli.listen_address
                .or(file.listen_address)
                .as_deref()
                .unwrap_or(DEFAULT_LISTEN_ADDRESS),
        )?;

        let metrics_path = validate_path(
            "metrics_path",
            cli.metrics_path
                .or(file.metrics_path)
                .unwrap_or_else(|| DEFAULT_METRICS_PATH.to_string()),
        )?;
        let probe_path = validate_path(
            "probe_path",
            cli.probe_path
                .or(file.probe_path)
                .unwrap_or_else(|| DEFAULT_PROBE_PATH.to_string()),
        )?;
        if metrics_path == probe_path {
            return Err(ConfigError::invalid(
                "probe_path",
                format!("{probe_path} is already used as the metrics path"),
            ));
        }

        let timeout = cli.timeout.or(file.timeout).unwrap_or(DEFAULT_TIMEOUT);
        if timeout.is_zero() {
            return Err(ConfigError::invalid("timeout", "must be greater than zero"));
        }

        let dns_hosts = cli
            .dns_hosts
            .or(file.dns_hosts)
            .unwrap_or_default()
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|host| {
                host.parse::<IpAddr>().map_err(|e| {
                    ConfigError::invalid("dns_hosts", format!("{host:?} is not an IP address: {e}"))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            listen_address,
            metrics_path,
            probe_path,
            timeout,
            debug: cli.debug.or(file.debug).unwrap_or(false),
            dns_hosts,
            tls_insecure_skip_verify: cli
                .tls_insecure_skip_verify
                .or(file.tls_insecure_skip_verify)
                .unwrap_or(false),
        })
    }
}

/// Load the application configuration from flags, environment variables and
/// the YAML file named by `--config.file` / `CONFIG_FILE`, if any.
pub fn load_config() -> Result<AppConfig, ConfigError> {
    let cli = Cli::parse();
    let file = match &cli.config_file {
        Some(path) => FileConfig::load(path)?,
        None => FileConfig::default(),
    };
    AppConfig::resolve(cli, file)
}

/// Parse a duration using humantime notation (`10s`, `1m30s`, `250ms`).
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("duration string is empty".to_string());
    }
    humantime::parse_duration(s).map_err(|e| e.to_string())
}

/// Accepts `host:port` socket addresses and the `:port` shorthand for all
/// interfaces.
pub fn parse_listen_address(s: &str) -> Result<SocketAddr, ConfigError> {
    let s = s.trim();
    let candidate = match s.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => s.to_string(),
    };
    candidate
        .parse()
        .map_err(|e| ConfigError::invalid("listen_address", format!("{s:?}: {e}")))
}

fn validate_path(field: &'static str, path: String) -> Result<String, ConfigError> {
    if !path.starts_with('/') {
        return Err(ConfigError::invalid(field, format!("{path:?} must start with '/'")));
    }
    if path.chars().any(|c| c.is_whitespace() || c == '?' || c == '#') {
        return Err(ConfigError::invalid(field, format!("{path:?} is not a plain path")));
    }
    Ok(path)
}

/// Setup a TLS connector for `wss` targets.
/// Certificate and host name checks are only skipped when explicitly asked for.
pub fn setup_tls_connector(insecure_skip_verify: bool) -> Result<TokioTlsConnector, ConfigError> {
    let mut builder = native_tls::TlsConnector::builder();
    builder.danger_accept_invalid_certs(insecure_skip_verify);
    builder.danger_accept_invalid_hostnames(insecure_skip_verify);
    let connector = builder.build()?;
    Ok(TokioTlsConnector::from(connector))
}

/// Setup a DNS resolver.
///
/// With explicit `dns_hosts`, every host is queried over TCP on port 53.
/// Without, the system configuration is used, falling back to the resolver
/// defaults when it cannot be read. Caching is disabled so that every probe
/// performs its own lookup.
pub fn setup_resolver(dns_hosts: &[IpAddr]) -> TokioAsyncResolver {
    let mut opts = ResolverOpts::default();
    opts.attempts = 2;
    opts.timeout = Duration::from_secs(2);
    opts.cache_size = 0;

    if dns_hosts.is_empty() {
        return match trust_dns_resolver::system_conf::read_system_conf() {
            Ok((config, mut system_opts)) => {
                system_opts.cache_size = 0;
                TokioAsyncResolver::tokio(config, system_opts)
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    "could not read system DNS configuration, using defaults"
                );
                TokioAsyncResolver::tokio(ResolverConfig::default(), opts)
            }
        };
    }

    let mut name_servers = NameServerConfigGroup::new();
    for ip in dns_hosts {
        name_servers.push(NameServerConfig {
            socket_addr: (*ip, 53).into(),
            protocol: Protocol::Tcp, // TCP is more reliable than UDP for DNS queries
            tls_dns_name: None,
            trust_negative_responses: false,
            bind_addr: None,
        });
    }

    let resolver_config = ResolverConfig::from_parts(None, vec![], name_servers);
    TokioAsyncResolver::tokio(resolver_config, opts)
}
