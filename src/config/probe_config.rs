use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use super::error::ConfigError;

/// Settings read from the optional YAML config file.
/// Every field is optional; anything left out falls back to the flag,
/// environment variable or built-in default.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    /// Address the HTTP server binds to, e.g. `:9095` or `127.0.0.1:9095`.
    pub listen_address: Option<String>,

    /// Path serving the exporter's own metrics.
    pub metrics_path: Option<String>,

    /// Path serving probe requests.
    pub probe_path: Option<String>,

    /// Upper bound for a single probe, in humantime notation (`10s`, `500ms`).
    #[serde(with = "humantime_serde")]
    pub timeout: Option<Duration>,

    pub debug: Option<bool>,

    /// Name servers queried over TCP. Unset means the system configuration.
    pub dns_hosts: Option<Vec<String>>,

    pub tls_insecure_skip_verify: Option<bool>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;
        Self::from_yaml(&raw).map_err(|source| ConfigError::Parse {
            path: display,
            source,
        })
    }

    pub fn from_yaml(raw: &str) -> Result<Self, serde_yaml::Error> {
        // An empty document is a valid, empty config.
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw)
    }
}
