use std::fmt;
use std::net::IpAddr;

use url::{Host, ParseError, Url};

use super::error::ProbeError;

/// Scheme assumed when a target is given without one, e.g. `example.com/ws`.
pub const DEFAULT_SCHEME: &str = "ws";

/// Parses a raw target, prefixing [`DEFAULT_SCHEME`] when no scheme is present.
///
/// A target starting with `:` (such as `://host`) has a broken scheme rather
/// than a missing one and is rejected instead of defaulted.
pub fn normalize_scheme(raw: &str) -> Result<Url, ProbeError> {
    let raw = raw.trim();
    let parsed = match Url::parse(raw) {
        Err(ParseError::RelativeUrlWithoutBase) if !raw.starts_with(':') => {
            Url::parse(&format!("{DEFAULT_SCHEME}://{raw}"))
        }
        other => other,
    };

    parsed.map_err(|source| ProbeError::MalformedTarget {
        target: raw.to_string(),
        source,
    })
}

/// Only `ws` and `wss` can be probed.
pub fn validate_scheme(url: &Url) -> bool {
    matches!(url.scheme(), "ws" | "wss")
}

/// A validated WebSocket endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    url: Url,
    host: String,
    port: u16,
}

impl ProbeTarget {
    pub fn parse(raw: &str) -> Result<Self, ProbeError> {
        let url = normalize_scheme(raw)?;
        if !validate_scheme(&url) {
            return Err(ProbeError::DisallowedScheme {
                scheme: url.scheme().to_string(),
            });
        }

        // Bracket-free so it works for both SNI and socket addresses.
        let host = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            _ => {
                return Err(ProbeError::MissingHost {
                    target: raw.trim().to_string(),
                });
            }
        };
        let port = url
            .port_or_known_default()
            .unwrap_or(if url.scheme() == "wss" { 443 } else { 80 });

        Ok(Self { url, host, port })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The host as an address when it is an IP literal, skipping DNS.
    pub fn ip(&self) -> Option<IpAddr> {
        match self.url.host()? {
            Host::Ipv4(ip) => Some(IpAddr::V4(ip)),
            Host::Ipv6(ip) => Some(IpAddr::V6(ip)),
            Host::Domain(_) => None,
        }
    }

    pub fn is_secure(&self) -> bool {
        self.url.scheme() == "wss"
    }
}

impl fmt::Display for ProbeTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}
