use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;
use trust_dns_resolver::error::ResolveError;

/// Everything that can end a probe early.
///
/// None of these escape the probe engine; they are logged and collapsed into
/// a failed `ProbeResult`. [`ProbeError::reason`] keeps the coarse class
/// around for the exporter's own counters.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("invalid target URL {target:?}")]
    MalformedTarget {
        target: String,
        #[source]
        source: url::ParseError,
    },

    #[error("target URL {target:?} has no host")]
    MissingHost { target: String },

    #[error("invalid URL scheme {scheme:?}, must be ws or wss")]
    DisallowedScheme { scheme: String },

    #[error("failed to resolve {host}")]
    Resolve {
        host: String,
        #[source]
        source: ResolveError,
    },

    #[error("no addresses found for {host}")]
    NoAddress { host: String },

    #[error("failed to connect to {addr}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("TLS handshake with {host} failed")]
    Tls {
        host: String,
        #[source]
        source: native_tls::Error,
    },

    #[error("WebSocket handshake failed")]
    Handshake(#[source] Box<tungstenite::Error>),

    #[error("server rejected the upgrade (HTTP status: {status})")]
    Rejected { status: u16 },

    #[error("handshake did not complete within {0:?}")]
    Timeout(Duration),

    #[error("probe was cancelled")]
    Cancelled,
}

impl ProbeError {
    pub fn reason(&self) -> FailureReason {
        match self {
            ProbeError::MalformedTarget { .. } | ProbeError::MissingHost { .. } => {
                FailureReason::MalformedTarget
            }
            ProbeError::DisallowedScheme { .. } => FailureReason::DisallowedScheme,
            ProbeError::Resolve { .. }
            | ProbeError::NoAddress { .. }
            | ProbeError::Connect { .. }
            | ProbeError::Tls { .. }
            | ProbeError::Handshake(_)
            | ProbeError::Rejected { .. } => FailureReason::Connection,
            ProbeError::Timeout(_) => FailureReason::Timeout,
            ProbeError::Cancelled => FailureReason::Cancelled,
        }
    }

    /// Bad input, as opposed to a target that could not be reached.
    pub fn is_invalid_target(&self) -> bool {
        matches!(
            self.reason(),
            FailureReason::MalformedTarget | FailureReason::DisallowedScheme
        )
    }
}

/// Coarse failure class, used as a label value on the exporter metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    MalformedTarget,
    DisallowedScheme,
    Connection,
    Timeout,
    Cancelled,
}

impl FailureReason {
    pub const ALL: [FailureReason; 5] = [
        FailureReason::MalformedTarget,
        FailureReason::DisallowedScheme,
        FailureReason::Connection,
        FailureReason::Timeout,
        FailureReason::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::MalformedTarget => "malformed_target",
            FailureReason::DisallowedScheme => "disallowed_scheme",
            FailureReason::Connection => "connection",
            FailureReason::Timeout => "timeout",
            FailureReason::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
