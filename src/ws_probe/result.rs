use super::error::FailureReason;

/// Outcome of a single probe.
///
/// A fresh value is built for every probe request and rendered straight from
/// there, so concurrent probes never observe each other's values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeResult {
    pub connection_established: bool,
    /// Dial start to handshake completion; `0` unless established.
    pub connection_duration_seconds: f64,
    pub probe_success: bool,
    pub probe_duration_seconds: f64,
    pub dns_lookup_seconds: Option<f64>,
    /// Status line of the upgrade response, if the server answered at all.
    pub status_code: Option<u16>,
    pub tls: bool,
    /// `notAfter` of the peer certificate as a unix timestamp.
    pub cert_expiry_seconds: Option<f64>,
    pub failure: Option<FailureReason>,
}

impl ProbeResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every field back to the failed baseline.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
