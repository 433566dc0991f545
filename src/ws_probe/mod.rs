pub mod error;
pub mod probe;
pub mod result;
pub mod target;

pub mod prelude {
    pub use super::error::{FailureReason, ProbeError};
    pub use super::probe::Prober;
    pub use super::result::ProbeResult;
    pub use super::target::{ProbeTarget, normalize_scheme, validate_scheme};
}

use std::fmt::Write;

/// Flattens an error and its `source()` chain into a single log-friendly line.
pub fn report(mut err: &(dyn std::error::Error + 'static)) -> String {
    let mut s = format!("{}", err);
    while let Some(src) = err.source() {
        let _ = write!(s, ": {}", src);
        err = src;
    }
    s
}

#[cfg(test)]
mod tests {
    use super::error::ProbeError;
    use super::*;

    #[test]
    fn test_report_walks_source_chain() {
        let err = ProbeError::MalformedTarget {
            target: "://bad".to_string(),
            source: url::ParseError::EmptyHost,
        };
        let line = report(&err);
        assert!(line.starts_with("invalid target URL \"://bad\""));
        assert!(line.ends_with(": empty host"));
    }

    #[test]
    fn test_report_without_source() {
        assert_eq!(report(&ProbeError::Cancelled), "probe was cancelled");
    }
}
