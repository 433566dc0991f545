use prometheus::{IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry};

use crate::ws_probe::error::FailureReason;
use crate::ws_probe::result::ProbeResult;

use super::encode;

const PROBES_METRIC: &str = "wsbox_probes_total";
const PROBE_FAILURES_METRIC: &str = "wsbox_probe_failures_total";
const INVALID_REQUESTS_METRIC: &str = "wsbox_invalid_probe_requests_total";
const BUILD_INFO_METRIC: &str = "wsbox_build_info";

const RESULT_LABEL: &str = "result";
const REASON_LABEL: &str = "reason";
const VERSION_LABEL: &str = "version";

/// Aggregate counters about the exporter itself, shared by all requests and
/// served on the metrics path. Probe gauges never live here.
#[derive(Clone)]
pub struct ExporterMetrics {
    registry: Registry,
    probes: IntCounterVec,
    failures: IntCounterVec,
    invalid_requests: IntCounter,
}

impl ExporterMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let probes = IntCounterVec::new(
            Opts::new(PROBES_METRIC, "Number of probes run, by result"),
            &[RESULT_LABEL],
        )?;
        let failures = IntCounterVec::new(
            Opts::new(PROBE_FAILURES_METRIC, "Number of failed probes, by reason"),
            &[REASON_LABEL],
        )?;
        let invalid_requests = IntCounter::new(
            INVALID_REQUESTS_METRIC,
            "Number of probe requests rejected for a missing target",
        )?;
        let build_info = IntGaugeVec::new(
            Opts::new(BUILD_INFO_METRIC, "Build information of the running exporter"),
            &[VERSION_LABEL],
        )?;
        build_info
            .with_label_values(&[env!("CARGO_PKG_VERSION")])
            .set(1);

        // Touch every label value so the series exist before the first probe.
        for result in ["success", "failure"] {
            probes.with_label_values(&[result]);
        }
        for reason in FailureReason::ALL {
            failures.with_label_values(&[reason.as_str()]);
        }

        registry.register(Box::new(probes.clone()))?;
        registry.register(Box::new(failures.clone()))?;
        registry.register(Box::new(invalid_requests.clone()))?;
        registry.register(Box::new(build_info))?;

        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(Self {
            registry,
            probes,
            failures,
            invalid_requests,
        })
    }

    /// Counts a finished probe.
    pub fn observe(&self, result: &ProbeResult) {
        let label = if result.probe_success { "success" } else { "failure" };
        self.probes.with_label_values(&[label]).inc();

        if let Some(reason) = result.failure {
            self.failures.with_label_values(&[reason.as_str()]).inc();
        }
    }

    pub fn invalid_request(&self) {
        self.invalid_requests.inc();
    }

    pub fn render(&self) -> prometheus::Result<String> {
        encode(&self.registry)
    }
}
