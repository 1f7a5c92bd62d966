//! Structured logging setup, liveness file, and Prometheus-style metrics
//! export.

use std::fs;
use std::io::Write;
use std::path::Path;

use tracing_subscriber::EnvFilter;

/// Install a JSON-lines `tracing` subscriber on stdout, with `log_level`
/// as the default filter (overridable via `RUST_LOG`).
pub fn init_logging(log_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_lowercase()));

    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_current_span(false)
        .try_init();
}

/// Touch `<state_dir>/run/healthy`, updating its mtime, at the end of
/// every successful cycle.
pub fn touch_liveness_file(run_dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(run_dir)?;
    let path = run_dir.join("healthy");
    fs::write(path, chrono::Utc::now().to_rfc3339())
}

/// Snapshot of per-cycle counters written out as Prometheus text format.
#[derive(Clone, Debug, Default)]
pub struct CycleMetrics {
    pub cycle_duration_sec: f64,
    pub drift_checks_run: u64,
    pub drift_findings: u64,
    pub healer_invocations: u64,
    pub healer_successes: u64,
    pub healer_failures: u64,
    pub queue_depth: u64,
    pub evidence_bundles_total: u64,
}

impl CycleMetrics {
    fn render(&self) -> String {
        let mut out = String::new();
        let mut line = |name: &str, help: &str, value: f64| {
            out.push_str(&format!("# HELP {name} {help}\n"));
            out.push_str(&format!("# TYPE {name} gauge\n"));
            out.push_str(&format!("{name} {value}\n"));
        };
        line(
            "compliance_agent_cycle_duration_seconds",
            "Duration of the most recent supervisor cycle",
            self.cycle_duration_sec,
        );
        line(
            "compliance_agent_drift_checks_run",
            "Drift checks run in the most recent cycle",
            self.drift_checks_run as f64,
        );
        line(
            "compliance_agent_drift_findings",
            "Drift findings in the most recent cycle",
            self.drift_findings as f64,
        );
        line(
            "compliance_agent_healer_invocations_total",
            "Healer invocations in the most recent cycle",
            self.healer_invocations as f64,
        );
        line(
            "compliance_agent_healer_successes_total",
            "Healer successes in the most recent cycle",
            self.healer_successes as f64,
        );
        line(
            "compliance_agent_healer_failures_total",
            "Healer failures in the most recent cycle",
            self.healer_failures as f64,
        );
        line(
            "compliance_agent_queue_depth",
            "Offline queue depth at end of cycle",
            self.queue_depth as f64,
        );
        line(
            "compliance_agent_evidence_bundles_total",
            "Evidence bundles on disk",
            self.evidence_bundles_total as f64,
        );
        out
    }

    /// Write the Prometheus text exposition to `<state_dir>/run/metrics.prom`
    /// via write-to-tmp-then-rename, refreshed once per cycle.
    pub fn write_to(&self, run_dir: &Path) -> std::io::Result<()> {
        fs::create_dir_all(run_dir)?;
        let path = run_dir.join("metrics.prom");
        let tmp = path.with_extension("tmp");
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(self.render().as_bytes())?;
        }
        fs::rename(&tmp, &path)
    }
}
