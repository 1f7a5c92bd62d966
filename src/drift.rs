//! The six independent drift check families.
//!
//! Each check compares an observed, locally-inspectable fact against a
//! signed baseline loaded once at start. A check that cannot run at all
//! (missing tool, permission denied) reports `drifted=false` with an
//! `error` in `pre_state` rather than propagating — the supervisor turns
//! that into an `alert` bundle and retries next cycle, never per-retry.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::command::CommandRunner;
use crate::error::DriftError;
use crate::signer::sha256_file;
use crate::types::{CheckKind, DriftResult, Scalar, ScalarMap, Severity};

const CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// The declarative expected-state document each check compares against.
/// Loaded once at start from `baseline_path`; never hot-reloaded.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Baseline {
    pub target_generation: String,
    pub monitored_services: Vec<MonitoredService>,
    pub backup_max_age_hours: i64,
    pub backup_timestamp_file: PathBuf,
    pub backup_checksum_file: PathBuf,
    pub logging_services: Vec<String>,
    pub logging_canary_path: PathBuf,
    pub firewall_ruleset_hash: String,
    pub encrypted_volumes: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MonitoredService {
    pub name: String,
    pub binary_path: PathBuf,
    pub approved_digests: Vec<String>,
}

impl Baseline {
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

pub struct DriftDetector {
    baseline: Baseline,
    runner: CommandRunner,
}

fn unavailable(check: CheckKind, reason: impl Into<String>) -> DriftResult {
    let mut pre_state = ScalarMap::new();
    pre_state.insert("error".to_string(), Scalar::Str(reason.into()));
    DriftResult {
        check,
        drifted: false,
        severity: Severity::Medium,
        pre_state,
        recommended_runbook_id: None,
        hipaa_controls: vec![],
    }
}

impl DriftDetector {
    #[must_use]
    pub fn new(baseline: Baseline) -> Self {
        Self {
            baseline,
            runner: CommandRunner::new(),
        }
    }

    /// Run all six checks. Each is independent and safe to run
    /// concurrently; the supervisor may call this from a dedicated drift
    /// thread while other roles proceed.
    #[must_use]
    pub fn detect_all(&self) -> Vec<DriftResult> {
        vec![
            self.check_patching(),
            self.check_endpoint_protection(),
            self.check_backup(),
            self.check_logging(),
            self.check_firewall(),
            self.check_encryption(),
        ]
    }

    fn check_patching(&self) -> DriftResult {
        let result = self
            .runner
            .run(
                &["readlink".to_string(), "-f".to_string(), "/run/current-system".to_string()],
                CHECK_TIMEOUT,
                None,
            );
        let current_generation = match result {
            Ok(r) if r.succeeded() => r.stdout.trim().to_string(),
            Ok(_) | Err(_) => return unavailable(CheckKind::Patching, "readlink /run/current-system failed"),
        };

        let drifted = current_generation != self.baseline.target_generation;
        let mut pre_state = ScalarMap::new();
        pre_state.insert(
            "current_generation".to_string(),
            Scalar::Str(current_generation),
        );
        pre_state.insert(
            "target_generation".to_string(),
            Scalar::Str(self.baseline.target_generation.clone()),
        );

        DriftResult {
            check: CheckKind::Patching,
            drifted,
            severity: if drifted { Severity::High } else { Severity::Low },
            pre_state,
            recommended_runbook_id: drifted.then(|| "RB-PATCH-001".to_string()),
            hipaa_controls: vec!["164.308(a)(5)(ii)(B)".to_string()],
        }
    }

    fn check_endpoint_protection(&self) -> DriftResult {
        let mut pre_state = ScalarMap::new();
        let mut drifted = false;

        for svc in &self.baseline.monitored_services {
            let active = self
                .runner
                .run(
                    &["systemctl".to_string(), "is-active".to_string(), svc.name.clone()],
                    CHECK_TIMEOUT,
                    None,
                )
                .map(|r| r.succeeded())
                .unwrap_or(false);

            let digest = sha256_file(&svc.binary_path).ok();
            let digest_ok = digest
                .as_ref()
                .is_some_and(|d| svc.approved_digests.contains(d));

            if !active || !digest_ok {
                drifted = true;
            }
            pre_state.insert(format!("{}_active", svc.name), Scalar::Bool(active));
            pre_state.insert(
                format!("{}_digest_approved", svc.name),
                Scalar::Bool(digest_ok),
            );
        }

        DriftResult {
            check: CheckKind::EndpointProtection,
            drifted,
            severity: if drifted { Severity::Critical } else { Severity::Low },
            pre_state,
            recommended_runbook_id: drifted.then(|| "RB-ENDPOINT-RESTORE".to_string()),
            hipaa_controls: vec!["164.308(a)(5)(ii)(B)".to_string()],
        }
    }

    fn check_backup(&self) -> DriftResult {
        let ts_raw = match std::fs::read_to_string(&self.baseline.backup_timestamp_file) {
            Ok(s) => s,
            Err(e) => return unavailable(CheckKind::Backup, format!("backup timestamp unreadable: {e}")),
        };
        let last_backup: chrono::DateTime<chrono::Utc> = match ts_raw.trim().parse() {
            Ok(t) => t,
            Err(_) => return unavailable(CheckKind::Backup, "backup timestamp malformed"),
        };
        let checksum_present = self.baseline.backup_checksum_file.exists();

        let age_hours = (chrono::Utc::now() - last_backup).num_hours();
        let drifted = age_hours > self.baseline.backup_max_age_hours || !checksum_present;

        let mut pre_state = ScalarMap::new();
        pre_state.insert("age_hours".to_string(), Scalar::Int(age_hours));
        pre_state.insert("checksum_present".to_string(), Scalar::Bool(checksum_present));

        DriftResult {
            check: CheckKind::Backup,
            drifted,
            severity: if drifted { Severity::High } else { Severity::Low },
            pre_state,
            recommended_runbook_id: drifted.then(|| "RB-BACKUP-RUN-NOW".to_string()),
            hipaa_controls: vec!["164.308(a)(7)(ii)(A)".to_string()],
        }
    }

    fn check_logging(&self) -> DriftResult {
        let mut pre_state = ScalarMap::new();
        let mut drifted = false;

        for svc in &self.baseline.logging_services {
            let active = self
                .runner
                .run(
                    &["systemctl".to_string(), "is-active".to_string(), svc.clone()],
                    CHECK_TIMEOUT,
                    None,
                )
                .map(|r| r.succeeded())
                .unwrap_or(false);
            if !active {
                drifted = true;
            }
            pre_state.insert(format!("{svc}_active"), Scalar::Bool(active));
        }

        let canary = format!("drift-canary-{}", chrono::Utc::now().timestamp());
        let canary_reached = std::fs::write(&self.baseline.logging_canary_path, &canary).is_ok()
            && std::fs::read_to_string(&self.baseline.logging_canary_path)
                .map(|s| s.trim() == canary)
                .unwrap_or(false);
        if !canary_reached {
            drifted = true;
        }
        pre_state.insert("canary_reached".to_string(), Scalar::Bool(canary_reached));

        DriftResult {
            check: CheckKind::Logging,
            drifted,
            severity: if drifted { Severity::High } else { Severity::Low },
            pre_state,
            recommended_runbook_id: drifted.then(|| "RB-LOGGING-RESTART".to_string()),
            hipaa_controls: vec!["164.312(b)".to_string()],
        }
    }

    fn check_firewall(&self) -> DriftResult {
        let result = self.runner.run(
            &["iptables-save".to_string()],
            CHECK_TIMEOUT,
            None,
        );
        let ruleset = match result {
            Ok(r) if r.succeeded() => r.stdout,
            Ok(_) | Err(_) => return unavailable(CheckKind::Firewall, "iptables-save failed"),
        };
        let hash = crate::signer::sha256_hex(ruleset.as_bytes());
        let drifted = hash != self.baseline.firewall_ruleset_hash;

        let mut pre_state = ScalarMap::new();
        pre_state.insert("ruleset_hash".to_string(), Scalar::Str(hash));
        pre_state.insert(
            "baseline_hash".to_string(),
            Scalar::Str(self.baseline.firewall_ruleset_hash.clone()),
        );

        DriftResult {
            check: CheckKind::Firewall,
            drifted,
            severity: if drifted { Severity::High } else { Severity::Low },
            pre_state,
            recommended_runbook_id: drifted.then(|| "RB-FIREWALL-BASELINE-RESTORE".to_string()),
            hipaa_controls: vec!["164.312(e)(1)".to_string()],
        }
    }

    /// Encryption drift is alert-only: `recommended_runbook_id` is always
    /// `None` regardless of drift.
    fn check_encryption(&self) -> DriftResult {
        let mut pre_state = ScalarMap::new();
        let mut drifted = false;

        for volume in &self.baseline.encrypted_volumes {
            let status = self.runner.run(
                &["cryptsetup".to_string(), "status".to_string(), volume.clone()],
                CHECK_TIMEOUT,
                None,
            );
            let encrypted = status.map(|r| r.succeeded()).unwrap_or(false);
            if !encrypted {
                drifted = true;
            }
            pre_state.insert(format!("{volume}_encrypted"), Scalar::Bool(encrypted));
        }

        DriftResult {
            check: CheckKind::Encryption,
            drifted,
            severity: if drifted { Severity::Critical } else { Severity::Low },
            pre_state,
            recommended_runbook_id: None,
            hipaa_controls: vec!["164.312(a)(2)(iv)".to_string()],
        }
    }
}

/// Map a `DriftError` into the standard alert `DriftResult` shape, for
/// callers that run checks through a fallible wrapper (tests, `doctor`).
#[must_use]
pub fn drift_result_for_error(check: CheckKind, err: &DriftError) -> DriftResult {
    match err {
        DriftError::ToolUnavailable { reason, .. } => unavailable(check, reason.clone()),
    }
}
