//! Main loop: owns the scheduler and runs one cycle at a time.
//!
//! Ordering within a cycle is fixed: clock-sanity → check-in → refresh
//! Windows targets/egress → drift detection → orchestration → queue
//! drain. A global concurrency cap of one healer invocation at a time is
//! enforced simply by the supervisor being single-threaded through this
//! sequence; no separate lock is needed.

use std::collections::{BTreeMap, HashSet};
use std::io::{BufRead, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tracing::{error, info, warn};

use crate::config::AgentConfig;
use crate::control_plane::{validate_order, ControlPlaneClient};
use crate::drift::DriftDetector;
use crate::egress::{EgressRefresher, FirewallSink};
use crate::evidence::EvidenceStore;
use crate::healer::{Healer, HealerContext, StateCapture};
use crate::orchestrator::{Resolution, TieredOrchestrator};
use crate::queue::OfflineQueue;
use crate::signer::Signer;
use crate::types::{CheckKind, EvidenceBundle, Incident, Outcome, ResolutionTier, RunbookSpec, ScalarMap};
use crate::windows_exec::RemoteTransport;

/// Shared flag flipped by a signal handler; checked between cycles and at
/// well-defined suspension points within a cycle.
#[derive(Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A no-op state capture used where the caller has no richer snapshot
/// available; real deployments wire a capture that reads generation,
/// service states, and ruleset hash.
pub struct EmptyStateCapture;
impl StateCapture for EmptyStateCapture {
    fn capture(&self) -> ScalarMap {
        ScalarMap::new()
    }
}

pub struct Supervisor<'a> {
    config: AgentConfig,
    queue: OfflineQueue,
    evidence: EvidenceStore,
    signer: Option<Signer>,
    control_plane: Option<ControlPlaneClient>,
    egress: EgressRefresher,
    firewall_sink: &'a dyn FirewallSink,
    drift_detector: DriftDetector,
    orchestrator: TieredOrchestrator,
    runbook_whitelist: Vec<RunbookSpec>,
    windows_transport: Option<&'a dyn RemoteTransport>,
    orders_seen: HashSet<String>,
    last_ntp_offset_ms: i64,
}

impl<'a> Supervisor<'a> {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        config: AgentConfig,
        queue: OfflineQueue,
        evidence: EvidenceStore,
        signer: Option<Signer>,
        control_plane: Option<ControlPlaneClient>,
        egress: EgressRefresher,
        firewall_sink: &'a dyn FirewallSink,
        drift_detector: DriftDetector,
        orchestrator: TieredOrchestrator,
        runbook_whitelist: Vec<RunbookSpec>,
        windows_transport: Option<&'a dyn RemoteTransport>,
    ) -> Self {
        let orders_seen = load_orders_seen(&config.orders_seen_path());
        Self {
            config,
            queue,
            evidence,
            signer,
            control_plane,
            egress,
            firewall_sink,
            drift_detector,
            orchestrator,
            runbook_whitelist,
            windows_transport,
            orders_seen,
            last_ntp_offset_ms: 0,
        }
    }

    /// Run cycles until `shutdown` is signaled, sleeping a jittered
    /// `poll_interval` between them.
    pub fn run(&mut self, shutdown: &ShutdownFlag) {
        while !shutdown.is_set() {
            let start = std::time::Instant::now();
            if let Err(e) = self.run_cycle() {
                error!(error = %e, "cycle failed");
            }
            let elapsed = start.elapsed();
            let _ = crate::observability::touch_liveness_file(&self.config.run_dir());

            let base = self.config.poll_interval;
            let jitter_frac = rand::thread_rng().gen_range(-0.1..=0.1);
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let jittered = Duration::from_secs_f64(
                (base.as_secs_f64() * (1.0 + jitter_frac)).max(1.0),
            );
            let sleep_for = jittered.saturating_sub(elapsed);

            sleep_in_slices(sleep_for, shutdown);
        }
        info!("supervisor loop exiting on shutdown signal");
    }

    /// Run exactly one cycle; returns the terminal outcome counts.
    pub fn run_cycle(&mut self) -> Result<(), crate::error::AgentError> {
        let now = Utc::now();
        info!(timestamp = %now, "cycle start");

        // 1. Clock sanity + check-in.
        let mut orders = Vec::new();
        if let Some(client) = &self.control_plane {
            match client.check_in(&self.config.site_id, &self.config.host_id, &self.config.policy_version, now) {
                Ok(result) => {
                    self.last_ntp_offset_ms = result.offset_ms;
                    orders = result.orders;
                }
                Err(e) => {
                    warn!(error = %e, "check-in failed; continuing with cached state");
                }
            }

            // 2. Refresh Windows targets and egress.
            if let Err(e) = self.egress.refresh(self.firewall_sink) {
                warn!(error = %e, "egress refresh failed");
            }
        }

        // 3. Drift detection.
        let drift_results = self.drift_detector.detect_all();
        let mut bundles = Vec::new();

        for order in &orders {
            bundles.push(self.handle_order(order, now));
        }

        for drift in drift_results {
            if !drift.drifted {
                continue;
            }
            bundles.push(self.handle_drift_finding(drift, now));
        }

        // 4. Store, sign, and enqueue every bundle produced this cycle.
        for bundle in bundles {
            self.commit_bundle(bundle)?;
        }

        // 5. Drain offline queue.
        self.drain_queue(now);

        let stats = self.evidence.stats().unwrap_or_default();
        let metrics = crate::observability::CycleMetrics {
            cycle_duration_sec: 0.0,
            drift_checks_run: 6,
            queue_depth: self.queue.depth() as u64,
            evidence_bundles_total: stats.total as u64,
            ..Default::default()
        };
        let _ = metrics.write_to(&self.config.run_dir());

        Ok(())
    }

    fn handle_order(
        &mut self,
        order: &crate::types::Order,
        now: chrono::DateTime<Utc>,
    ) -> EvidenceBundle {
        if let Err(e) = validate_order(order, now, self.config.order_ttl_sec(), &self.orders_seen) {
            let outcome = match e {
                crate::control_plane::OrderValidationError::Expired => Outcome::Expired,
                _ => Outcome::Rejected,
            };
            return rejected_bundle(&self.config, order, outcome, e.to_string(), now);
        }

        let Ok(runbook) = crate::healer::lookup_runbook(&self.runbook_whitelist, &order.runbook_id)
        else {
            return rejected_bundle(
                &self.config,
                order,
                Outcome::Rejected,
                format!("unknown runbook {}", order.runbook_id),
                now,
            );
        };

        let window = self.config.maintenance_window;
        let ctx = HealerContext {
            site_id: &self.config.site_id,
            host_id: &self.config.host_id,
            deployment_mode: self.config.deployment_mode,
            reseller_id: self.config.reseller_id.as_deref(),
            policy_version: &self.config.policy_version,
            maintenance_window: &window,
            maintenance_window_raw: &self.config.maintenance_window_raw,
            allow_disruptive_outside_window: self.config.allow_disruptive_outside_window,
            ntp_max_skew_ms: self.config.ntp_max_skew_ms,
            rebuild_health_check_timeout: self.config.rebuild_health_check_timeout,
            runbook_step_timeout: Duration::from_secs(300),
        };
        let healer = Healer::new(ctx, self.windows_transport);
        let bundle = healer.heal(
            runbook,
            CheckKind::Order,
            &EmptyStateCapture,
            None,
            None,
            &BTreeMap::new(),
            Some(order),
            self.last_ntp_offset_ms,
            now,
        );

        if bundle.outcome.is_terminal_attempt() {
            self.orders_seen.insert(order.order_id.clone());
            if let Err(e) = append_order_seen(&self.config.orders_seen_path(), &order.order_id) {
                warn!(error = %e, order_id = %order.order_id, "failed to persist applied order id");
            }
        }
        bundle
    }

    fn handle_drift_finding(
        &mut self,
        drift: crate::types::DriftResult,
        now: chrono::DateTime<Utc>,
    ) -> EvidenceBundle {
        let Some(runbook_id) = drift.recommended_runbook_id.clone() else {
            return alert_bundle(&self.config, drift.check, drift.pre_state.clone(), now);
        };

        let incident = Incident {
            incident_id: EvidenceBundle::new_bundle_id(),
            incident_type: drift.check.to_string(),
            signature: drift.check.to_string(),
            recommended_runbook_id: Some(runbook_id.clone()),
            triggering_order: None,
            params: ScalarMap::new(),
        };

        match self.orchestrator.resolve(&incident, None) {
            Resolution::L1 { runbook_id } | Resolution::L2 { runbook_id, .. } => {
                let Ok(runbook) = crate::healer::lookup_runbook(&self.runbook_whitelist, &runbook_id)
                else {
                    return alert_bundle(&self.config, drift.check, drift.pre_state.clone(), now);
                };
                let window = self.config.maintenance_window;
                let ctx = HealerContext {
                    site_id: &self.config.site_id,
                    host_id: &self.config.host_id,
                    deployment_mode: self.config.deployment_mode,
                    reseller_id: self.config.reseller_id.as_deref(),
                    policy_version: &self.config.policy_version,
                    maintenance_window: &window,
                    maintenance_window_raw: &self.config.maintenance_window_raw,
                    allow_disruptive_outside_window: self.config.allow_disruptive_outside_window,
                    ntp_max_skew_ms: self.config.ntp_max_skew_ms,
                    rebuild_health_check_timeout: self.config.rebuild_health_check_timeout,
                    runbook_step_timeout: Duration::from_secs(300),
                };
                let healer = Healer::new(ctx, self.windows_transport);
                let bundle = healer.heal(
                    runbook,
                    drift.check,
                    &EmptyStateCapture,
                    None,
                    None,
                    &BTreeMap::new(),
                    None,
                    self.last_ntp_offset_ms,
                    now,
                );
                self.orchestrator.record_outcome(
                    ResolutionTier::L1,
                    &incident.signature,
                    &runbook_id,
                    bundle.outcome == Outcome::Success,
                );
                bundle
            }
            Resolution::L3 { .. } => alert_bundle(&self.config, drift.check, drift.pre_state.clone(), now),
        }
    }

    fn commit_bundle(&self, bundle: EvidenceBundle) -> Result<(), crate::error::AgentError> {
        let bundle = self.evidence.create(bundle);
        let bundle_path = self.evidence.store(&bundle, self.signer.as_ref())?;
        let sig_path = bundle_path.with_file_name("bundle.sig");
        let sig_path = sig_path.exists().then_some(sig_path);

        if let Some(client) = &self.control_plane {
            match client.upload_evidence(&bundle) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(error = %e, bundle_id = %bundle.bundle_id, "upload failed; queuing");
                }
            }
        }

        self.queue
            .enqueue(&bundle.bundle_id, bundle_path, sig_path, Utc::now())?;
        Ok(())
    }

    fn drain_queue(&self, now: chrono::DateTime<Utc>) {
        let Some(client) = &self.control_plane else {
            return;
        };
        let due = self.queue.peek_due(50, now);
        for entry in due {
            let Ok(bytes) = std::fs::read(&entry.bundle_path) else {
                let _ = self.queue.nack(entry.id, "bundle file missing", now);
                continue;
            };
            let Ok(bundle) = serde_json::from_slice::<EvidenceBundle>(&bytes) else {
                let _ = self.queue.nack(entry.id, "bundle file corrupt", now);
                continue;
            };
            match client.upload_evidence(&bundle) {
                Ok(()) => {
                    let _ = self.queue.ack(entry.id);
                }
                Err(e) => {
                    let _ = self.queue.nack(entry.id, &e.to_string(), now);
                }
            }
        }
    }
}

fn rejected_bundle(
    config: &AgentConfig,
    order: &crate::types::Order,
    outcome: Outcome,
    error: String,
    now: chrono::DateTime<Utc>,
) -> EvidenceBundle {
    EvidenceBundle {
        bundle_id: EvidenceBundle::new_bundle_id(),
        site_id: config.site_id.clone(),
        host_id: config.host_id.clone(),
        deployment_mode: config.deployment_mode,
        reseller_id: config.reseller_id.clone(),
        timestamp_start: now,
        timestamp_end: now,
        policy_version: config.policy_version.clone(),
        ruleset_hash: None,
        nixos_revision: None,
        derivation_digest: None,
        ntp_offset_ms: None,
        check: CheckKind::Order,
        hipaa_controls: vec![],
        pre_state: ScalarMap::new(),
        post_state: None,
        action_taken: vec![],
        rollback_available: false,
        rollback_generation: None,
        outcome,
        error: Some(error),
        order_id: Some(order.order_id.clone()),
        runbook_id: Some(order.runbook_id.clone()),
    }
}

fn alert_bundle(
    config: &AgentConfig,
    check: CheckKind,
    pre_state: ScalarMap,
    now: chrono::DateTime<Utc>,
) -> EvidenceBundle {
    EvidenceBundle {
        bundle_id: EvidenceBundle::new_bundle_id(),
        site_id: config.site_id.clone(),
        host_id: config.host_id.clone(),
        deployment_mode: config.deployment_mode,
        reseller_id: config.reseller_id.clone(),
        timestamp_start: now,
        timestamp_end: now,
        policy_version: config.policy_version.clone(),
        ruleset_hash: None,
        nixos_revision: None,
        derivation_digest: None,
        ntp_offset_ms: None,
        check,
        hipaa_controls: vec![],
        pre_state,
        post_state: None,
        action_taken: vec![],
        rollback_available: false,
        rollback_generation: None,
        outcome: Outcome::Alert,
        error: None,
        order_id: None,
        runbook_id: None,
    }
}

/// Load the append-only set of already-applied order ids from
/// `orders_seen_path`, one id per line. Missing file means no orders have
/// ever been applied.
fn load_orders_seen(path: &Path) -> HashSet<String> {
    let Ok(file) = std::fs::File::open(path) else {
        return HashSet::new();
    };
    std::io::BufReader::new(file)
        .lines()
        .map_while(Result::ok)
        .filter(|line| !line.is_empty())
        .collect()
}

/// Append `order_id` to the on-disk applied-order-id set so at-most-once
/// application survives a restart.
fn append_order_seen(path: &Path, order_id: &str) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{order_id}")
}

/// Sleep up to `total`, waking every 200ms to re-check `shutdown` so a
/// signal is honored within a few seconds even mid-sleep.
fn sleep_in_slices(total: Duration, shutdown: &ShutdownFlag) {
    let slice = Duration::from_millis(200);
    let mut remaining = total;
    while remaining > Duration::ZERO {
        if shutdown.is_set() {
            return;
        }
        let step = remaining.min(slice);
        std::thread::sleep(step);
        remaining -= step;
    }
}

#[cfg(unix)]
pub fn install_signal_handlers(shutdown: ShutdownFlag) {
    use std::sync::OnceLock;
    static FLAG: OnceLock<ShutdownFlag> = OnceLock::new();
    let _ = FLAG.set(shutdown);

    extern "C" fn handle(_signum: libc::c_int) {
        if let Some(flag) = FLAG.get() {
            flag.trigger();
        }
    }

    unsafe {
        libc::signal(libc::SIGTERM, handle as libc::sighandler_t);
        libc::signal(libc::SIGINT, handle as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
pub fn install_signal_handlers(_shutdown: ShutdownFlag) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_flag_round_trips() {
        let flag = ShutdownFlag::new();
        assert!(!flag.is_set());
        flag.trigger();
        assert!(flag.is_set());
    }

    #[test]
    fn sleep_in_slices_exits_early_on_shutdown() {
        let flag = ShutdownFlag::new();
        flag.trigger();
        let start = std::time::Instant::now();
        sleep_in_slices(Duration::from_secs(5), &flag);
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn load_orders_seen_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders_seen.db");
        assert!(load_orders_seen(&path).is_empty());
    }

    #[test]
    fn applied_order_ids_survive_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders_seen.db");
        append_order_seen(&path, "order-1").unwrap();
        append_order_seen(&path, "order-2").unwrap();

        let reloaded = load_orders_seen(&path);
        assert!(reloaded.contains("order-1"));
        assert!(reloaded.contains("order-2"));
        assert_eq!(reloaded.len(), 2);
    }
}
