//! End-to-end scenarios covering the agent's order-handling, rebuild
//! rollback, and offline-queue behaviors.

use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use compliance_agent::control_plane::{validate_order, OrderValidationError};
use compliance_agent::evidence::{EvidenceStore, ListFilter};
use compliance_agent::healer::{Healer, HealerContext, StateCapture};
use compliance_agent::maintenance_window::MaintenanceWindow;
use compliance_agent::queue::{NackOutcome, OfflineQueue, MAX_RETRY_COUNT};
use compliance_agent::types::{
    DeploymentMode, Order, Outcome, RunbookClass, RunbookSpec, RunbookStep, Scalar, ScalarMap,
};

struct FixedCapture(ScalarMap);
impl StateCapture for FixedCapture {
    fn capture(&self) -> ScalarMap {
        self.0.clone()
    }
}

fn healer_ctx<'a>(window: &'a MaintenanceWindow, allow_outside: bool) -> HealerContext<'a> {
    HealerContext {
        site_id: "site-1",
        host_id: "host-1",
        deployment_mode: DeploymentMode::Direct,
        reseller_id: None,
        policy_version: "v1",
        maintenance_window: window,
        maintenance_window_raw: "02:00-04:00",
        allow_disruptive_outside_window: allow_outside,
        ntp_max_skew_ms: 5000,
        rebuild_health_check_timeout: Duration::from_secs(1),
        runbook_step_timeout: Duration::from_secs(5),
    }
}

/// Scenario 1: successful patching inside the maintenance window with a
/// small clock offset well within tolerance.
#[test]
fn scenario_successful_patching() {
    let window = MaintenanceWindow::parse("02:00-04:00").unwrap();
    let runbook = RunbookSpec {
        runbook_id: "RB-PATCH-001".to_string(),
        class: RunbookClass::NonDisruptive,
        steps: vec![RunbookStep {
            action_name: "apply_patch".to_string(),
            argv: vec!["true".to_string()],
            optional: false,
            target_role: None,
        }],
        involves_rebuild: false,
    };
    let healer = Healer::new(healer_ctx(&window, false), None);
    let now = Utc.with_ymd_and_hms(2026, 1, 1, 2, 30, 0).unwrap();

    let mut pre = ScalarMap::new();
    pre.insert("generation".to_string(), Scalar::Str("gen-41".to_string()));

    let bundle = healer.heal(
        &runbook,
        compliance_agent::types::CheckKind::Patching,
        &FixedCapture(pre),
        None,
        None,
        &BTreeMap::new(),
        None,
        120,
        now,
    );

    assert_eq!(bundle.outcome, Outcome::Success);
    assert!(bundle.rollback_available);
    assert_eq!(bundle.action_taken.len(), 1);
    assert!(bundle.post_state_invariant_holds());
}

/// Scenario 2: a disruptive order arrives outside the maintenance window
/// with `allow_disruptive_outside_window=false` and is deferred without
/// mutating anything.
#[test]
fn scenario_deferred_disruptive_order_outside_window() {
    let window = MaintenanceWindow::parse("02:00-04:00").unwrap();
    let runbook = RunbookSpec {
        runbook_id: "RB-FIREWALL-BASELINE-RESTORE".to_string(),
        class: RunbookClass::Disruptive,
        steps: vec![RunbookStep {
            action_name: "restore_baseline".to_string(),
            argv: vec!["true".to_string()],
            optional: false,
            target_role: None,
        }],
        involves_rebuild: false,
    };
    let healer = Healer::new(healer_ctx(&window, false), None);
    let now = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();

    let order = Order {
        order_id: "order-1".to_string(),
        runbook_id: runbook.runbook_id.clone(),
        params: ScalarMap::new(),
        nonce: "nonce-1".to_string(),
        ttl_sec: 900,
        issued_at: now,
        signature: None,
    };

    let bundle = healer.heal(
        &runbook,
        compliance_agent::types::CheckKind::Firewall,
        &FixedCapture(ScalarMap::new()),
        None,
        None,
        &BTreeMap::new(),
        Some(&order),
        100,
        now,
    );

    assert_eq!(bundle.outcome, Outcome::Deferred);
    assert!(bundle.action_taken.is_empty());
    assert_eq!(bundle.order_id.as_deref(), Some("order-1"));
    assert_eq!(
        bundle.pre_state.get("window"),
        Some(&Scalar::Str("02:00-04:00".to_string()))
    );
    assert_eq!(
        bundle.pre_state.get("now"),
        Some(&Scalar::Str("10:00".to_string()))
    );
}

/// Scenario 3: an order received 20 minutes after issuance with a 900s
/// TTL is rejected as expired, and is not recorded in the applied set.
#[test]
fn scenario_expired_order_rejected() {
    let issued_at = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    let now = issued_at + chrono::Duration::minutes(20);
    let order = Order {
        order_id: "order-2".to_string(),
        runbook_id: "RB-PATCH-001".to_string(),
        params: ScalarMap::new(),
        nonce: "nonce-2".to_string(),
        ttl_sec: 900,
        issued_at,
        signature: None,
    };
    let seen = HashSet::new();

    let err = validate_order(&order, now, 900, &seen).unwrap_err();
    assert_eq!(err, OrderValidationError::Expired);
    // Since validation failed before any healer invocation, the order id is
    // never added to a seen-set by the caller.
    assert!(!seen.contains(&order.order_id));
}

/// Scenario 4: a rebuild-class runbook completes its steps but the
/// post-action health check stays degraded past the timeout, triggering
/// rollback and `outcome = reverted`.
#[test]
fn scenario_rebuild_rollback_on_failed_health() {
    use compliance_agent::healer::{HealthProbe, RollbackRunner};
    use compliance_agent::types::ActionStep;

    struct AlwaysDegraded;
    impl HealthProbe for AlwaysDegraded {
        fn is_healthy(&self, _deadline: Duration) -> bool {
            false
        }
    }
    struct Rollback;
    impl RollbackRunner for Rollback {
        fn run_rollback(
            &self,
            _runbook: &RunbookSpec,
        ) -> Result<ActionStep, compliance_agent::error::HealerError> {
            Ok(ActionStep {
                step_index: 1,
                action_name: "rollback_generation".to_string(),
                command: None,
                exit_code: Some(0),
                duration_sec: 2.0,
                result_summary: "rolled back to previous generation".to_string(),
            })
        }
    }

    let window = MaintenanceWindow::parse("02:00-04:00").unwrap();
    let runbook = RunbookSpec {
        runbook_id: "RB-PATCH-001".to_string(),
        class: RunbookClass::NonDisruptive,
        steps: vec![RunbookStep {
            action_name: "apply_patch".to_string(),
            argv: vec!["true".to_string()],
            optional: false,
            target_role: None,
        }],
        involves_rebuild: true,
    };
    let healer = Healer::new(healer_ctx(&window, false), None);
    let now = Utc.with_ymd_and_hms(2026, 1, 1, 2, 30, 0).unwrap();

    let mut pre = ScalarMap::new();
    pre.insert("generation".to_string(), Scalar::Str("gen-41".to_string()));

    let bundle = healer.heal(
        &runbook,
        compliance_agent::types::CheckKind::Patching,
        &FixedCapture(pre.clone()),
        Some(&AlwaysDegraded),
        Some(&Rollback),
        &BTreeMap::new(),
        None,
        100,
        now,
    );

    assert_eq!(bundle.outcome, Outcome::Reverted);
    assert_eq!(bundle.post_state, Some(pre));
    assert!(bundle
        .action_taken
        .iter()
        .any(|a| a.action_name == "rollback_generation"));
}

/// Scenario 5: the control plane is unreachable; evidence keeps being
/// produced and queued, backoff is honored, and once the control plane
/// returns every bundle drains and acks exactly once.
#[test]
fn scenario_offline_queue_drains_after_outage() {
    let dir = tempfile::tempdir().unwrap();
    let queue = OfflineQueue::open(dir.path()).unwrap();
    let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();

    let bundle_path = dir.path().join("bundle.json");
    std::fs::write(&bundle_path, b"{}").unwrap();
    let id = queue
        .enqueue("bundle-1", bundle_path, None, now)
        .unwrap();

    // Simulate repeated upload failures during the outage.
    let mut t = now;
    for _ in 0..3 {
        let outcome = queue.nack(id, "connection refused", t).unwrap();
        assert_eq!(outcome, NackOutcome::Rescheduled);
        t = t + chrono::Duration::hours(1);
    }
    assert_eq!(queue.depth(), 1);

    // Control plane returns: the entry is now due and acks exactly once.
    let due = queue.peek_due(10, t);
    assert_eq!(due.len(), 1);
    queue.ack(due[0].id).unwrap();
    assert_eq!(queue.depth(), 0);
}

/// Boundary behavior: retries beyond the cap move an entry to
/// dead-letter rather than rescheduling indefinitely.
#[test]
fn scenario_exceeding_retry_cap_moves_to_dead_letter() {
    let dir = tempfile::tempdir().unwrap();
    let queue = OfflineQueue::open(dir.path()).unwrap();
    let now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    let bundle_path = dir.path().join("bundle.json");
    std::fs::write(&bundle_path, b"{}").unwrap();
    let id = queue.enqueue("bundle-x", bundle_path, None, now).unwrap();

    let mut outcome = NackOutcome::Rescheduled;
    let mut t = now;
    for _ in 0..=MAX_RETRY_COUNT {
        outcome = queue.nack(id, "still down", t).unwrap();
        t = t + chrono::Duration::hours(1);
    }
    assert_eq!(outcome, NackOutcome::DeadLettered);
}

/// The no-PHI and signature-integrity invariants on the evidence store
/// end to end: create → store(sign) → verify.
#[test]
fn evidence_store_signs_and_verifies_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let key_dir = tempfile::tempdir().unwrap();
    let key_path = key_dir.path().join("signing.key");
    compliance_agent::signer::generate_key_file(&key_path).unwrap();
    let signer = compliance_agent::signer::Signer::load_from_file(&key_path).unwrap();

    let store = EvidenceStore::open(dir.path()).unwrap();
    let now = Utc.with_ymd_and_hms(2026, 1, 1, 2, 30, 0).unwrap();

    let mut pre_state = ScalarMap::new();
    pre_state.insert(
        "note".to_string(),
        Scalar::Str("patient ssn 123-45-6789 seen in raw log".to_string()),
    );

    let bundle = compliance_agent::types::EvidenceBundle {
        bundle_id: compliance_agent::types::EvidenceBundle::new_bundle_id(),
        site_id: "site-1".to_string(),
        host_id: "host-1".to_string(),
        deployment_mode: DeploymentMode::Direct,
        reseller_id: None,
        timestamp_start: now,
        timestamp_end: now,
        policy_version: "v1".to_string(),
        ruleset_hash: None,
        nixos_revision: None,
        derivation_digest: None,
        ntp_offset_ms: Some(100),
        check: compliance_agent::types::CheckKind::Patching,
        hipaa_controls: vec![],
        pre_state,
        post_state: Some(ScalarMap::new()),
        action_taken: vec![],
        rollback_available: false,
        rollback_generation: None,
        outcome: Outcome::Success,
        error: None,
        order_id: None,
        runbook_id: None,
    };

    let bundle = store.create(bundle);
    assert!(!compliance_agent::redact::contains_phi_pattern(
        bundle.pre_state.get("note").unwrap().to_string().as_str()
    ));

    store.store(&bundle, Some(&signer)).unwrap();
    assert!(store.verify(&bundle.bundle_id, &signer.verifying_key()).unwrap());

    let all = store.list(&ListFilter::default()).unwrap();
    assert_eq!(all.len(), 1);
}
