//! Self-healer: executes a whitelisted runbook end to end and produces its
//! evidence bundle.
//!
//! `idle → gating → capturing-pre → executing → [verifying] → terminal`.
//! Gating (maintenance window, clock sanity) only applies to disruptive
//! runbooks; non-disruptive ones skip straight to capturing pre-state.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::command::CommandRunner;
use crate::error::HealerError;
use crate::maintenance_window::MaintenanceWindow;
use crate::types::{
    ActionStep, CheckKind, DeploymentMode, EvidenceBundle, Order, Outcome, RunbookClass,
    RunbookSpec, ScalarMap,
};
use crate::windows_exec::{RemoteTransport, WindowsExecutor};

/// Everything the healer needs that is fixed for the process lifetime.
pub struct HealerContext<'a> {
    pub site_id: &'a str,
    pub host_id: &'a str,
    pub deployment_mode: DeploymentMode,
    pub reseller_id: Option<&'a str>,
    pub policy_version: &'a str,
    pub maintenance_window: &'a MaintenanceWindow,
    pub maintenance_window_raw: &'a str,
    pub allow_disruptive_outside_window: bool,
    pub ntp_max_skew_ms: i64,
    pub rebuild_health_check_timeout: Duration,
    pub runbook_step_timeout: Duration,
}

/// A health probe consulted after a rebuild-class runbook finishes.
pub trait HealthProbe {
    fn is_healthy(&self, deadline: Duration) -> bool;
}

/// Runs a runbook's declared rollback recipe when a rebuild's post-check
/// fails.
pub trait RollbackRunner {
    fn run_rollback(&self, runbook: &RunbookSpec) -> Result<ActionStep, HealerError>;
}

/// Captures the relevant subset of appliance state before/after a
/// remediation attempt (service states, generation, ruleset hash, ...).
pub trait StateCapture {
    fn capture(&self) -> ScalarMap;
}

pub struct Healer<'a> {
    ctx: HealerContext<'a>,
    command_runner: CommandRunner,
    windows_transport: Option<&'a dyn RemoteTransport>,
}

impl<'a> Healer<'a> {
    #[must_use]
    pub fn new(ctx: HealerContext<'a>, windows_transport: Option<&'a dyn RemoteTransport>) -> Self {
        Self {
            ctx,
            command_runner: CommandRunner::new(),
            windows_transport,
        }
    }

    /// Execute `runbook`, returning a fully-formed (unsigned, unstored)
    /// evidence bundle. `triggering_order` is set when the runbook was
    /// invoked from an operator order rather than a drift finding.
    #[allow(clippy::too_many_arguments)]
    pub fn heal(
        &self,
        runbook: &RunbookSpec,
        check: CheckKind,
        state_capture: &dyn StateCapture,
        health_probe: Option<&dyn HealthProbe>,
        rollback: Option<&dyn RollbackRunner>,
        windows_targets: &BTreeMap<String, crate::types::WindowsTarget>,
        triggering_order: Option<&Order>,
        ntp_offset_ms: i64,
        now: DateTime<Utc>,
    ) -> EvidenceBundle {
        let timestamp_start = now;

        // Gating: clock sanity and maintenance window apply to disruptive
        // runbooks only.
        if runbook.class == RunbookClass::Disruptive {
            if ntp_offset_ms.abs() > self.ctx.ntp_max_skew_ms {
                return self.bundle(
                    runbook,
                    check,
                    ScalarMap::new(),
                    None,
                    vec![],
                    Outcome::Alert,
                    Some(format!("clock skew {ntp_offset_ms}ms exceeds threshold")),
                    false,
                    triggering_order,
                    ntp_offset_ms,
                    timestamp_start,
                    now,
                );
            }

            let in_window = self.ctx.maintenance_window.in_window(now);
            if !in_window && !self.ctx.allow_disruptive_outside_window {
                let mut pre_state = ScalarMap::new();
                pre_state.insert(
                    "window".to_string(),
                    crate::types::Scalar::Str(self.ctx.maintenance_window_raw.to_string()),
                );
                pre_state.insert(
                    "now".to_string(),
                    crate::types::Scalar::Str(now.format("%H:%M").to_string()),
                );
                return self.bundle(
                    runbook,
                    check,
                    pre_state,
                    None,
                    vec![],
                    Outcome::Deferred,
                    None,
                    false,
                    triggering_order,
                    ntp_offset_ms,
                    timestamp_start,
                    now,
                );
            }
        }

        let pre_state = state_capture.capture();
        let mut action_taken = Vec::new();
        let mut aborted = false;

        for (idx, step) in runbook.steps.iter().enumerate() {
            let idx = idx as u32;
            let outcome_step = if let Some(role) = &step.target_role {
                self.execute_remote_step(step, idx, windows_targets, role, now)
            } else {
                self.execute_local_step(step, idx)
            };

            match outcome_step {
                Ok(action) => {
                    let failed = !step.optional && action.exit_code != Some(0);
                    action_taken.push(action);
                    if failed {
                        aborted = true;
                        break;
                    }
                }
                Err(e) => {
                    action_taken.push(ActionStep {
                        step_index: idx,
                        action_name: step.action_name.clone(),
                        command: Some(step.argv.join(" ")),
                        exit_code: None,
                        duration_sec: 0.0,
                        result_summary: e.to_string(),
                    });
                    if !step.optional {
                        aborted = true;
                        break;
                    }
                }
            }
        }

        let (outcome, rollback_available, post_state) = if aborted {
            (Outcome::Failed, false, Some(pre_state.clone()))
        } else if runbook.involves_rebuild {
            let healthy = health_probe
                .map(|p| p.is_healthy(self.ctx.rebuild_health_check_timeout))
                .unwrap_or(true);
            if healthy {
                (Outcome::Success, true, Some(state_capture.capture()))
            } else if let Some(rollback) = rollback {
                match rollback.run_rollback(runbook) {
                    Ok(step) => {
                        action_taken.push(step);
                        (Outcome::Reverted, true, Some(pre_state.clone()))
                    }
                    Err(e) => {
                        action_taken.push(ActionStep {
                            step_index: action_taken.len() as u32,
                            action_name: "rollback".to_string(),
                            command: None,
                            exit_code: None,
                            duration_sec: 0.0,
                            result_summary: e.to_string(),
                        });
                        (Outcome::Failed, false, Some(pre_state.clone()))
                    }
                }
            } else {
                (Outcome::Failed, false, Some(pre_state.clone()))
            }
        } else {
            (Outcome::Success, true, Some(state_capture.capture()))
        };

        self.bundle(
            runbook,
            check,
            pre_state,
            post_state,
            action_taken,
            outcome,
            None,
            rollback_available,
            triggering_order,
            ntp_offset_ms,
            timestamp_start,
            Utc::now().max(now),
        )
    }

    fn execute_local_step(
        &self,
        step: &crate::types::RunbookStep,
        idx: u32,
    ) -> Result<ActionStep, HealerError> {
        let result = self
            .command_runner
            .run(&step.argv, self.ctx.runbook_step_timeout, None)
            .map_err(|e| HealerError::StepFailed {
                step_index: idx,
                action_name: step.action_name.clone(),
                reason: e.to_string(),
            })?;
        Ok(ActionStep {
            step_index: idx,
            action_name: step.action_name.clone(),
            command: Some(step.argv.join(" ")),
            exit_code: result.exit_code,
            duration_sec: result.duration_sec,
            result_summary: if result.succeeded() {
                "step succeeded".to_string()
            } else {
                format!("exit {:?}: {}", result.exit_code, result.stderr)
            },
        })
    }

    fn execute_remote_step(
        &self,
        step: &crate::types::RunbookStep,
        idx: u32,
        windows_targets: &BTreeMap<String, crate::types::WindowsTarget>,
        role: &str,
        now: DateTime<Utc>,
    ) -> Result<ActionStep, HealerError> {
        let Some(transport) = self.windows_transport else {
            return Err(HealerError::StepFailed {
                step_index: idx,
                action_name: step.action_name.clone(),
                reason: "no Windows transport configured".to_string(),
            });
        };
        let Some(target) = windows_targets.get(role) else {
            return Err(HealerError::StepFailed {
                step_index: idx,
                action_name: step.action_name.clone(),
                reason: format!("no Windows target fetched for role {role}"),
            });
        };
        let executor = WindowsExecutor::new(transport);
        executor
            .execute_on_target(target, step, idx, self.ctx.runbook_step_timeout, now)
            .map_err(|e| HealerError::StepFailed {
                step_index: idx,
                action_name: step.action_name.clone(),
                reason: e.to_string(),
            })
    }

    #[allow(clippy::too_many_arguments)]
    fn bundle(
        &self,
        runbook: &RunbookSpec,
        check: CheckKind,
        pre_state: ScalarMap,
        post_state: Option<ScalarMap>,
        action_taken: Vec<ActionStep>,
        outcome: Outcome,
        error: Option<String>,
        rollback_available: bool,
        triggering_order: Option<&Order>,
        ntp_offset_ms: i64,
        timestamp_start: DateTime<Utc>,
        timestamp_end: DateTime<Utc>,
    ) -> EvidenceBundle {
        EvidenceBundle {
            bundle_id: EvidenceBundle::new_bundle_id(),
            site_id: self.ctx.site_id.to_string(),
            host_id: self.ctx.host_id.to_string(),
            deployment_mode: self.ctx.deployment_mode,
            reseller_id: self.ctx.reseller_id.map(str::to_string),
            timestamp_start,
            timestamp_end: timestamp_end.max(timestamp_start),
            policy_version: self.ctx.policy_version.to_string(),
            ruleset_hash: None,
            nixos_revision: None,
            derivation_digest: None,
            ntp_offset_ms: Some(ntp_offset_ms),
            check,
            hipaa_controls: vec![],
            pre_state,
            post_state,
            action_taken,
            rollback_available,
            rollback_generation: None,
            outcome,
            error,
            order_id: triggering_order.map(|o| o.order_id.clone()),
            runbook_id: Some(runbook.runbook_id.clone()),
        }
    }
}

/// Look up a runbook by id in the local whitelist, refusing unknown ids.
pub fn lookup_runbook<'a>(
    whitelist: &'a [RunbookSpec],
    runbook_id: &str,
) -> Result<&'a RunbookSpec, HealerError> {
    whitelist
        .iter()
        .find(|r| r.runbook_id == runbook_id)
        .ok_or_else(|| HealerError::UnknownRunbook {
            runbook_id: runbook_id.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RunbookStep;
    use chrono::TimeZone;

    struct FixedCapture(ScalarMap);
    impl StateCapture for FixedCapture {
        fn capture(&self) -> ScalarMap {
            self.0.clone()
        }
    }

    struct AlwaysHealthy;
    impl HealthProbe for AlwaysHealthy {
        fn is_healthy(&self, _deadline: Duration) -> bool {
            true
        }
    }

    struct AlwaysDegraded;
    impl HealthProbe for AlwaysDegraded {
        fn is_healthy(&self, _deadline: Duration) -> bool {
            false
        }
    }

    struct FakeRollback;
    impl RollbackRunner for FakeRollback {
        fn run_rollback(&self, _runbook: &RunbookSpec) -> Result<ActionStep, HealerError> {
            Ok(ActionStep {
                step_index: 99,
                action_name: "rollback".to_string(),
                command: None,
                exit_code: Some(0),
                duration_sec: 1.0,
                result_summary: "rolled back".to_string(),
            })
        }
    }

    fn ctx<'a>(window: &'a MaintenanceWindow) -> HealerContext<'a> {
        HealerContext {
            site_id: "site-1",
            host_id: "host-1",
            deployment_mode: DeploymentMode::Direct,
            reseller_id: None,
            policy_version: "v1",
            maintenance_window: window,
            maintenance_window_raw: "02:00-04:00",
            allow_disruptive_outside_window: false,
            ntp_max_skew_ms: 5000,
            rebuild_health_check_timeout: Duration::from_secs(1),
            runbook_step_timeout: Duration::from_secs(5),
        }
    }

    fn non_disruptive_runbook() -> RunbookSpec {
        RunbookSpec {
            runbook_id: "RB-NOOP".to_string(),
            class: RunbookClass::NonDisruptive,
            steps: vec![RunbookStep {
                action_name: "true".to_string(),
                argv: vec!["true".to_string()],
                optional: false,
                target_role: None,
            }],
            involves_rebuild: false,
        }
    }

    #[test]
    fn non_disruptive_runbook_succeeds() {
        let window = MaintenanceWindow::parse("02:00-04:00").unwrap();
        let healer = Healer::new(ctx(&window), None);
        let now = chrono::Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        let bundle = healer.heal(
            &non_disruptive_runbook(),
            CheckKind::Patching,
            &FixedCapture(ScalarMap::new()),
            None,
            None,
            &BTreeMap::new(),
            None,
            100,
            now,
        );
        assert_eq!(bundle.outcome, Outcome::Success);
        assert!(bundle.post_state_invariant_holds());
    }

    #[test]
    fn disruptive_runbook_deferred_outside_window() {
        let window = MaintenanceWindow::parse("02:00-04:00").unwrap();
        let mut runbook = non_disruptive_runbook();
        runbook.class = RunbookClass::Disruptive;
        runbook.runbook_id = "RB-FIREWALL-BASELINE-RESTORE".to_string();

        let healer = Healer::new(ctx(&window), None);
        let now = chrono::Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        let bundle = healer.heal(
            &runbook,
            CheckKind::Firewall,
            &FixedCapture(ScalarMap::new()),
            None,
            None,
            &BTreeMap::new(),
            None,
            100,
            now,
        );
        assert_eq!(bundle.outcome, Outcome::Deferred);
        assert!(bundle.action_taken.is_empty());
        assert!(bundle.post_state_invariant_holds());
        assert_eq!(
            bundle.pre_state.get("window"),
            Some(&crate::types::Scalar::Str("02:00-04:00".to_string()))
        );
    }

    #[test]
    fn disruptive_runbook_alerts_on_clock_skew() {
        let window = MaintenanceWindow::parse("02:00-04:00").unwrap();
        let mut runbook = non_disruptive_runbook();
        runbook.class = RunbookClass::Disruptive;

        let healer = Healer::new(ctx(&window), None);
        let now = chrono::Utc.with_ymd_and_hms(2026, 1, 1, 3, 0, 0).unwrap();
        let bundle = healer.heal(
            &runbook,
            CheckKind::Firewall,
            &FixedCapture(ScalarMap::new()),
            None,
            None,
            &BTreeMap::new(),
            None,
            10_000,
            now,
        );
        assert_eq!(bundle.outcome, Outcome::Alert);
    }

    #[test]
    fn rebuild_rollback_on_failed_health_check() {
        let window = MaintenanceWindow::parse("02:00-04:00").unwrap();
        let mut runbook = non_disruptive_runbook();
        runbook.involves_rebuild = true;

        let healer = Healer::new(ctx(&window), None);
        let now = chrono::Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        let bundle = healer.heal(
            &runbook,
            CheckKind::Patching,
            &FixedCapture(ScalarMap::new()),
            Some(&AlwaysDegraded),
            Some(&FakeRollback),
            &BTreeMap::new(),
            None,
            100,
            now,
        );
        assert_eq!(bundle.outcome, Outcome::Reverted);
        assert!(bundle.action_taken.iter().any(|a| a.action_name == "rollback"));
    }

    #[test]
    fn rebuild_succeeds_when_healthy() {
        let window = MaintenanceWindow::parse("02:00-04:00").unwrap();
        let mut runbook = non_disruptive_runbook();
        runbook.involves_rebuild = true;

        let healer = Healer::new(ctx(&window), None);
        let now = chrono::Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        let bundle = healer.heal(
            &runbook,
            CheckKind::Patching,
            &FixedCapture(ScalarMap::new()),
            Some(&AlwaysHealthy),
            Some(&FakeRollback),
            &BTreeMap::new(),
            None,
            100,
            now,
        );
        assert_eq!(bundle.outcome, Outcome::Success);
    }

    #[test]
    fn unknown_runbook_is_refused() {
        let whitelist = vec![non_disruptive_runbook()];
        let err = lookup_runbook(&whitelist, "RB-DOES-NOT-EXIST").unwrap_err();
        assert!(matches!(err, HealerError::UnknownRunbook { .. }));
    }
}
