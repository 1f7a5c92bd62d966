//! Tiered orchestrator: deterministic rules (L1), external planner (L2),
//! human escalation (L3).

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::{Incident, ResolutionTier};

/// Minimum recent applications before a rule's success rate is trusted.
const MIN_APPLICATIONS: u32 = 5;
/// Success-rate threshold for an L1 rule to resolve an incident.
const L1_SUCCESS_THRESHOLD: f64 = 0.9;
/// Planner confidence floor to accept an L2 recommendation.
const L2_CONFIDENCE_THRESHOLD: f64 = 0.7;
/// Consecutive L2 successes required before promotion to L1.
const PROMOTION_STREAK: u32 = 5;
/// Success rate below which an L1 rule is marked inactive.
const RULE_DEACTIVATION_THRESHOLD: f64 = 0.5;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct L1Rule {
    pub signature: String,
    pub runbook_id: String,
    pub successes: u32,
    pub applications: u32,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl L1Rule {
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.applications == 0 {
            0.0
        } else {
            f64::from(self.successes) / f64::from(self.applications)
        }
    }

    #[must_use]
    pub fn matches(&self, signature: &str) -> bool {
        self.active
            && self.signature == signature
            && self.applications >= MIN_APPLICATIONS
            && self.success_rate() >= L1_SUCCESS_THRESHOLD
    }
}

/// An external planner's proposed resolution for an incident with no L1
/// match. The planner is an optional collaborator; the orchestrator does
/// not depend on any specific implementation.
pub trait Planner {
    fn plan(&self, incident: &Incident) -> Option<PlannerRecommendation>;
}

pub struct PlannerRecommendation {
    pub runbook_id: String,
    pub confidence: f64,
}

/// Produced by level 3 when no automated resolution applies.
pub struct EscalationTicket {
    pub incident_id: String,
    pub incident_type: String,
    pub proposed_runbook_id: Option<String>,
}

pub enum Resolution {
    L1 {
        runbook_id: String,
    },
    L2 {
        runbook_id: String,
        confidence: f64,
    },
    L3 {
        ticket: EscalationTicket,
    },
}

/// Streak tracking for the data-flywheel L2→L1 promotion rule, keyed by
/// incident signature.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct L2Streak {
    runbook_id: String,
    consecutive_successes: u32,
    successes: u32,
    applications: u32,
}

pub struct TieredOrchestrator {
    rules: Vec<L1Rule>,
    runbook_whitelist: Vec<String>,
    streaks: std::collections::HashMap<String, L2Streak>,
    staged_path: PathBuf,
    staged_promotions: Vec<L1Rule>,
}

impl TieredOrchestrator {
    #[must_use]
    pub fn new(rules: Vec<L1Rule>, runbook_whitelist: Vec<String>, staged_path: PathBuf) -> Self {
        Self {
            rules,
            runbook_whitelist,
            streaks: std::collections::HashMap::new(),
            staged_path,
            staged_promotions: Vec::new(),
        }
    }

    /// Rules currently loaded, including any promoted at the last process
    /// start (callers load the staged file into `rules` before
    /// constructing this orchestrator — promotion never mutates rules at
    /// runtime).
    #[must_use]
    pub fn load_staged_rules(staged_path: &Path) -> Vec<L1Rule> {
        fs::read(staged_path)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .unwrap_or_default()
    }

    pub fn resolve(
        &mut self,
        incident: &Incident,
        planner: Option<&dyn Planner>,
    ) -> Resolution {
        if let Some(rule) = self.rules.iter().find(|r| r.matches(&incident.signature)) {
            return Resolution::L1 {
                runbook_id: rule.runbook_id.clone(),
            };
        }

        if let Some(planner) = planner {
            if let Some(rec) = planner.plan(incident) {
                if rec.confidence >= L2_CONFIDENCE_THRESHOLD
                    && self.runbook_whitelist.contains(&rec.runbook_id)
                {
                    return Resolution::L2 {
                        runbook_id: rec.runbook_id,
                        confidence: rec.confidence,
                    };
                }
            }
        }

        Resolution::L3 {
            ticket: EscalationTicket {
                incident_id: incident.incident_id.clone(),
                incident_type: incident.incident_type.clone(),
                proposed_runbook_id: incident.recommended_runbook_id.clone(),
            },
        }
    }

    /// Record the terminal outcome of a resolution for the relevant
    /// tier's bookkeeping: L1 rule success-rate counters, or L2 streak
    /// tracking feeding the promotion rule.
    pub fn record_outcome(
        &mut self,
        tier: ResolutionTier,
        signature: &str,
        runbook_id: &str,
        success: bool,
    ) {
        match tier {
            ResolutionTier::L1 => {
                if let Some(rule) = self
                    .rules
                    .iter_mut()
                    .find(|r| r.signature == signature && r.runbook_id == runbook_id)
                {
                    rule.applications += 1;
                    if success {
                        rule.successes += 1;
                    }
                    if rule.success_rate() < RULE_DEACTIVATION_THRESHOLD {
                        rule.active = false;
                    }
                }
            }
            ResolutionTier::L2 => {
                let streak = self
                    .streaks
                    .entry(signature.to_string())
                    .or_insert_with(|| L2Streak {
                        runbook_id: runbook_id.to_string(),
                        ..Default::default()
                    });
                streak.applications += 1;
                if success {
                    streak.successes += 1;
                    streak.consecutive_successes += 1;
                } else {
                    streak.consecutive_successes = 0;
                }

                let rate = f64::from(streak.successes) / f64::from(streak.applications);
                if streak.consecutive_successes >= PROMOTION_STREAK && rate >= L1_SUCCESS_THRESHOLD
                {
                    self.stage_promotion(signature, runbook_id);
                }
            }
            ResolutionTier::L3 => {}
        }
    }

    fn stage_promotion(&mut self, signature: &str, runbook_id: &str) {
        if self
            .staged_promotions
            .iter()
            .any(|r| r.signature == signature)
        {
            return;
        }
        self.staged_promotions.push(L1Rule {
            signature: signature.to_string(),
            runbook_id: runbook_id.to_string(),
            successes: PROMOTION_STREAK,
            applications: PROMOTION_STREAK,
            active: true,
        });
        let _ = self.flush_staged_promotions();
    }

    fn flush_staged_promotions(&self) -> std::io::Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.staged_promotions)?;
        if let Some(parent) = self.staged_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.staged_path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.staged_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ScalarMap;
    use tempfile::tempdir;

    fn incident(signature: &str) -> Incident {
        Incident {
            incident_id: "inc-1".into(),
            incident_type: "nginx_down".into(),
            signature: signature.into(),
            recommended_runbook_id: Some("RB-RESTART-NGINX".into()),
            triggering_order: None,
            params: ScalarMap::new(),
        }
    }

    struct FixedPlanner {
        confidence: f64,
    }
    impl Planner for FixedPlanner {
        fn plan(&self, _incident: &Incident) -> Option<PlannerRecommendation> {
            Some(PlannerRecommendation {
                runbook_id: "RB-RESTART-NGINX".into(),
                confidence: self.confidence,
            })
        }
    }

    #[test]
    fn resolves_at_l1_when_rule_meets_threshold() {
        let dir = tempdir().unwrap();
        let rule = L1Rule {
            signature: "nginx_down".into(),
            runbook_id: "RB-RESTART-NGINX".into(),
            successes: 9,
            applications: 10,
            active: true,
        };
        let mut orch = TieredOrchestrator::new(
            vec![rule],
            vec!["RB-RESTART-NGINX".into()],
            dir.path().join("staged.json"),
        );
        let resolution = orch.resolve(&incident("nginx_down"), None);
        assert!(matches!(resolution, Resolution::L1 { runbook_id } if runbook_id == "RB-RESTART-NGINX"));
    }

    #[test]
    fn falls_through_to_l2_planner_when_no_l1_match() {
        let dir = tempdir().unwrap();
        let mut orch = TieredOrchestrator::new(
            vec![],
            vec!["RB-RESTART-NGINX".into()],
            dir.path().join("staged.json"),
        );
        let planner = FixedPlanner { confidence: 0.8 };
        let resolution = orch.resolve(&incident("nginx_down"), Some(&planner));
        assert!(matches!(resolution, Resolution::L2 { confidence, .. } if confidence == 0.8));
    }

    #[test]
    fn low_confidence_planner_result_falls_through_to_l3() {
        let dir = tempdir().unwrap();
        let mut orch = TieredOrchestrator::new(
            vec![],
            vec!["RB-RESTART-NGINX".into()],
            dir.path().join("staged.json"),
        );
        let planner = FixedPlanner { confidence: 0.3 };
        let resolution = orch.resolve(&incident("nginx_down"), Some(&planner));
        assert!(matches!(resolution, Resolution::L3 { .. }));
    }

    #[test]
    fn five_consecutive_l2_successes_stage_an_l1_promotion() {
        let dir = tempdir().unwrap();
        let staged_path = dir.path().join("staged.json");
        let mut orch =
            TieredOrchestrator::new(vec![], vec!["RB-RESTART-NGINX".into()], staged_path.clone());

        for _ in 0..5 {
            orch.record_outcome(
                ResolutionTier::L2,
                "nginx_down",
                "RB-RESTART-NGINX",
                true,
            );
        }

        let staged: Vec<L1Rule> =
            serde_json::from_slice(&fs::read(&staged_path).unwrap()).unwrap();
        assert_eq!(staged.len(), 1);
        assert_eq!(staged[0].signature, "nginx_down");
    }

    #[test]
    fn l1_rule_deactivates_below_success_floor() {
        let dir = tempdir().unwrap();
        let rule = L1Rule {
            signature: "nginx_down".into(),
            runbook_id: "RB-RESTART-NGINX".into(),
            successes: 5,
            applications: 5,
            active: true,
        };
        let mut orch = TieredOrchestrator::new(
            vec![rule],
            vec!["RB-RESTART-NGINX".into()],
            dir.path().join("staged.json"),
        );
        for _ in 0..10 {
            orch.record_outcome(ResolutionTier::L1, "nginx_down", "RB-RESTART-NGINX", false);
        }
        assert!(!orch.rules[0].active);
    }
}
