//! Core value types shared across the agent's components.
//!
//! These are plain, immutable-by-convention data shapes with validation at
//! construction and canonical `serde` serialization. Nothing here owns I/O.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Scalar value carried in order params and state maps.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(s) => write!(f, "{s}"),
        }
    }
}

/// Opaque key/value map used for `pre_state`/`post_state` and order params.
pub type ScalarMap = BTreeMap<String, Scalar>;

/// Severity of a drift finding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// The six independent drift check families.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Patching,
    EndpointProtection,
    Backup,
    Logging,
    Firewall,
    Encryption,
    /// Not a drift check: the bundle pertains to an operator-initiated order.
    Order,
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Patching => "patching",
            Self::EndpointProtection => "endpoint_protection",
            Self::Backup => "backup",
            Self::Logging => "logging",
            Self::Firewall => "firewall",
            Self::Encryption => "encryption",
            Self::Order => "order",
        };
        write!(f, "{s}")
    }
}

/// Terminal (and non-terminal gating) outcomes an evidence bundle can record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Success,
    Failed,
    Reverted,
    Deferred,
    Alert,
    Rejected,
    Expired,
}

impl Outcome {
    /// Outcomes that represent a completed remediation attempt (as opposed to
    /// a gate that stopped the attempt before it started).
    #[must_use]
    pub const fn is_terminal_attempt(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Reverted)
    }

    /// Outcomes for which `post_state` must be present.
    #[must_use]
    pub const fn carries_post_state(self) -> bool {
        self.is_terminal_attempt()
    }
}

/// An instruction pulled from the control plane during check-in.
///
/// Validity is established by [`crate::control_plane::validate_order`], not
/// by construction — an `Order` can be deserialized straight off the wire
/// and may still turn out to be expired, replayed, or unwhitelisted.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    pub runbook_id: String,
    #[serde(default)]
    pub params: ScalarMap,
    pub nonce: String,
    pub ttl_sec: u64,
    pub issued_at: DateTime<Utc>,
    #[serde(default)]
    pub signature: Option<String>,
}

/// A Windows remediation/inspection target pulled fresh each cycle.
///
/// Never persisted; held in memory only for the cycle that produced it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WindowsTarget {
    pub hostname: String,
    pub ip: String,
    pub credential_user: String,
    #[serde(skip_serializing)]
    pub credential_secret: String,
    #[serde(default)]
    pub roles: Vec<String>,
    /// When this credential was received; used to refuse stale use within
    /// the executor.
    pub fetched_at: DateTime<Utc>,
}

impl fmt::Debug for WindowsTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WindowsTarget")
            .field("hostname", &self.hostname)
            .field("ip", &self.ip)
            .field("credential_user", &self.credential_user)
            .field("credential_secret", &"<redacted>")
            .field("roles", &self.roles)
            .field("fetched_at", &self.fetched_at)
            .finish()
    }
}

/// The result of running one drift check family.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DriftResult {
    pub check: CheckKind,
    pub drifted: bool,
    pub severity: Severity,
    pub pre_state: ScalarMap,
    #[serde(default)]
    pub recommended_runbook_id: Option<String>,
    #[serde(default)]
    pub hipaa_controls: Vec<String>,
}

/// One step the self-healer actually performed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionStep {
    pub step_index: u32,
    pub action_name: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    pub duration_sec: f64,
    pub result_summary: String,
}

/// Classification of a runbook, looked up from the local whitelist.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunbookClass {
    Disruptive,
    NonDisruptive,
}

/// A locally whitelisted remediation recipe. The control plane only ever
/// names a `runbook_id`; the steps themselves live on the appliance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunbookSpec {
    pub runbook_id: String,
    pub class: RunbookClass,
    pub steps: Vec<RunbookStep>,
    /// True if a step in this runbook triggers a declarative rebuild and
    /// must be health-checked/rolled back.
    #[serde(default)]
    pub involves_rebuild: bool,
}

/// One declared step of a [`RunbookSpec`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunbookStep {
    pub action_name: String,
    pub argv: Vec<String>,
    #[serde(default)]
    pub optional: bool,
    /// If set, run this step against a Windows target instead of locally.
    #[serde(default)]
    pub target_role: Option<String>,
}

/// Deployment mode affects whether reseller-mode sinks are used.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentMode {
    Reseller,
    Direct,
}

/// The central audit artifact produced for every observable action.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvidenceBundle {
    pub bundle_id: String,
    pub site_id: String,
    pub host_id: String,
    pub deployment_mode: DeploymentMode,
    #[serde(default)]
    pub reseller_id: Option<String>,
    pub timestamp_start: DateTime<Utc>,
    pub timestamp_end: DateTime<Utc>,
    pub policy_version: String,
    #[serde(default)]
    pub ruleset_hash: Option<String>,
    #[serde(default)]
    pub nixos_revision: Option<String>,
    #[serde(default)]
    pub derivation_digest: Option<String>,
    #[serde(default)]
    pub ntp_offset_ms: Option<i64>,
    pub check: CheckKind,
    #[serde(default)]
    pub hipaa_controls: Vec<String>,
    pub pre_state: ScalarMap,
    #[serde(default)]
    pub post_state: Option<ScalarMap>,
    #[serde(default)]
    pub action_taken: Vec<ActionStep>,
    pub rollback_available: bool,
    #[serde(default)]
    pub rollback_generation: Option<String>,
    pub outcome: Outcome,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub order_id: Option<String>,
    #[serde(default)]
    pub runbook_id: Option<String>,
}

impl EvidenceBundle {
    /// Generate a fresh globally-unique bundle id.
    #[must_use]
    pub fn new_bundle_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Invariant: `post_state` is present iff the outcome demands it.
    #[must_use]
    pub fn post_state_invariant_holds(&self) -> bool {
        self.post_state.is_some() == self.outcome.carries_post_state()
    }
}

/// One entry in the tiered orchestrator's execution telemetry stream, used
/// by the learning loop to decide when an L2 pattern graduates to L1.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionTelemetry {
    pub incident_id: String,
    pub runbook_id_internal: String,
    pub incident_type: String,
    pub site_id: String,
    pub host_id: String,
    pub resolution_tier: ResolutionTier,
    pub success: bool,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Which orchestrator tier resolved an incident.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolutionTier {
    L1,
    L2,
    L3,
}

/// An incident fed into the tiered orchestrator: either a drift finding or
/// a validated order.
#[derive(Clone, Debug)]
pub struct Incident {
    pub incident_id: String,
    pub incident_type: String,
    pub signature: String,
    pub recommended_runbook_id: Option<String>,
    pub triggering_order: Option<Order>,
    pub params: ScalarMap,
}
