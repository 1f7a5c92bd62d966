//! Component-level error kinds.
//!
//! Each component returns its own tagged error enum; the supervisor wraps
//! them with `#[from]` rather than stringly-typed context. Panics stay
//! reserved for invariant violations (programmer error), never for
//! expected runtime failure.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("signing key at {path} is unreadable: {source}")]
    KeyUnreadable { path: PathBuf, source: io::Error },
    #[error("signing key at {path} permits group/other access")]
    InsecurePermissions { path: PathBuf },
    #[error("signing key at {path} is malformed: {reason}")]
    KeyMalformed { path: PathBuf, reason: String },
    #[error("signature does not verify against the configured public key")]
    SignatureInvalid,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn {argv0}: {source}")]
    SpawnFailed { argv0: String, source: io::Error },
    #[error("command timed out after {timeout_sec}s")]
    Timeout { timeout_sec: u64 },
}

#[derive(Debug, Error)]
pub enum MaintenanceWindowError {
    #[error("maintenance window '{raw}' is not of the form HH:MM-HH:MM")]
    InvalidFormat { raw: String },
    #[error("maintenance window '{raw}' contains an out-of-range time component")]
    OutOfRange { raw: String },
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("offline queue I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("offline queue entry {id} is corrupt: {reason}")]
    Corrupt { id: u64, reason: String },
    #[error("offline queue serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum EvidenceError {
    #[error("evidence store I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("evidence bundle serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("disk full while writing evidence bundle {bundle_id}")]
    DiskFull { bundle_id: String },
    #[error("signature for bundle {bundle_id} does not match stored bytes")]
    SignatureMismatch { bundle_id: String },
    #[error("bundle {bundle_id} not found")]
    BundleNotFound { bundle_id: String },
    #[error(transparent)]
    Signer(#[from] SignerError),
}

#[derive(Debug, Error)]
pub enum ControlPlaneError {
    #[error("network-transient error contacting control plane: {0}")]
    Transient(String),
    #[error("control plane returned a permanent error: HTTP {status}")]
    Permanent { status: u16 },
    #[error("control plane response failed NTP skew validation: offset {offset_ms}ms")]
    ClockSkew { offset_ms: i64 },
    #[error("serialization error talking to control plane: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum WindowsExecError {
    #[error("credential for target {hostname} is stale for this cycle")]
    StaleCredential { hostname: String },
    #[error("remote execution on {hostname} failed: {reason}")]
    RemoteFailure { hostname: String, reason: String },
    #[error("remote execution on {hostname} timed out after {timeout_sec}s")]
    Timeout { hostname: String, timeout_sec: u64 },
}

#[derive(Debug, Error)]
pub enum DriftError {
    #[error("check {check} could not be run: {reason}")]
    ToolUnavailable { check: String, reason: String },
}

#[derive(Debug, Error)]
pub enum HealerError {
    #[error("unknown runbook id {runbook_id}")]
    UnknownRunbook { runbook_id: String },
    #[error("step {step_index} ({action_name}) failed: {reason}")]
    StepFailed {
        step_index: u32,
        action_name: String,
        reason: String,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration option {option}")]
    MissingOption { option: &'static str },
    #[error("configuration option {option} has an invalid value: {reason}")]
    InvalidValue { option: &'static str, reason: String },
    #[error("{path} is not readable: {source}")]
    FileUnreadable { path: PathBuf, source: io::Error },
    #[error("{path} permits group/other access; must be 0600/0700")]
    InsecurePermissions { path: PathBuf },
    #[error(transparent)]
    MaintenanceWindow(#[from] MaintenanceWindowError),
}

/// Top-level error surfaced to the supervisor / `main`.
///
/// Most component errors are handled locally and turned into an
/// [`crate::types::EvidenceBundle`] with an appropriate
/// [`crate::types::Outcome`]; only unrecoverable filesystem or signing-key
/// failures propagate up to here and cause process exit.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Evidence(#[from] EvidenceError),
    #[error(transparent)]
    Signer(#[from] SignerError),
    #[error("unrecoverable internal error: {0}")]
    Internal(String),
}
