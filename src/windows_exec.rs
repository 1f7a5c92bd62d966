//! Execution of whitelisted runbook steps against a Windows target.
//!
//! Credentials are fetched fresh each cycle from the control plane and
//! held only in memory (`crate::types::WindowsTarget`); this module
//! refuses to act on a credential older than one poll interval rather
//! than silently reusing a stale secret, and scrubs remote command output
//! through the same PHI deny-pattern filter as local evidence.

use std::time::Duration;

use crate::error::WindowsExecError;
use crate::redact::scrub_string;
use crate::types::{ActionStep, RunbookStep, WindowsTarget};

/// How old a fetched credential may be before a cycle refuses to use it.
const CREDENTIAL_FRESHNESS_LIMIT: Duration = Duration::from_secs(15 * 60);

/// Abstraction over the actual remote execution transport (WinRM or an
/// equivalent), so the state machine and staleness/redaction logic can be
/// tested without a real Windows host.
pub trait RemoteTransport {
    fn run_remote(
        &self,
        target: &WindowsTarget,
        argv: &[String],
        timeout: Duration,
    ) -> Result<RemoteOutput, WindowsExecError>;
}

pub struct RemoteOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_sec: f64,
}

pub struct WindowsExecutor<'a> {
    transport: &'a dyn RemoteTransport,
}

impl<'a> WindowsExecutor<'a> {
    #[must_use]
    pub fn new(transport: &'a dyn RemoteTransport) -> Self {
        Self { transport }
    }

    /// Execute one whitelisted step on `target`, refusing if the
    /// credential is stale for this cycle.
    pub fn execute_on_target(
        &self,
        target: &WindowsTarget,
        step: &RunbookStep,
        step_index: u32,
        timeout: Duration,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<ActionStep, WindowsExecError> {
        let age = now.signed_duration_since(target.fetched_at);
        if age.to_std().unwrap_or(Duration::MAX) > CREDENTIAL_FRESHNESS_LIMIT {
            return Err(WindowsExecError::StaleCredential {
                hostname: target.hostname.clone(),
            });
        }

        let output = self.transport.run_remote(target, &step.argv, timeout)?;

        Ok(ActionStep {
            step_index,
            action_name: step.action_name.clone(),
            command: Some(step.argv.join(" ")),
            exit_code: output.exit_code,
            duration_sec: output.duration_sec,
            result_summary: scrub_string(&summarize(&output)),
        })
    }
}

fn summarize(output: &RemoteOutput) -> String {
    let tail = |s: &str| -> String {
        let lines: Vec<&str> = s.lines().rev().take(5).collect();
        lines.into_iter().rev().collect::<Vec<_>>().join("\n")
    };
    if output.exit_code == Some(0) {
        format!("exit 0; stdout tail: {}", tail(&output.stdout))
    } else {
        format!(
            "exit {:?}; stderr tail: {}",
            output.exit_code,
            tail(&output.stderr)
        )
    }
}
