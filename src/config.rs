//! Immutable, per-process configuration loaded once at start from the
//! environment and secret files.
//!
//! Never read the environment anywhere else: every component that needs a
//! configuration value takes it explicitly, via [`AgentConfig`] or a field
//! projected out of it.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use crate::error::ConfigError;
use crate::maintenance_window::MaintenanceWindow;
use crate::types::DeploymentMode;

const ENV_PREFIX: &str = "COMPLIANCE_AGENT_";

/// Frozen, validated agent configuration. Constructed once, passed
/// explicitly to every component.
#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub site_id: String,
    pub host_id: String,
    pub deployment_mode: DeploymentMode,
    pub reseller_id: Option<String>,
    pub mcp_url: String,
    pub allowed_hosts: Vec<String>,
    pub client_cert_file: PathBuf,
    pub client_key_file: PathBuf,
    pub signing_key_file: PathBuf,
    pub policy_version: String,
    pub baseline_path: PathBuf,
    pub poll_interval: Duration,
    pub order_ttl: Duration,
    pub maintenance_window: MaintenanceWindow,
    pub maintenance_window_raw: String,
    pub allow_disruptive_outside_window: bool,
    pub evidence_retention_count: usize,
    pub evidence_retention_days: i64,
    pub ntp_max_skew_ms: i64,
    pub rebuild_health_check_timeout: Duration,
    pub rmm_webhook_url: Option<String>,
    pub syslog_target: Option<String>,
    pub log_level: String,
    pub state_dir: PathBuf,
}

impl AgentConfig {
    /// Load and validate configuration from environment variables and
    /// secret files. Fails loudly (exit code 1/2 at the call site) on any
    /// missing required option, bad value, or insecure file permission.
    pub fn load_from_env() -> Result<Self, ConfigError> {
        let site_id = required("SITE_ID")?;
        let host_id = required("HOST_ID")?;

        let deployment_mode = match env_or("DEPLOYMENT_MODE", "direct").as_str() {
            "reseller" => DeploymentMode::Reseller,
            "direct" => DeploymentMode::Direct,
            other => {
                return Err(ConfigError::InvalidValue {
                    option: "deployment_mode",
                    reason: format!("'{other}' is not one of reseller|direct"),
                })
            }
        };
        let reseller_id = env::var(format!("{ENV_PREFIX}RESELLER_ID")).ok();
        if deployment_mode == DeploymentMode::Reseller && reseller_id.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigError::MissingOption {
                option: "reseller_id",
            });
        }

        let mcp_url = required("MCP_URL")?;
        let allowed_hosts = env_or("ALLOWED_HOSTS", "")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>();

        let client_cert_file = required_path("CLIENT_CERT_FILE")?;
        let client_key_file = required_path("CLIENT_KEY_FILE")?;
        let signing_key_file = required_path("SIGNING_KEY_FILE")?;
        check_secret_permissions(&client_cert_file)?;
        check_secret_permissions(&client_key_file)?;
        check_secret_permissions(&signing_key_file)?;

        let policy_version = required("POLICY_VERSION")?;
        let baseline_path = required_path("BASELINE_PATH")?;

        let poll_interval_sec: u64 = parse_or("POLL_INTERVAL_SEC", 60)?;
        let order_ttl_sec: u64 = parse_or("ORDER_TTL_SEC", 900)?;

        let maintenance_window_raw = env_or("MAINTENANCE_WINDOW", "02:00-04:00");
        let maintenance_window = MaintenanceWindow::parse(&maintenance_window_raw)?;

        let allow_disruptive_outside_window: bool =
            parse_or("ALLOW_DISRUPTIVE_OUTSIDE_WINDOW", false)?;
        let evidence_retention_count: usize = parse_or("EVIDENCE_RETENTION_COUNT", 200)?;
        let evidence_retention_days: i64 = parse_or("EVIDENCE_RETENTION_DAYS", 90)?;
        let ntp_max_skew_ms: i64 = parse_or("NTP_MAX_SKEW_MS", 5000)?;
        let rebuild_health_check_timeout_sec: u64 =
            parse_or("REBUILD_HEALTH_CHECK_TIMEOUT_SEC", 60)?;

        let rmm_webhook_url = env::var(format!("{ENV_PREFIX}RMM_WEBHOOK_URL")).ok();
        let syslog_target = env::var(format!("{ENV_PREFIX}SYSLOG_TARGET")).ok();
        let log_level = env_or("LOG_LEVEL", "INFO");

        let state_dir = PathBuf::from(env_or("STATE_DIR", "/var/lib/compliance-agent"));

        Ok(Self {
            site_id,
            host_id,
            deployment_mode,
            reseller_id,
            mcp_url,
            allowed_hosts,
            client_cert_file,
            client_key_file,
            signing_key_file,
            policy_version,
            baseline_path,
            poll_interval: Duration::from_secs(poll_interval_sec),
            order_ttl: Duration::from_secs(order_ttl_sec),
            maintenance_window,
            maintenance_window_raw,
            allow_disruptive_outside_window,
            evidence_retention_count,
            evidence_retention_days,
            ntp_max_skew_ms,
            rebuild_health_check_timeout: Duration::from_secs(rebuild_health_check_timeout_sec),
            rmm_webhook_url,
            syslog_target,
            log_level,
            state_dir,
        })
    }

    #[must_use]
    pub fn order_ttl_sec(&self) -> u64 {
        self.order_ttl.as_secs()
    }

    #[must_use]
    pub fn evidence_dir(&self) -> PathBuf {
        self.state_dir.join("evidence")
    }

    #[must_use]
    pub fn queue_dir(&self) -> PathBuf {
        self.state_dir.join("queue")
    }

    #[must_use]
    pub fn orders_seen_path(&self) -> PathBuf {
        self.state_dir.join("orders_seen.db")
    }

    #[must_use]
    pub fn l1_rules_staged_path(&self) -> PathBuf {
        self.state_dir.join("l1_rules.staged.json")
    }

    #[must_use]
    pub fn run_dir(&self) -> PathBuf {
        self.state_dir.join("run")
    }

    /// Local runbook definitions (id, classification, ordered steps). The
    /// control plane only ever names a `runbook_id`; the steps themselves
    /// live on the appliance.
    #[must_use]
    pub fn runbooks_path(&self) -> PathBuf {
        self.state_dir.join("runbooks.toml")
    }
}

fn env_name(option: &str) -> String {
    format!("{ENV_PREFIX}{option}")
}

fn required(option: &'static str) -> Result<String, ConfigError> {
    env::var(env_name(option)).map_err(|_| ConfigError::MissingOption { option })
}

fn required_path(option: &'static str) -> Result<PathBuf, ConfigError> {
    required(option).map(PathBuf::from)
}

fn env_or(option: &str, default: &str) -> String {
    env::var(env_name(option)).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T>(option: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
{
    match env::var(env_name(option)) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
            option,
            reason: format!("could not parse '{raw}'"),
        }),
        Err(_) => Ok(default),
    }
}

#[cfg(unix)]
fn check_secret_permissions(path: &Path) -> Result<(), ConfigError> {
    let meta = fs::metadata(path).map_err(|source| ConfigError::FileUnreadable {
        path: path.to_path_buf(),
        source,
    })?;
    if meta.permissions().mode() & 0o077 != 0 {
        return Err(ConfigError::InsecurePermissions {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_secret_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}
