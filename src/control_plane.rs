//! mTLS HTTPS client for the managed-care control plane.
//!
//! Talks to the configured `mcp_url` over TLS 1.2+ with a client
//! certificate, using `ureq` layered on `rustls` rather than reaching for
//! an async HTTP stack: the agent's entire I/O surface is synchronous,
//! and this client is called from one dedicated thread at a time.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::{ClientConfig, RootCertStore};
use serde::{Deserialize, Serialize};

use crate::error::ControlPlaneError;
use crate::types::{EvidenceBundle, Order, WindowsTarget};

/// Maximum acceptable clock skew between this host and the control
/// plane's reported server time before evidence is considered untrustworthy.
const DEFAULT_MAX_SKEW_MS: i64 = 5_000;

#[derive(Serialize)]
struct CheckInRequest<'a> {
    site_id: &'a str,
    host_id: &'a str,
    policy_version: &'a str,
    agent_time: DateTime<Utc>,
}

#[derive(Deserialize)]
struct CheckInResponse {
    server_time: DateTime<Utc>,
    #[serde(default)]
    orders: Vec<Order>,
    #[serde(default)]
    policy_version: Option<String>,
}

#[derive(Deserialize, Default)]
pub struct CheckInResult {
    pub orders: Vec<Order>,
    pub server_time: DateTime<Utc>,
    pub offset_ms: i64,
    pub updated_policy_version: Option<String>,
}

pub struct ControlPlaneClient {
    agent: ureq::Agent,
    base_url: String,
    max_skew_ms: i64,
}

impl ControlPlaneClient {
    pub fn new(
        base_url: String,
        client_cert_path: &Path,
        client_key_path: &Path,
    ) -> Result<Self, ControlPlaneError> {
        let tls_config = build_client_tls_config(client_cert_path, client_key_path)?;
        let agent = ureq::AgentBuilder::new()
            .tls_config(Arc::new(tls_config))
            .timeout_connect(Duration::from_secs(10))
            .timeout_read(Duration::from_secs(30))
            .build();

        Ok(Self {
            agent,
            base_url,
            max_skew_ms: DEFAULT_MAX_SKEW_MS,
        })
    }

    /// Check in, exchanging our policy version for any pending orders and
    /// validating the server's clock against ours.
    pub fn check_in(
        &self,
        site_id: &str,
        host_id: &str,
        policy_version: &str,
        now: DateTime<Utc>,
    ) -> Result<CheckInResult, ControlPlaneError> {
        let req = CheckInRequest {
            site_id,
            host_id,
            policy_version,
            agent_time: now,
        };

        let url = format!("{}/v1/check-in", self.base_url);
        let response = self
            .agent
            .post(&url)
            .send_json(&req)
            .map_err(map_ureq_error)?;
        let body: CheckInResponse = response.into_json()?;

        let offset_ms = (body.server_time - now).num_milliseconds();
        if offset_ms.abs() > self.max_skew_ms {
            return Err(ControlPlaneError::ClockSkew { offset_ms });
        }

        Ok(CheckInResult {
            orders: body.orders,
            server_time: body.server_time,
            offset_ms,
            updated_policy_version: body.policy_version,
        })
    }

    /// Upload one evidence bundle.
    pub fn upload_evidence(&self, bundle: &EvidenceBundle) -> Result<(), ControlPlaneError> {
        let url = format!("{}/v1/evidence", self.base_url);
        self.agent
            .post(&url)
            .send_json(bundle)
            .map_err(map_ureq_error)?;
        Ok(())
    }

    /// Fetch fresh, time-bounded Windows target credentials for this cycle.
    pub fn fetch_windows_targets(
        &self,
        host_id: &str,
    ) -> Result<Vec<WindowsTarget>, ControlPlaneError> {
        let url = format!("{}/v1/targets/{host_id}", self.base_url);
        let response = self.agent.get(&url).call().map_err(map_ureq_error)?;
        let targets: Vec<WindowsTarget> = response.into_json()?;
        Ok(targets)
    }

    /// Fetch the current allowed-host egress list.
    pub fn refresh_egress_ips(&self, host_id: &str) -> Result<Vec<String>, ControlPlaneError> {
        let url = format!("{}/v1/egress/{host_id}", self.base_url);
        let response = self.agent.get(&url).call().map_err(map_ureq_error)?;
        let hosts: Vec<String> = response.into_json()?;
        Ok(hosts)
    }

    /// Fetch the set of currently whitelisted runbook ids and their
    /// classification. The steps themselves are never transmitted; they
    /// are looked up from the appliance's own local runbook definitions.
    pub fn list_whitelisted_runbooks(
        &self,
        site_id: &str,
    ) -> Result<Vec<RunbookClassification>, ControlPlaneError> {
        let url = format!("{}/api/sites/{site_id}/runbooks", self.base_url);
        let response = self.agent.get(&url).call().map_err(map_ureq_error)?;
        let list: Vec<RunbookClassification> = response.into_json()?;
        Ok(list)
    }
}

#[derive(Deserialize)]
pub struct RunbookClassification {
    pub runbook_id: String,
    pub class: crate::types::RunbookClass,
}

/// Subject and validity window pulled from the configured client
/// certificate, for the `doctor` CLI command to flag an expiring
/// identity before it locks the appliance out of the control plane.
pub struct ClientCertInfo {
    pub subject: String,
    pub not_after: DateTime<Utc>,
}

pub fn inspect_client_cert(cert_path: &Path) -> Result<ClientCertInfo, ControlPlaneError> {
    let certs = load_certs(cert_path)?;
    let leaf = certs
        .first()
        .ok_or_else(|| ControlPlaneError::Transient("client cert file is empty".into()))?;

    let (_, parsed) = x509_parser::parse_x509_certificate(leaf.as_ref())
        .map_err(|e| ControlPlaneError::Transient(format!("parsing client cert: {e}")))?;

    let not_after = parsed.validity().not_after;
    let not_after_utc = Utc
        .timestamp_opt(not_after.timestamp(), 0)
        .single()
        .ok_or_else(|| ControlPlaneError::Transient("invalid cert not_after timestamp".into()))?;

    Ok(ClientCertInfo {
        subject: parsed.subject().to_string(),
        not_after: not_after_utc,
    })
}

fn map_ureq_error(err: ureq::Error) -> ControlPlaneError {
    match err {
        ureq::Error::Status(status, _) if (400..500).contains(&status) => {
            ControlPlaneError::Permanent { status }
        }
        ureq::Error::Status(status, _) => ControlPlaneError::Transient(format!(
            "control plane returned HTTP {status}"
        )),
        ureq::Error::Transport(t) => ControlPlaneError::Transient(t.to_string()),
    }
}

fn build_client_tls_config(
    cert_path: &Path,
    key_path: &Path,
) -> Result<ClientConfig, ControlPlaneError> {
    let mut root_store = RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().map_err(|e| {
        ControlPlaneError::Transient(format!("loading native root store: {e}"))
    })? {
        let _ = root_store.add(cert);
    }

    let cert_chain = load_certs(cert_path)?;
    let private_key = load_private_key(key_path)?;

    ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_client_auth_cert(cert_chain, private_key)
        .map_err(|e| ControlPlaneError::Transient(format!("invalid client cert/key: {e}")))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ControlPlaneError> {
    let bytes = std::fs::read(path)
        .map_err(|e| ControlPlaneError::Transient(format!("reading {}: {e}", path.display())))?;
    let mut reader = std::io::Cursor::new(bytes);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ControlPlaneError::Transient(format!("parsing client cert: {e}")))
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, ControlPlaneError> {
    let bytes = std::fs::read(path)
        .map_err(|e| ControlPlaneError::Transient(format!("reading {}: {e}", path.display())))?;
    let mut reader = std::io::Cursor::new(bytes);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ControlPlaneError::Transient(format!("parsing client key: {e}")))?
        .ok_or_else(|| ControlPlaneError::Transient("no private key found in key file".into()))
}

/// Validate a freshly received [`Order`] against TTL, order-id replay, and
/// (indirectly, via the caller's runbook whitelist lookup) allowed
/// operations. `order_ttl_sec` is the configured upper bound on a
/// declared `ttl_sec`; orders declaring a longer TTL than the agent allows
/// are rejected as expired rather than honored. Replay detection is the
/// caller's responsibility via an applied-order-id set persisted at
/// `orders_seen_path`.
pub fn validate_order(
    order: &Order,
    now: DateTime<Utc>,
    order_ttl_sec: u64,
    seen_order_ids: &std::collections::HashSet<String>,
) -> Result<(), OrderValidationError> {
    let age = now.signed_duration_since(order.issued_at);
    if age.num_seconds() < 0 {
        return Err(OrderValidationError::IssuedInFuture);
    }
    if order.ttl_sec > order_ttl_sec {
        return Err(OrderValidationError::Expired);
    }
    if age.num_seconds() as u64 >= order.ttl_sec {
        return Err(OrderValidationError::Expired);
    }
    if seen_order_ids.contains(&order.order_id) {
        return Err(OrderValidationError::ReplayedOrderId);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OrderValidationError {
    #[error("order TTL has elapsed")]
    Expired,
    #[error("order issued_at is in the future relative to agent clock")]
    IssuedInFuture,
    #[error("order id has already been applied")]
    ReplayedOrderId,
}
