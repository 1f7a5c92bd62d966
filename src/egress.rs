//! Egress allowlist refresher.
//!
//! Resolves the configured `allowed_hosts` to IP addresses and hands the
//! resolved set to [`FirewallSink`] for an atomic replace. Resolution
//! failures are fail-closed: if every host fails to resolve, the previous
//! set is kept rather than collapsing the firewall to an empty allowlist.

use std::collections::BTreeSet;
use std::net::IpAddr;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::Resolver;
use tracing::{info, warn};

use crate::error::ControlPlaneError;

/// Destination for a freshly resolved allowlist. The supervisor wires this
/// to whatever local firewall mechanism the appliance image uses; kept as
/// a trait so tests can substitute an in-memory sink.
pub trait FirewallSink {
    fn replace_allowed_ips(&self, ips: &BTreeSet<IpAddr>) -> std::io::Result<()>;
}

/// A [`FirewallSink`] that records the last applied set, for tests and for
/// `doctor` introspection.
#[derive(Default)]
pub struct RecordingSink {
    pub applied: parking_lot::Mutex<Option<BTreeSet<IpAddr>>>,
}

impl FirewallSink for RecordingSink {
    fn replace_allowed_ips(&self, ips: &BTreeSet<IpAddr>) -> std::io::Result<()> {
        *self.applied.lock() = Some(ips.clone());
        Ok(())
    }
}

pub struct EgressRefresher {
    resolver: Resolver,
    allowed_hosts: Vec<String>,
}

impl EgressRefresher {
    pub fn new(allowed_hosts: Vec<String>) -> Result<Self, ControlPlaneError> {
        let resolver = Resolver::new(ResolverConfig::default(), ResolverOpts::default())
            .map_err(|e| ControlPlaneError::Transient(e.to_string()))?;
        Ok(Self {
            resolver,
            allowed_hosts,
        })
    }

    /// Resolve every configured host and apply the union of resolved
    /// addresses to `sink`. Returns the number of hosts that resolved.
    ///
    /// If zero hosts resolve, the sink is left untouched (fail-closed: keep
    /// the last-known-good set rather than open or block everything).
    pub fn refresh(&self, sink: &dyn FirewallSink) -> Result<usize, ControlPlaneError> {
        let mut ips = BTreeSet::new();
        let mut resolved_hosts = 0usize;

        for host in &self.allowed_hosts {
            match self.resolver.lookup_ip(host.as_str()) {
                Ok(response) => {
                    let mut any = false;
                    for ip in response.iter() {
                        ips.insert(ip);
                        any = true;
                    }
                    if any {
                        resolved_hosts += 1;
                    }
                }
                Err(e) => {
                    warn!(host = %host, error = %e, "egress host failed to resolve");
                }
            }
        }

        if resolved_hosts == 0 && !self.allowed_hosts.is_empty() {
            warn!("all egress hosts failed to resolve; keeping previous allowlist");
            return Ok(0);
        }

        sink.replace_allowed_ips(&ips)
            .map_err(|e| ControlPlaneError::Transient(e.to_string()))?;
        info!(
            resolved_hosts,
            total_hosts = self.allowed_hosts.len(),
            ip_count = ips.len(),
            "egress allowlist refreshed"
        );
        Ok(resolved_hosts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_host_list_is_a_noop_refresh() {
        let refresher = EgressRefresher::new(vec![]).unwrap();
        let sink = RecordingSink::default();
        let resolved = refresher.refresh(&sink).unwrap();
        assert_eq!(resolved, 0);
    }

    #[test]
    fn recording_sink_captures_applied_set() {
        let sink = RecordingSink::default();
        let mut ips = BTreeSet::new();
        ips.insert("127.0.0.1".parse::<IpAddr>().unwrap());
        sink.replace_allowed_ips(&ips).unwrap();
        assert_eq!(sink.applied.lock().as_ref(), Some(&ips));
    }
}
