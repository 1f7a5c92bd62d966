//! On-disk evidence bundle store.
//!
//! Bundles are written under `<root>/YYYY/MM/DD/<bundle_id>/bundle.json`,
//! canonically serialized (sorted keys, no insignificant whitespace) so the
//! signed bytes are reproducible, with an optional detached `bundle.sig`
//! next to it. One file per bundle, so each can be signed and verified
//! independently of the rest of the store.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Utc};
use serde_json::Value;

use crate::error::EvidenceError;
use crate::redact::scrub_string;
use crate::signer::{self, Signer};
use crate::types::{CheckKind, EvidenceBundle, Outcome};

/// Filter applied by [`EvidenceStore::list`].
#[derive(Clone, Debug, Default)]
pub struct ListFilter {
    pub check: Option<CheckKind>,
    pub outcome: Option<Outcome>,
    pub since: Option<DateTime<Utc>>,
}

/// Aggregate counters returned by [`EvidenceStore::stats`].
#[derive(Clone, Debug, Default)]
pub struct EvidenceStats {
    pub total: usize,
    pub by_outcome: BTreeMap<String, usize>,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

pub struct EvidenceStore {
    root: PathBuf,
}

impl EvidenceStore {
    pub fn open(root: &Path) -> Result<Self, EvidenceError> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Scrub any string field that might carry an accidental PHI-like
    /// token before the bundle is ever persisted or transmitted.
    #[must_use]
    pub fn create(&self, mut bundle: EvidenceBundle) -> EvidenceBundle {
        for (_, v) in bundle.pre_state.iter_mut() {
            if let crate::types::Scalar::Str(s) = v {
                *s = scrub_string(s);
            }
        }
        if let Some(post) = bundle.post_state.as_mut() {
            for (_, v) in post.iter_mut() {
                if let crate::types::Scalar::Str(s) = v {
                    *s = scrub_string(s);
                }
            }
        }
        if let Some(err) = bundle.error.as_mut() {
            *err = scrub_string(err);
        }
        for step in &mut bundle.action_taken {
            step.result_summary = scrub_string(&step.result_summary);
        }
        bundle
    }

    /// Persist `bundle` under its timestamp-sharded directory, optionally
    /// producing a detached Ed25519 signature over the canonical bytes.
    pub fn store(
        &self,
        bundle: &EvidenceBundle,
        signer: Option<&Signer>,
    ) -> Result<PathBuf, EvidenceError> {
        debug_assert!(
            bundle.post_state_invariant_holds(),
            "post_state invariant violated for bundle {}",
            bundle.bundle_id
        );

        let dir = self.bundle_dir(bundle.timestamp_start, &bundle.bundle_id);
        fs::create_dir_all(&dir)?;

        let canonical = canonical_json(bundle)?;
        let bundle_path = dir.join("bundle.json");
        write_atomic(&bundle_path, canonical.as_bytes())?;

        if let Some(signer) = signer {
            let sig = signer.sign(canonical.as_bytes());
            let sig_path = dir.join("bundle.sig");
            write_atomic(&sig_path, hex::encode(sig).as_bytes())?;
        }

        Ok(bundle_path)
    }

    /// Load a bundle by id, searching the date-sharded tree.
    pub fn load(&self, bundle_id: &str) -> Result<EvidenceBundle, EvidenceError> {
        let path = self.find_bundle_path(bundle_id)?;
        let bytes = fs::read(&path)?;
        let bundle: EvidenceBundle = serde_json::from_slice(&bytes)?;
        Ok(bundle)
    }

    /// Verify a stored bundle's detached signature, if present.
    pub fn verify(
        &self,
        bundle_id: &str,
        public_key: &ed25519_dalek::VerifyingKey,
    ) -> Result<bool, EvidenceError> {
        let bundle_path = self.find_bundle_path(bundle_id)?;
        let sig_path = bundle_path.with_file_name("bundle.sig");
        if !sig_path.exists() {
            return Ok(false);
        }
        let canonical = fs::read(&bundle_path)?;
        let sig_hex = fs::read_to_string(&sig_path)?;
        let sig_bytes = hex::decode(sig_hex.trim())
            .map_err(|_| EvidenceError::SignatureMismatch {
                bundle_id: bundle_id.to_string(),
            })?;
        if sig_bytes.len() != signer::SIGNATURE_LEN {
            return Err(EvidenceError::SignatureMismatch {
                bundle_id: bundle_id.to_string(),
            });
        }
        let mut sig = [0u8; signer::SIGNATURE_LEN];
        sig.copy_from_slice(&sig_bytes);
        Ok(signer::verify(&canonical, &sig, public_key))
    }

    /// List bundle ids matching `filter`, newest first.
    pub fn list(&self, filter: &ListFilter) -> Result<Vec<EvidenceBundle>, EvidenceError> {
        let mut out = Vec::new();
        for path in self.walk_bundle_files()? {
            let bytes = fs::read(&path)?;
            let bundle: EvidenceBundle = match serde_json::from_slice(&bytes) {
                Ok(b) => b,
                Err(_) => continue,
            };
            if let Some(check) = filter.check {
                if bundle.check != check {
                    continue;
                }
            }
            if let Some(outcome) = filter.outcome {
                if bundle.outcome != outcome {
                    continue;
                }
            }
            if let Some(since) = filter.since {
                if bundle.timestamp_start < since {
                    continue;
                }
            }
            out.push(bundle);
        }
        out.sort_by(|a, b| b.timestamp_start.cmp(&a.timestamp_start));
        Ok(out)
    }

    /// Delete old bundles that are both beyond `retention_count` (by
    /// recency rank) and older than `retention_days`, always keeping the
    /// most recent `success` bundle per check kind regardless of age. A
    /// bundle past one threshold but not the other is kept: the retention
    /// floor is `retention_count` bundles, however old they are.
    pub fn prune(
        &self,
        retention_count: usize,
        retention_days: i64,
        now: DateTime<Utc>,
    ) -> Result<usize, EvidenceError> {
        let mut all = self.list(&ListFilter::default())?;
        all.sort_by(|a, b| b.timestamp_start.cmp(&a.timestamp_start));

        let mut most_recent_success: BTreeMap<CheckKind, String> = BTreeMap::new();
        for bundle in &all {
            if bundle.outcome == Outcome::Success {
                most_recent_success
                    .entry(bundle.check)
                    .or_insert_with(|| bundle.bundle_id.clone());
            }
        }

        let cutoff = now - chrono::Duration::days(retention_days);
        let mut removed = 0usize;

        for (idx, bundle) in all.iter().enumerate() {
            let protected = most_recent_success
                .get(&bundle.check)
                .is_some_and(|id| id == &bundle.bundle_id);
            if protected {
                continue;
            }
            let over_count = idx >= retention_count;
            let over_age = bundle.timestamp_start < cutoff;
            if over_count && over_age {
                let dir = self.bundle_dir(bundle.timestamp_start, &bundle.bundle_id);
                if dir.exists() {
                    fs::remove_dir_all(&dir)?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    /// Aggregate counts over the whole store, for the `doctor` CLI command.
    pub fn stats(&self) -> Result<EvidenceStats, EvidenceError> {
        let bundles = self.list(&ListFilter::default())?;
        let mut stats = EvidenceStats {
            total: bundles.len(),
            ..Default::default()
        };
        for bundle in &bundles {
            *stats
                .by_outcome
                .entry(format!("{:?}", bundle.outcome).to_lowercase())
                .or_insert(0) += 1;
            stats.oldest = Some(stats.oldest.map_or(bundle.timestamp_start, |o| {
                o.min(bundle.timestamp_start)
            }));
            stats.newest = Some(stats.newest.map_or(bundle.timestamp_start, |n| {
                n.max(bundle.timestamp_start)
            }));
        }
        Ok(stats)
    }

    fn bundle_dir(&self, ts: DateTime<Utc>, bundle_id: &str) -> PathBuf {
        self.root
            .join(format!("{:04}", ts.year()))
            .join(format!("{:02}", ts.month()))
            .join(format!("{:02}", ts.day()))
            .join(bundle_id)
    }

    fn find_bundle_path(&self, bundle_id: &str) -> Result<PathBuf, EvidenceError> {
        for path in self.walk_bundle_files()? {
            if path
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|n| n.to_str())
                == Some(bundle_id)
            {
                return Ok(path);
            }
        }
        Err(EvidenceError::BundleNotFound {
            bundle_id: bundle_id.to_string(),
        })
    }

    fn walk_bundle_files(&self) -> Result<Vec<PathBuf>, EvidenceError> {
        let mut out = Vec::new();
        walk_dir(&self.root, &mut out)?;
        Ok(out)
    }
}

fn walk_dir(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), EvidenceError> {
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            walk_dir(&path, out)?;
        } else if path.file_name().and_then(|n| n.to_str()) == Some("bundle.json") {
            out.push(path);
        }
    }
    Ok(())
}

/// Serialize with sorted object keys so signed bytes are stable across
/// serde_json versions and field-declaration order.
fn canonical_json(bundle: &EvidenceBundle) -> Result<String, EvidenceError> {
    let value = serde_json::to_value(bundle)?;
    let sorted = sort_value(value);
    Ok(serde_json::to_string(&sorted)?)
}

fn sort_value(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> =
                map.into_iter().map(|(k, v)| (k, sort_value(v))).collect();
            let mut out = serde_json::Map::new();
            for (k, v) in sorted {
                out.insert(k, v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_value).collect()),
        other => other,
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut f = File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DeploymentMode, ScalarMap};
    use tempfile::tempdir;

    fn sample_bundle(check: CheckKind, outcome: Outcome, ts: DateTime<Utc>) -> EvidenceBundle {
        EvidenceBundle {
            bundle_id: EvidenceBundle::new_bundle_id(),
            site_id: "site-1".into(),
            host_id: "host-1".into(),
            deployment_mode: DeploymentMode::Direct,
            reseller_id: None,
            timestamp_start: ts,
            timestamp_end: ts,
            policy_version: "v1".into(),
            ruleset_hash: None,
            nixos_revision: None,
            derivation_digest: None,
            ntp_offset_ms: None,
            check,
            hipaa_controls: vec![],
            pre_state: ScalarMap::new(),
            post_state: if outcome.carries_post_state() {
                Some(ScalarMap::new())
            } else {
                None
            },
            action_taken: vec![],
            rollback_available: false,
            rollback_generation: None,
            outcome,
            error: None,
            order_id: None,
            runbook_id: None,
        }
    }

    #[test]
    fn store_then_load_roundtrips() {
        let dir = tempdir().unwrap();
        let store = EvidenceStore::open(dir.path()).unwrap();
        let bundle = sample_bundle(CheckKind::Patching, Outcome::Success, Utc::now());
        let bundle = store.create(bundle);
        store.store(&bundle, None).unwrap();

        let loaded = store.load(&bundle.bundle_id).unwrap();
        assert_eq!(loaded.bundle_id, bundle.bundle_id);
    }

    #[test]
    fn store_and_verify_signature() {
        let dir = tempdir().unwrap();
        let key_dir = tempdir().unwrap();
        let key_path = key_dir.path().join("signing.key");
        crate::signer::generate_key_file(&key_path).unwrap();
        let signer = Signer::load_from_file(&key_path).unwrap();
        let public_key = signer.verifying_key();

        let store = EvidenceStore::open(dir.path()).unwrap();
        let bundle = sample_bundle(CheckKind::Backup, Outcome::Success, Utc::now());
        store.store(&bundle, Some(&signer)).unwrap();

        assert!(store.verify(&bundle.bundle_id, &public_key).unwrap());
    }

    #[test]
    fn create_scrubs_phi_like_strings() {
        let dir = tempdir().unwrap();
        let store = EvidenceStore::open(dir.path()).unwrap();
        let mut bundle = sample_bundle(CheckKind::Logging, Outcome::Failed, Utc::now());
        bundle.error = Some("failed near ssn 123-45-6789".to_string());
        let scrubbed = store.create(bundle);
        assert!(!crate::redact::contains_phi_pattern(
            scrubbed.error.as_deref().unwrap()
        ));
    }

    #[test]
    fn prune_keeps_most_recent_success_per_check() {
        let dir = tempdir().unwrap();
        let store = EvidenceStore::open(dir.path()).unwrap();
        let now = Utc::now();

        let old_success = sample_bundle(
            CheckKind::Patching,
            Outcome::Success,
            now - chrono::Duration::days(200),
        );
        store.store(&old_success, None).unwrap();

        for i in 0..5 {
            let b = sample_bundle(
                CheckKind::Patching,
                Outcome::Failed,
                now - chrono::Duration::days(i),
            );
            store.store(&b, None).unwrap();
        }

        // Nothing here is both over the count floor (retention_count=200)
        // and over the age cutoff at once, so the retention floor wins and
        // nothing is removed.
        let removed = store.prune(200, 30, now).unwrap();
        assert_eq!(removed, 0);

        // The old success bundle must survive despite being far past the
        // age cutoff, because it is the only success on record.
        assert!(store.load(&old_success.bundle_id).is_ok());
    }

    #[test]
    fn prune_requires_both_over_count_and_over_age() {
        let dir = tempdir().unwrap();
        let store = EvidenceStore::open(dir.path()).unwrap();
        let now = Utc::now();

        // idx0: recent, neither over count nor over age -> kept.
        let recent = sample_bundle(CheckKind::Patching, Outcome::Failed, now);
        store.store(&recent, None).unwrap();

        // idx1: over age (40 > 30) but within the retention_count=2 floor
        // -> kept. Demonstrates the retention floor invariant: a bundle
        // protected by count rank survives regardless of age.
        let old_but_within_floor = sample_bundle(
            CheckKind::Patching,
            Outcome::Failed,
            now - chrono::Duration::days(40),
        );
        store.store(&old_but_within_floor, None).unwrap();

        // idx2, idx3: over both count and age -> removed.
        let old_and_over_count_a = sample_bundle(
            CheckKind::Patching,
            Outcome::Failed,
            now - chrono::Duration::days(50),
        );
        store.store(&old_and_over_count_a, None).unwrap();
        let old_and_over_count_b = sample_bundle(
            CheckKind::Patching,
            Outcome::Failed,
            now - chrono::Duration::days(60),
        );
        store.store(&old_and_over_count_b, None).unwrap();

        let removed = store.prune(2, 30, now).unwrap();
        assert_eq!(removed, 2);
        assert!(store.load(&recent.bundle_id).is_ok());
        assert!(store.load(&old_but_within_floor.bundle_id).is_ok());
        assert!(store.load(&old_and_over_count_a.bundle_id).is_err());
        assert!(store.load(&old_and_over_count_b.bundle_id).is_err());
    }

    #[test]
    fn list_filters_by_outcome() {
        let dir = tempdir().unwrap();
        let store = EvidenceStore::open(dir.path()).unwrap();
        let now = Utc::now();
        store
            .store(&sample_bundle(CheckKind::Firewall, Outcome::Alert, now), None)
            .unwrap();
        store
            .store(
                &sample_bundle(CheckKind::Firewall, Outcome::Success, now),
                None,
            )
            .unwrap();

        let filter = ListFilter {
            outcome: Some(Outcome::Alert),
            ..Default::default()
        };
        let results = store.list(&filter).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].outcome, Outcome::Alert);
    }
}
