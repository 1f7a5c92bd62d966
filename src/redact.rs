//! Deny-pattern PHI scrubbing applied before any bundle is serialized.
//!
//! The agent never intentionally handles patient-identifying payloads;
//! this is a defense-in-depth filter over string fields that might
//! accidentally carry a token resembling one.

use std::sync::OnceLock;

use regex::Regex;

use crate::types::{Scalar, ScalarMap};

const REDACTED: &str = "<redacted>";

fn patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            // SSN-like: NNN-NN-NNNN
            Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap(),
            // MRN-like: MRN followed by 6-10 digits
            Regex::new(r"(?i)\bMRN[:#\s-]*\d{6,10}\b").unwrap(),
            // DOB-like: MM/DD/YYYY or YYYY-MM-DD
            Regex::new(r"\b\d{1,2}/\d{1,2}/\d{4}\b").unwrap(),
            Regex::new(r"\b\d{4}-\d{2}-\d{2}\b").unwrap(),
        ]
    })
}

/// Replace any substring matching the PHI deny-pattern set with
/// `<redacted>`.
#[must_use]
pub fn scrub_string(input: &str) -> String {
    let mut out = input.to_string();
    for pattern in patterns() {
        out = pattern.replace_all(&out, REDACTED).into_owned();
    }
    out
}

/// Recursively scrub every string-valued entry of a [`ScalarMap`].
#[must_use]
pub fn scrub_map(map: &ScalarMap) -> ScalarMap {
    map.iter()
        .map(|(k, v)| {
            let scrubbed = match v {
                Scalar::Str(s) => Scalar::Str(scrub_string(s)),
                other => other.clone(),
            };
            (k.clone(), scrubbed)
        })
        .collect()
}

/// Whether `input` still contains a PHI-deny-pattern match (used by the
/// no-PHI invariant check in tests).
#[must_use]
pub fn contains_phi_pattern(input: &str) -> bool {
    patterns().iter().any(|p| p.is_match(input))
}
