//! Ed25519 signing and SHA-256 hashing for evidence bundles.
//!
//! Loading the private key fails loudly if the file permits group/other
//! read; no key material is ever logged or included in an error message.

use std::fs;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::SignerError;

/// Ed25519 signature length, in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// Holds the appliance's Ed25519 signing key in memory.
///
/// The raw key material is wrapped in [`Zeroizing`] so it is wiped on drop.
pub struct Signer {
    signing_key: SigningKey,
}

impl Signer {
    /// Load a 32-byte raw Ed25519 seed from `path`.
    ///
    /// The file must be readable only by its owner; group/other
    /// permissions cause [`SignerError::InsecurePermissions`].
    pub fn load_from_file(path: &Path) -> Result<Self, SignerError> {
        check_private_key_permissions(path)?;

        let bytes = fs::read(path).map_err(|source| SignerError::KeyUnreadable {
            path: path.to_path_buf(),
            source,
        })?;
        let bytes = Zeroizing::new(bytes);

        if bytes.len() != 32 {
            return Err(SignerError::KeyMalformed {
                path: path.to_path_buf(),
                reason: format!("expected 32-byte seed, found {} bytes", bytes.len()),
            });
        }
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&bytes);
        let signing_key = SigningKey::from_bytes(&seed);

        Ok(Self { signing_key })
    }

    /// Sign `bytes`, returning the raw 64-byte Ed25519 signature.
    #[must_use]
    pub fn sign(&self, bytes: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing_key.sign(bytes).to_bytes()
    }

    /// This signer's public key, safe to publish/log.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

/// Verify a detached signature against the given public key.
///
/// Constant-time by virtue of `ed25519-dalek`'s `Verifier` implementation.
pub fn verify(bytes: &[u8], signature: &[u8; SIGNATURE_LEN], public_key: &VerifyingKey) -> bool {
    match Signature::from_slice(signature) {
        Ok(sig) => public_key.verify(bytes, &sig).is_ok(),
        Err(_) => false,
    }
}

/// Lower-case hex SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// SHA-256 digest of a file's contents, by path.
pub fn sha256_file(path: &Path) -> std::io::Result<String> {
    let contents = fs::read(path)?;
    Ok(sha256_hex(&contents))
}

#[cfg(unix)]
fn check_private_key_permissions(path: &Path) -> Result<(), SignerError> {
    let meta = fs::metadata(path).map_err(|source| SignerError::KeyUnreadable {
        path: path.to_path_buf(),
        source,
    })?;
    let mode = meta.permissions().mode();
    if mode & 0o077 != 0 {
        return Err(SignerError::InsecurePermissions {
            path: path.to_path_buf(),
        });
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_private_key_permissions(_path: &Path) -> Result<(), SignerError> {
    Ok(())
}

/// Write a freshly generated seed to `path` with `0600` permissions,
/// for provisioning tooling / tests. Not used on the hot path.
pub fn generate_key_file(path: &Path) -> std::io::Result<()> {
    use rand_core::{OsRng, RngCore};
    let mut seed = Zeroizing::new([0u8; 32]);
    OsRng.fill_bytes(&mut *seed);
    fs::write(path, &*seed)?;
    set_owner_only_permissions(path)?;
    Ok(())
}

#[cfg(unix)]
fn set_owner_only_permissions(path: &Path) -> std::io::Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_owner_only_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Convenience: path used purely for error-message formatting in callers
/// that resolve a signing key file from configuration.
#[must_use]
pub fn describe_key_path(path: &Path) -> PathBuf {
    path.to_path_buf()
}

/// Load a raw 32-byte Ed25519 public key from `path`, for the
/// `verify-bundle` CLI command run against a host that does not hold the
/// private key.
pub fn load_verifying_key_file(path: &Path) -> Result<VerifyingKey, SignerError> {
    let bytes = fs::read(path).map_err(|source| SignerError::KeyUnreadable {
        path: path.to_path_buf(),
        source,
    })?;
    if bytes.len() != 32 {
        return Err(SignerError::KeyMalformed {
            path: path.to_path_buf(),
            reason: format!("expected 32-byte public key, found {} bytes", bytes.len()),
        });
    }
    let mut raw = [0u8; 32];
    raw.copy_from_slice(&bytes);
    VerifyingKey::from_bytes(&raw).map_err(|_| SignerError::KeyMalformed {
        path: path.to_path_buf(),
        reason: "not a valid Ed25519 public key".to_string(),
    })
}
