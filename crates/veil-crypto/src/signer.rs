//! Principal signers
//!
//! A `Signer` stands for whatever holds the principal's identity: a local
//! Ed25519 seed file, a hardware token, or a wallet that prompts a human. It
//! is asked for two things: the key derivation challenge (see `custody`) and
//! the ledger registration payload. Any signer may decline, which surfaces as
//! `RejectedBySigner`.

use std::path::Path;

use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;
use veil_core::{VeilError, VeilResult};
use zeroize::Zeroize;

#[async_trait]
pub trait Signer: Send + Sync {
    /// Stable identity of the principal (ledger owner / grantee name).
    fn principal(&self) -> &str;

    /// Sign `message`. Must be deterministic for the key derivation
    /// challenge, otherwise the derived keypair changes between sessions.
    async fn sign(&self, message: &[u8]) -> VeilResult<Vec<u8>>;
}

/// A signer backed by a local Ed25519 seed.
pub struct Ed25519Signer {
    principal: String,
    key: SigningKey,
}

impl Ed25519Signer {
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng), None)
    }

    pub fn from_seed(seed: [u8; 32], principal: Option<String>) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(&seed), principal)
    }

    fn from_signing_key(key: SigningKey, principal: Option<String>) -> Self {
        let principal = principal.unwrap_or_else(|| hex::encode(key.verifying_key().as_bytes()));
        Self { principal, key }
    }

    /// Parse a hex-encoded 32-byte seed.
    pub fn from_hex_seed(seed_hex: &SecretString, principal: Option<String>) -> VeilResult<Self> {
        let mut bytes = hex::decode(seed_hex.expose_secret().trim())
            .map_err(|_| VeilError::KeyUnavailable("identity seed is not valid hex".into()))?;
        if bytes.len() != 32 {
            let len = bytes.len();
            bytes.zeroize();
            return Err(VeilError::KeyUnavailable(format!(
                "identity seed must be 32 bytes, got {len}"
            )));
        }
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&bytes);
        bytes.zeroize();
        let signer = Self::from_seed(seed, principal);
        seed.zeroize();
        Ok(signer)
    }

    /// Load a seed file written by [`Ed25519Signer::save`].
    pub fn load(path: &Path, principal: Option<String>) -> VeilResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            VeilError::KeyUnavailable(format!("reading identity {}: {e}", path.display()))
        })?;
        debug!(path = %path.display(), "loaded identity seed");
        Self::from_hex_seed(&SecretString::from(text), principal)
    }

    /// Write the seed as hex, readable by the owner only.
    pub fn save(&self, path: &Path) -> VeilResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut seed_hex = hex::encode(self.key.to_bytes());
        let result = write_private(path, seed_hex.as_bytes());
        seed_hex.zeroize();
        result
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    /// Check a signature produced by this signer.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        match Signature::from_slice(signature) {
            Ok(sig) => self.key.verifying_key().verify(message, &sig).is_ok(),
            Err(_) => false,
        }
    }
}

impl std::fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("principal", &self.principal)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl Signer for Ed25519Signer {
    fn principal(&self) -> &str {
        &self.principal
    }

    async fn sign(&self, message: &[u8]) -> VeilResult<Vec<u8>> {
        Ok(self.key.sign(message).to_bytes().to_vec())
    }
}

#[cfg(unix)]
fn write_private(path: &Path, bytes: &[u8]) -> VeilResult<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, bytes: &[u8]) -> VeilResult<()> {
    std::fs::write(path, bytes)?;
    Ok(())
}
