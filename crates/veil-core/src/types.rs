use serde::{Deserialize, Serialize};

use crate::error::{VeilError, VeilResult};

/// Length of a BLAKE3 digest rendered as lowercase hex.
pub const CONTENT_ADDRESS_LEN: usize = 64;

/// Size of an X25519 public key.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Size of the XChaCha20-Poly1305 nonce used when wrapping a file key.
pub const WRAP_NONCE_SIZE: usize = 24;

/// Tamper-evident locator of an immutable blob: lowercase hex BLAKE3 of its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentAddress(String);

impl ContentAddress {
    /// Validate and wrap a hex digest. Uppercase input is rejected rather
    /// than normalised so that one blob has exactly one address.
    pub fn parse(s: &str) -> VeilResult<Self> {
        if s.len() != CONTENT_ADDRESS_LEN
            || !s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(VeilError::Config(format!(
                "malformed content address: {:?}",
                truncate_for_display(s)
            )));
        }
        Ok(Self(s.to_string()))
    }

    /// Address of a raw 32-byte digest.
    pub fn from_digest(digest: [u8; 32]) -> Self {
        use std::fmt::Write;
        let mut hex = String::with_capacity(CONTENT_ADDRESS_LEN);
        for b in digest {
            let _ = write!(hex, "{b:02x}");
        }
        Self(hex)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 hex chars, for log lines.
    pub fn short(&self) -> &str {
        &self.0[..12]
    }
}

impl TryFrom<String> for ContentAddress {
    type Error = VeilError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ContentAddress::parse(&value)
    }
}

impl From<ContentAddress> for String {
    fn from(value: ContentAddress) -> Self {
        value.0
    }
}

impl std::fmt::Display for ContentAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for ContentAddress {
    type Err = VeilError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ContentAddress::parse(s)
    }
}

fn truncate_for_display(s: &str) -> String {
    s.chars().take(80).collect()
}

/// One transmitted ciphertext chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRecord {
    /// Zero-based position within the file
    pub index: u64,
    /// Address of the packed ciphertext (nonce + ciphertext + tag)
    pub content_address: ContentAddress,
    /// Size of the packed ciphertext in bytes
    pub size: u64,
}

/// A file key wrapped under one principal's X25519 public key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncapsulatedKey {
    #[serde(with = "b64_array")]
    pub ephemeral_public_key: [u8; PUBLIC_KEY_SIZE],
    #[serde(with = "b64_array")]
    pub nonce: [u8; WRAP_NONCE_SIZE],
    #[serde(with = "b64_vec")]
    pub ciphertext: Vec<u8>,
}

impl EncapsulatedKey {
    /// Raw layout: `ephemeral_pk(32) || nonce(24) || ciphertext`.
    pub fn to_packed(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(PUBLIC_KEY_SIZE + WRAP_NONCE_SIZE + self.ciphertext.len());
        out.extend_from_slice(&self.ephemeral_public_key);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    pub fn from_packed(packed: &[u8]) -> VeilResult<Self> {
        if packed.len() <= PUBLIC_KEY_SIZE + WRAP_NONCE_SIZE {
            return Err(VeilError::DecapsulationFailure(format!(
                "packed key too short: {} bytes",
                packed.len()
            )));
        }
        let (epk, rest) = packed.split_at(PUBLIC_KEY_SIZE);
        let (nonce, ciphertext) = rest.split_at(WRAP_NONCE_SIZE);

        let mut ephemeral_public_key = [0u8; PUBLIC_KEY_SIZE];
        ephemeral_public_key.copy_from_slice(epk);
        let mut nonce_bytes = [0u8; WRAP_NONCE_SIZE];
        nonce_bytes.copy_from_slice(nonce);

        Ok(Self {
            ephemeral_public_key,
            nonce: nonce_bytes,
            ciphertext: ciphertext.to_vec(),
        })
    }
}

impl std::fmt::Debug for EncapsulatedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncapsulatedKey")
            .field("ciphertext_len", &self.ciphertext.len())
            .finish_non_exhaustive()
    }
}

/// A time-bounded read grant held by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessGrant {
    pub grantee: String,
    pub grantee_encapsulated_key: EncapsulatedKey,
    /// Unix seconds, inclusive
    pub valid_from: u64,
    /// Unix seconds, exclusive
    pub valid_to: u64,
    pub revoked: bool,
}

impl AccessGrant {
    /// `valid_from <= now < valid_to && !revoked`. Only the ledger calls this;
    /// clients must ask the ledger instead of evaluating a cached grant.
    pub fn is_active_at(&self, now: u64) -> bool {
        !self.revoked && self.valid_from <= now && now < self.valid_to
    }

    /// Map an inactive grant to the matching error.
    pub fn check_active_at(&self, now: u64, address: &ContentAddress) -> VeilResult<()> {
        if self.revoked {
            return Err(VeilError::AccessRevoked {
                address: address.to_string(),
            });
        }
        if now < self.valid_from {
            return Err(VeilError::AccessNotYetValid {
                valid_from: self.valid_from,
            });
        }
        if now >= self.valid_to {
            return Err(VeilError::AccessExpired {
                valid_to: self.valid_to,
            });
        }
        Ok(())
    }
}

/// A registered file as the ledger records it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub owner: String,
    pub content_address: ContentAddress,
    pub owner_encapsulated_key: EncapsulatedKey,
    pub registered_at: u64,
    pub revoked: bool,
}

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

mod b64_vec {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

mod b64_array {
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(bytes: &[u8; N], s: S) -> Result<S::Ok, S::Error> {
        super::b64_vec::serialize(bytes, s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(d: D) -> Result<[u8; N], D::Error> {
        let bytes = super::b64_vec::deserialize(d)?;
        let len = bytes.len();
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom(format!("expected {N} bytes, got {len}")))
    }
}
