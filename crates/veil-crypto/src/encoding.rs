//! Encapsulated key blob formats
//!
//! Ledgers and out-of-band channels have historically carried encapsulated
//! keys in several shapes. Each shape is detected explicitly and decoded by
//! exactly one decoder; anything else is refused.
//!
//! | Shape        | Example                                   |
//! |--------------|-------------------------------------------|
//! | `Raw`        | 104 packed bytes (`epk ‖ nonce ‖ ct+tag`) |
//! | `Hex`        | 208 hex chars of the packed bytes         |
//! | `Json`       | `{"ephemeralPublicKey": "...", ...}`      |
//! | `DoubleJson` | `"{\"ephemeralPublicKey\": ...}"`         |

use veil_core::types::{PUBLIC_KEY_SIZE, WRAP_NONCE_SIZE};
use veil_core::{EncapsulatedKey, VeilError, VeilResult};

use crate::{KEY_SIZE, TAG_SIZE};

/// Length of a packed encapsulation of a 256-bit key.
pub const PACKED_KEY_LEN: usize = PUBLIC_KEY_SIZE + WRAP_NONCE_SIZE + KEY_SIZE + TAG_SIZE;

/// A stored encapsulated key whose shape has been classified but not parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyBlob {
    Raw(Vec<u8>),
    Hex(String),
    Json(String),
    DoubleJson(String),
    Unrecognized,
}

impl KeyBlob {
    pub fn detect(bytes: &[u8]) -> Self {
        if bytes.len() == PACKED_KEY_LEN && !is_printable(bytes) {
            return KeyBlob::Raw(bytes.to_vec());
        }

        let Ok(text) = std::str::from_utf8(bytes) else {
            return KeyBlob::Unrecognized;
        };
        Self::detect_text(text)
    }

    fn detect_text(text: &str) -> Self {
        let text = text.trim();
        if text.starts_with('{') {
            return KeyBlob::Json(text.to_string());
        }
        if text.starts_with('"') {
            return KeyBlob::DoubleJson(text.to_string());
        }
        let hex_body = text.strip_prefix("0x").unwrap_or(text);
        if !hex_body.is_empty()
            && hex_body.len() % 2 == 0
            && hex_body.bytes().all(|b| b.is_ascii_hexdigit())
        {
            return KeyBlob::Hex(hex_body.to_string());
        }
        KeyBlob::Unrecognized
    }

    /// Classify an already-parsed JSON value (a ledger field).
    pub fn from_json_value(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Object(_) => KeyBlob::Json(value.to_string()),
            serde_json::Value::String(s) => Self::detect_text(s),
            _ => KeyBlob::Unrecognized,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            KeyBlob::Raw(_) => "raw",
            KeyBlob::Hex(_) => "hex",
            KeyBlob::Json(_) => "json",
            KeyBlob::DoubleJson(_) => "double-json",
            KeyBlob::Unrecognized => "unrecognized",
        }
    }

    pub fn decode(&self) -> VeilResult<EncapsulatedKey> {
        let key = match self {
            KeyBlob::Raw(bytes) => EncapsulatedKey::from_packed(bytes)?,
            KeyBlob::Hex(text) => {
                let bytes = hex::decode(text).map_err(|e| {
                    VeilError::DecapsulationFailure(format!("hex key blob: {e}"))
                })?;
                EncapsulatedKey::from_packed(&bytes)?
            }
            KeyBlob::Json(text) => decode_json(text)?,
            KeyBlob::DoubleJson(text) => {
                let inner: String = serde_json::from_str(text).map_err(|e| {
                    VeilError::DecapsulationFailure(format!("double-encoded key blob: {e}"))
                })?;
                if !inner.trim_start().starts_with('{') {
                    return Err(VeilError::DecapsulationFailure(
                        "double-encoded key blob does not wrap a JSON object".into(),
                    ));
                }
                decode_json(&inner)?
            }
            KeyBlob::Unrecognized => {
                return Err(VeilError::DecapsulationFailure(
                    "unrecognized encapsulated key encoding".into(),
                ))
            }
        };

        if key.ciphertext.len() != KEY_SIZE + TAG_SIZE {
            return Err(VeilError::DecapsulationFailure(format!(
                "{} key blob carries {} ciphertext bytes, expected {}",
                self.kind(),
                key.ciphertext.len(),
                KEY_SIZE + TAG_SIZE
            )));
        }
        Ok(key)
    }
}

/// Canonical text form used when handing a key blob to a person.
pub fn encode_hex(key: &EncapsulatedKey) -> String {
    hex::encode(key.to_packed())
}

fn decode_json(text: &str) -> VeilResult<EncapsulatedKey> {
    serde_json::from_str(text)
        .map_err(|e| VeilError::DecapsulationFailure(format!("json key blob: {e}")))
}

fn is_printable(bytes: &[u8]) -> bool {
    bytes
        .iter()
        .all(|b| b.is_ascii_graphic() || b.is_ascii_whitespace())
}
