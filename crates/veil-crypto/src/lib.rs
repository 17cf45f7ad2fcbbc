//! veil-crypto: client-side encryption for veil
//!
//! Architecture: fixed-size chunks, each sealed independently
//!
//! Pipeline: plaintext → chunk → ChaCha20-Poly1305 (AAD = decimal index) → BLAKE3 address → upload
//!
//! Key custody:
//! ```text
//! Principal signature over KEY_DERIVATION_CHALLENGE
//!   └── HKDF-SHA256 → X25519 static keypair (re-derived every session, never stored)
//!         └── EncapsulatedKey = X25519(ephemeral, static) → HKDF → XChaCha20-Poly1305(FileKey)
//! FileKey (per-file, 256-bit random, memory only)
//!   └── Chunk AEAD: ChaCha20-Poly1305 (nonce = random 96-bit, AAD = index as decimal UTF-8)
//! ```

pub mod chunk;
pub mod custody;
pub mod encoding;
pub mod keys;
pub mod signer;

pub use chunk::{decrypt_chunk, encrypt_chunk, ChunkCipher};
pub use custody::{
    decapsulate, derive_keypair, encapsulate, parse_public_key, reencapsulate, PrincipalKeypair,
    KEY_DERIVATION_CHALLENGE,
};
pub use encoding::{encode_hex, KeyBlob};
pub use keys::{generate_file_key, FileKey};
pub use signer::{Ed25519Signer, Signer};

/// Size of a file key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of a ChaCha20-Poly1305 chunk nonce (96-bit)
pub const CHUNK_NONCE_SIZE: usize = 12;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Bytes a packed chunk adds on top of its plaintext
pub const CHUNK_OVERHEAD: usize = CHUNK_NONCE_SIZE + TAG_SIZE;

pub use veil_core::types::WRAP_NONCE_SIZE;
