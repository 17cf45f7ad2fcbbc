//! Key custody: signature-derived keypairs and file key encapsulation
//!
//! A principal never stores a private key for file access. Instead the
//! principal's signer is asked to sign [`KEY_DERIVATION_CHALLENGE`]; the
//! signature (deterministic for Ed25519) is stretched with HKDF-SHA256 into an
//! X25519 static secret. The same principal re-derives the same keypair in
//! every session.
//!
//! Encapsulation format:
//! ```text
//! shared   = X25519(ephemeral_secret, recipient_public)
//! wrap_key = HKDF-SHA256(ikm = shared, salt = epk || recipient_pk, info = "veil-encapsulation-v1")
//! sealed   = XChaCha20-Poly1305(wrap_key, nonce24, FileKey, aad = epk || recipient_pk)
//! ```

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use veil_core::types::{PUBLIC_KEY_SIZE, WRAP_NONCE_SIZE};
use veil_core::{EncapsulatedKey, VeilError, VeilResult};
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::keys::FileKey;
use crate::KEY_SIZE;

/// The fixed message a principal signs to unlock its keypair.
pub const KEY_DERIVATION_CHALLENGE: &[u8] =
    b"veil key derivation v1\nSigning this message unlocks your veil file keys on this device.\nIt does not authorize any transfer or payment.";

const DERIVE_SALT: &[u8] = b"veil-principal-keypair-v1";
const WRAP_INFO: &[u8] = b"veil-encapsulation-v1";

/// Signatures shorter than this carry too little entropy to seed a keypair.
const MIN_SIGNATURE_LEN: usize = 32;

/// An X25519 keypair re-derived from a principal's signature.
pub struct PrincipalKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl PrincipalKeypair {
    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public.as_bytes())
    }
}

impl std::fmt::Debug for PrincipalKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrincipalKeypair")
            .field("public", &self.public_key_hex())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// Derive the keypair for `principal` from its signature over the challenge.
///
/// Deterministic: equal inputs give equal keypairs. The principal name is
/// mixed in so two principals sharing a signing key still get distinct
/// keypairs.
pub fn derive_keypair(principal: &str, signature: &[u8]) -> VeilResult<PrincipalKeypair> {
    if signature.len() < MIN_SIGNATURE_LEN {
        return Err(VeilError::KeyUnavailable(format!(
            "signature too short to derive a keypair: {} bytes",
            signature.len()
        )));
    }

    let hkdf = Hkdf::<Sha256>::new(Some(DERIVE_SALT), signature);
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(principal.as_bytes(), &mut okm)
        .map_err(|e| anyhow::anyhow!("HKDF expand failed: {e}"))?;

    let secret = StaticSecret::from(okm);
    okm.zeroize();
    let public = PublicKey::from(&secret);
    Ok(PrincipalKeypair { secret, public })
}

/// Parse a hex-encoded X25519 public key.
pub fn parse_public_key(hex_str: &str) -> VeilResult<PublicKey> {
    let bytes = hex::decode(hex_str.trim())
        .map_err(|e| VeilError::Config(format!("public key is not hex: {e}")))?;
    let arr: [u8; PUBLIC_KEY_SIZE] = bytes.try_into().map_err(|v: Vec<u8>| {
        VeilError::Config(format!(
            "public key must be {PUBLIC_KEY_SIZE} bytes, got {}",
            v.len()
        ))
    })?;
    Ok(PublicKey::from(arr))
}

/// Wrap `file_key` for `recipient`. A fresh ephemeral secret is drawn per
/// call, so encapsulating the same key twice yields unrelated outputs.
pub fn encapsulate(file_key: &FileKey, recipient: &PublicKey) -> VeilResult<EncapsulatedKey> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);

    let shared = ephemeral.diffie_hellman(recipient);
    if !shared.was_contributory() {
        return Err(VeilError::KeyUnavailable(
            "recipient public key is a low-order point".into(),
        ));
    }

    let context = binding_context(&ephemeral_public, recipient);
    let mut wrap_key = derive_wrap_key(shared.as_bytes(), &context)?;
    let cipher = XChaCha20Poly1305::new((&wrap_key).into());
    wrap_key.zeroize();

    let mut nonce = [0u8; WRAP_NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: file_key.as_bytes(),
                aad: &context,
            },
        )
        .map_err(|e| anyhow::anyhow!("key encapsulation failed: {e}"))?;

    Ok(EncapsulatedKey {
        ephemeral_public_key: ephemeral_public.to_bytes(),
        nonce,
        ciphertext,
    })
}

/// Recover the file key wrapped for `keypair`.
///
/// Any wrong keypair, tampered field, or malformed ephemeral key fails with
/// `DecapsulationFailure`; no partial key is ever returned.
pub fn decapsulate(encapsulated: &EncapsulatedKey, keypair: &PrincipalKeypair) -> VeilResult<FileKey> {
    let ephemeral_public = PublicKey::from(encapsulated.ephemeral_public_key);
    let shared = keypair.secret.diffie_hellman(&ephemeral_public);
    if !shared.was_contributory() {
        return Err(VeilError::DecapsulationFailure(
            "ephemeral public key is a low-order point".into(),
        ));
    }

    let context = binding_context(&ephemeral_public, &keypair.public);
    let mut wrap_key = derive_wrap_key(shared.as_bytes(), &context)?;
    let cipher = XChaCha20Poly1305::new((&wrap_key).into());
    wrap_key.zeroize();

    let mut plaintext = cipher
        .decrypt(
            XNonce::from_slice(&encapsulated.nonce),
            Payload {
                msg: &encapsulated.ciphertext,
                aad: &context,
            },
        )
        .map_err(|_| {
            VeilError::DecapsulationFailure("wrong keypair or tampered encapsulated key".into())
        })?;

    if plaintext.len() != KEY_SIZE {
        let len = plaintext.len();
        plaintext.zeroize();
        return Err(VeilError::DecapsulationFailure(format!(
            "unwrapped key is {len} bytes, expected {KEY_SIZE}"
        )));
    }

    let mut bytes = [0u8; KEY_SIZE];
    bytes.copy_from_slice(&plaintext);
    plaintext.zeroize();
    Ok(FileKey::from_bytes(bytes))
}

/// Unwrap with the owner's keypair and re-wrap for `recipient`. The plaintext
/// file key is dropped (and zeroized) before this returns.
pub fn reencapsulate(
    encapsulated: &EncapsulatedKey,
    owner: &PrincipalKeypair,
    recipient: &PublicKey,
) -> VeilResult<EncapsulatedKey> {
    let file_key = decapsulate(encapsulated, owner)?;
    encapsulate(&file_key, recipient)
}

fn binding_context(ephemeral: &PublicKey, recipient: &PublicKey) -> Vec<u8> {
    let mut ctx = Vec::with_capacity(2 * PUBLIC_KEY_SIZE);
    ctx.extend_from_slice(ephemeral.as_bytes());
    ctx.extend_from_slice(recipient.as_bytes());
    ctx
}

fn derive_wrap_key(shared: &[u8; 32], context: &[u8]) -> VeilResult<[u8; KEY_SIZE]> {
    let hkdf = Hkdf::<Sha256>::new(Some(context), shared);
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(WRAP_INFO, &mut okm)
        .map_err(|e| anyhow::anyhow!("HKDF expand failed: {e}"))?;
    Ok(okm)
}
