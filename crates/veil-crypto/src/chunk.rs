//! Per-chunk ChaCha20-Poly1305 encryption/decryption
//!
//! Packed chunk format (binary):
//! ```text
//! [12 bytes: random nonce][N bytes: ciphertext][16 bytes: Poly1305 tag]
//! AAD = chunk index rendered as decimal ASCII ("0", "1", ... "4294967296")
//! ```
//!
//! The AAD binds each chunk to its position, so a ciphertext moved to another
//! index fails authentication. Cross-file substitution is ruled out by the
//! per-file key. Nonces are drawn fresh from the OS RNG on every call, which
//! makes encryption non-deterministic: re-sealing a chunk yields a new
//! address.

use std::sync::Arc;

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use veil_core::{VeilError, VeilResult};

use crate::keys::FileKey;
use crate::{CHUNK_NONCE_SIZE, CHUNK_OVERHEAD};

/// Encrypt one chunk.
///
/// Returns `[12-byte nonce][ciphertext][16-byte tag]`.
pub fn encrypt_chunk(file_key: &FileKey, plaintext: &[u8], index: u64) -> VeilResult<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(file_key.as_bytes().into());

    let mut nonce_bytes = [0u8; CHUNK_NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let aad = index_aad(index);
    let ciphertext = cipher
        .encrypt(
            nonce,
            Payload {
                msg: plaintext,
                aad: aad.as_bytes(),
            },
        )
        .map_err(|e| anyhow::anyhow!("chunk {index} encryption failed: {e}"))?;

    let mut packed = Vec::with_capacity(CHUNK_NONCE_SIZE + ciphertext.len());
    packed.extend_from_slice(&nonce_bytes);
    packed.extend_from_slice(&ciphertext);
    Ok(packed)
}

/// Decrypt one packed chunk that was sealed at position `index`.
///
/// Inputs shorter than nonce + tag fail with `MalformedChunk` before any
/// cryptographic work. A wrong key, a wrong index and a flipped bit are
/// indistinguishable and all yield `AuthenticationFailure`.
pub fn decrypt_chunk(file_key: &FileKey, packed: &[u8], index: u64) -> VeilResult<Vec<u8>> {
    if packed.len() < CHUNK_OVERHEAD {
        return Err(VeilError::MalformedChunk {
            index,
            len: packed.len(),
            min: CHUNK_OVERHEAD,
        });
    }

    let (nonce_bytes, ciphertext) = packed.split_at(CHUNK_NONCE_SIZE);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = ChaCha20Poly1305::new(file_key.as_bytes().into());

    let aad = index_aad(index);
    cipher
        .decrypt(
            nonce,
            Payload {
                msg: ciphertext,
                aad: aad.as_bytes(),
            },
        )
        .map_err(|_| VeilError::AuthenticationFailure { index })
}

fn index_aad(index: u64) -> String {
    index.to_string()
}

/// A file key shared by every worker of one transfer.
#[derive(Clone)]
pub struct ChunkCipher {
    key: Arc<FileKey>,
}

impl ChunkCipher {
    pub fn new(key: FileKey) -> Self {
        Self { key: Arc::new(key) }
    }

    pub fn seal(&self, index: u64, plaintext: &[u8]) -> VeilResult<Vec<u8>> {
        encrypt_chunk(&self.key, plaintext, index)
    }

    pub fn open(&self, index: u64, packed: &[u8]) -> VeilResult<Vec<u8>> {
        decrypt_chunk(&self.key, packed, index)
    }

    pub fn key(&self) -> &FileKey {
        &self.key
    }
}

impl std::fmt::Debug for ChunkCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkCipher").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_file_key;
    use proptest::prelude::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = generate_file_key();
        let plaintext = b"hello, encrypted world!";

        let packed = encrypt_chunk(&key, plaintext, 0).unwrap();
        let decrypted = decrypt_chunk(&key, &packed, 0).unwrap();

        assert_eq!(&decrypted, plaintext);
    }

    #[test]
    fn test_encrypt_decrypt_empty() {
        let key = generate_file_key();

        let packed = encrypt_chunk(&key, b"", 0).unwrap();
        assert_eq!(packed.len(), CHUNK_OVERHEAD);
        let decrypted = decrypt_chunk(&key, &packed, 0).unwrap();

        assert_eq!(decrypted, b"");
    }

    #[test]
    fn test_packed_size() {
        let key = generate_file_key();
        let plaintext = vec![0u8; 1000];

        let packed = encrypt_chunk(&key, &plaintext, 7).unwrap();

        // nonce (12) + plaintext (1000) + tag (16)
        assert_eq!(packed.len(), 12 + 1000 + 16);
    }

    #[test]
    fn test_nonces_are_fresh() {
        let key = generate_file_key();
        let a = encrypt_chunk(&key, b"same", 0).unwrap();
        let b = encrypt_chunk(&key, b"same", 0).unwrap();
        assert_ne!(a[..CHUNK_NONCE_SIZE], b[..CHUNK_NONCE_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_decrypt_wrong_key() {
        let key1 = generate_file_key();
        let key2 = generate_file_key();

        let packed = encrypt_chunk(&key1, b"secret data", 0).unwrap();
        let result = decrypt_chunk(&key2, &packed, 0);

        assert!(matches!(
            result,
            Err(VeilError::AuthenticationFailure { index: 0 })
        ));
    }

    #[test]
    fn test_decrypt_wrong_index() {
        let key = generate_file_key();

        let packed = encrypt_chunk(&key, b"secret data", 3).unwrap();
        let result = decrypt_chunk(&key, &packed, 4);

        assert!(
            matches!(result, Err(VeilError::AuthenticationFailure { index: 4 })),
            "chunk moved to another position must fail"
        );
    }

    #[test]
    fn test_short_input_is_malformed() {
        let key = generate_file_key();
        for len in [0usize, 1, 12, 27] {
            let result = decrypt_chunk(&key, &vec![0u8; len], 9);
            match result {
                Err(VeilError::MalformedChunk { index, len: l, min }) => {
                    assert_eq!(index, 9);
                    assert_eq!(l, len);
                    assert_eq!(min, 28);
                }
                other => panic!("expected MalformedChunk for {len} bytes, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_chunk_cipher_shares_key() {
        let cipher = ChunkCipher::new(generate_file_key());
        let worker = cipher.clone();
        let packed = worker.seal(2, b"abc").unwrap();
        assert_eq!(cipher.open(2, &packed).unwrap(), b"abc");
        assert!(!format!("{cipher:?}").contains("bytes"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn roundtrip_any_payload(
            data in proptest::collection::vec(any::<u8>(), 0..4096),
            index in any::<u64>(),
        ) {
            let key = generate_file_key();
            let packed = encrypt_chunk(&key, &data, index).unwrap();
            prop_assert_eq!(packed.len(), data.len() + CHUNK_OVERHEAD);
            prop_assert_eq!(decrypt_chunk(&key, &packed, index).unwrap(), data);
        }

        #[test]
        fn any_bit_flip_fails(
            data in proptest::collection::vec(any::<u8>(), 1..512),
            index in 0u64..1_000_000,
            pos_seed in any::<usize>(),
            bit in 0u8..8,
        ) {
            let key = generate_file_key();
            let mut packed = encrypt_chunk(&key, &data, index).unwrap();
            let pos = pos_seed % packed.len();
            packed[pos] ^= 1 << bit;
            let is_auth_failure = matches!(
                decrypt_chunk(&key, &packed, index),
                Err(VeilError::AuthenticationFailure { .. })
            );
            prop_assert!(is_auth_failure);
        }

        #[test]
        fn other_index_fails(index in 0u64..u64::MAX) {
            let key = generate_file_key();
            let packed = encrypt_chunk(&key, b"position bound", index).unwrap();
            prop_assert!(decrypt_chunk(&key, &packed, index + 1).is_err());
        }
    }
}
