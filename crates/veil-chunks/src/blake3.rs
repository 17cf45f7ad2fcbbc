//! BLAKE3 content addressing
//!
//! Every uploaded blob (packed chunk ciphertext or manifest JSON) is stored
//! under the lowercase hex BLAKE3 digest of its exact bytes, so any reader
//! can check a payload against the address it asked for.

use veil_core::ContentAddress;

/// A BLAKE3 hash digest (32 bytes), displayed as 64 hex chars
pub type Hash = blake3::Hash;

/// Hash a byte slice in memory.
pub fn hash_bytes(data: &[u8]) -> Hash {
    blake3::hash(data)
}

/// Format a hash as lowercase hex string (64 chars)
pub fn hash_to_hex(hash: &Hash) -> String {
    hash.to_hex().to_string()
}

/// Content address of a blob.
pub fn address_of(data: &[u8]) -> ContentAddress {
    ContentAddress::from_digest(*hash_bytes(data).as_bytes())
}

/// True when `data` hashes to `address`. Comparison is constant-time.
pub fn verify_address(address: &ContentAddress, data: &[u8]) -> bool {
    match blake3::Hash::from_hex(address.as_str()) {
        Ok(expected) => expected == hash_bytes(data),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_hash_is_deterministic() {
        assert_eq!(address_of(b""), address_of(b""));
    }

    #[test]
    fn address_matches_blake3_hex() {
        let data = b"hello veil";
        assert_eq!(address_of(data).as_str(), hash_to_hex(&hash_bytes(data)));
    }

    #[test]
    fn different_content_different_address() {
        assert_ne!(address_of(b"foo"), address_of(b"bar"));
    }

    #[test]
    fn verify_detects_single_bit_flip() {
        let data = b"packed chunk bytes".to_vec();
        let addr = address_of(&data);
        assert!(verify_address(&addr, &data));

        let mut flipped = data.clone();
        flipped[3] ^= 0x01;
        assert!(!verify_address(&addr, &flipped));
    }

    proptest! {
        #[test]
        fn address_is_deterministic(data in proptest::collection::vec(any::<u8>(), 0..=4096)) {
            let a1 = address_of(&data);
            let a2 = address_of(&data);
            prop_assert_eq!(&a1, &a2, "content address must be a function of the bytes");
            prop_assert!(verify_address(&a1, &data));
        }
    }
}
