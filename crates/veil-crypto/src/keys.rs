//! Per-file symmetric keys
//!
//! A `FileKey` lives only in process memory. It is neither `Serialize` nor
//! `Display`; the only way it leaves the process is wrapped inside an
//! `EncapsulatedKey` (see `custody`).

use rand::RngCore;
use zeroize::Zeroize;

use crate::KEY_SIZE;

/// A per-file 256-bit encryption key. Zeroized on drop.
#[derive(Clone)]
pub struct FileKey {
    bytes: [u8; KEY_SIZE],
}

impl FileKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for FileKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for FileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate a random 256-bit file encryption key.
pub fn generate_file_key() -> FileKey {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    FileKey::from_bytes(bytes)
}
