//! veil-chunks: content addressing and chunk planning
//!
//! # Overview
//! - `blake3`: deterministic hashing of ciphertext blobs into content addresses
//! - `plan`: fixed-size split of a plaintext file into indexed byte ranges

pub mod blake3;
pub mod plan;

pub use crate::blake3::{address_of, hash_bytes, hash_to_hex, verify_address, Hash};
pub use crate::plan::{ChunkPlan, ChunkSpan};
