//! veil-core: configuration schema, error taxonomy, and the data model shared
//! by the transfer engine, key custody, and storage crates.

pub mod config;
pub mod error;
pub mod types;

pub use error::{EndpointFailure, FetchErrorKind, VeilError, VeilResult};
pub use types::{
    unix_now, AccessGrant, ChunkRecord, ContentAddress, EncapsulatedKey, FileRecord,
};
