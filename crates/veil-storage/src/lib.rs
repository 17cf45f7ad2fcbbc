//! veil-storage: OpenDAL storage abstraction
//!
//! Two directions:
//! - ingestion: `BlobSink` writes immutable blobs under their content address
//! - retrieval: `GatewayFetcher` reads them back from an ordered set of
//!   endpoints, verifying every payload against its address

pub mod gateway;
pub mod health;
pub mod operator;
pub mod sink;

pub use gateway::{classify_error, Endpoint, EndpointHealth, Fetched, GatewayFetcher};
pub use health::{check_health, is_healthy};
pub use operator::{build_from_config, build_operator, S3Credentials};
pub use sink::{blob_dir, blob_path, BlobSink, OperatorSink};
