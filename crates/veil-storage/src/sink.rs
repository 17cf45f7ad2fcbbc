//! Content-addressed blob ingestion

use std::time::Duration;

use async_trait::async_trait;
use opendal::Operator;
use tracing::debug;
use veil_chunks::address_of;
use veil_core::{ContentAddress, VeilError, VeilResult};

/// Immutable blob store. `put` is idempotent: storing the same bytes twice
/// yields the same address and leaves one object behind.
#[async_trait]
pub trait BlobSink: Send + Sync {
    async fn put(&self, bytes: Vec<u8>) -> VeilResult<ContentAddress>;
}

/// Directory holding every blob under `prefix`, with a trailing slash.
pub fn blob_dir(prefix: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        "blobs/".to_string()
    } else {
        format!("{prefix}/blobs/")
    }
}

/// Object path of a blob under `prefix`.
pub fn blob_path(prefix: &str, address: &ContentAddress) -> String {
    format!("{}{address}", blob_dir(prefix))
}

/// `BlobSink` over any OpenDAL operator.
#[derive(Clone)]
pub struct OperatorSink {
    op: Operator,
    prefix: String,
    put_timeout: Duration,
}

impl OperatorSink {
    pub fn new(op: Operator, prefix: impl Into<String>, put_timeout: Duration) -> Self {
        Self {
            op,
            prefix: prefix.into(),
            put_timeout,
        }
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn path_for(&self, address: &ContentAddress) -> String {
        blob_path(&self.prefix, address)
    }
}

#[async_trait]
impl BlobSink for OperatorSink {
    async fn put(&self, bytes: Vec<u8>) -> VeilResult<ContentAddress> {
        let address = address_of(&bytes);
        let path = self.path_for(&address);
        let size = bytes.len();

        // Skip if already present; same bytes, same address
        if self.op.exists(&path).await.unwrap_or(false) {
            debug!(address = %address.short(), size, "blob already stored");
            return Ok(address);
        }

        match tokio::time::timeout(self.put_timeout, self.op.write(&path, bytes)).await {
            Err(_) => Err(VeilError::timeout(
                format!("put blob {}", address.short()),
                self.put_timeout,
            )),
            Ok(Err(e)) => Err(storage_error(&e, &path)),
            Ok(Ok(_)) => {
                debug!(address = %address.short(), size, "blob stored");
                Ok(address)
            }
        }
    }
}

pub(crate) fn storage_error(e: &opendal::Error, path: &str) -> VeilError {
    let retryable = e.is_temporary() || e.kind() == opendal::ErrorKind::RateLimited;
    VeilError::storage(format!("writing {path}: {e}"), retryable)
}
