//! Storage health check

use opendal::Operator;
use veil_core::{VeilError, VeilResult};

use crate::gateway::classify_error;

/// Verify the ingestion backend is reachable by listing the blob prefix.
pub async fn check_health(op: &Operator, prefix: &str) -> VeilResult<()> {
    let path = format!("{}/", prefix.trim_matches('/'));
    match op.list(&path).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(VeilError::storage(
            format!("storage health check failed ({}): {e}", classify_error(&e)),
            e.is_temporary(),
        )),
    }
}

/// Returns true if storage is reachable, false otherwise (non-panicking)
pub async fn is_healthy(op: &Operator, prefix: &str) -> bool {
    check_health(op, prefix).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_backend_is_healthy() {
        let op = Operator::new(opendal::services::Memory::default())
            .unwrap()
            .finish();
        assert!(is_healthy(&op, "veil").await);
    }
}
