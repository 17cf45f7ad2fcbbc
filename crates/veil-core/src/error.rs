use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type VeilResult<T> = Result<T, VeilError>;

/// How a single retrieval attempt against one endpoint failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    /// The per-attempt deadline elapsed
    Timeout,
    /// Connection-level failure (DNS, reset, TLS)
    Network,
    /// The endpoint does not (yet) hold the blob
    NotFound,
    /// 5xx, rate limiting, or any error the backend marks temporary
    TransientServer,
    /// The payload did not hash to the requested address
    Corrupt,
    /// Malformed request or forbidden; retrying anywhere is pointless
    NonRetryableClient,
}

impl FetchErrorKind {
    /// Whether trying the next candidate endpoint can help.
    pub fn continues_to_next(&self) -> bool {
        !matches!(self, FetchErrorKind::NonRetryableClient)
    }

    /// Whether a later round against the same endpoints may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FetchErrorKind::Timeout
                | FetchErrorKind::Network
                | FetchErrorKind::NotFound
                | FetchErrorKind::TransientServer
        )
    }
}

impl std::fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FetchErrorKind::Timeout => "timeout",
            FetchErrorKind::Network => "network",
            FetchErrorKind::NotFound => "not-found",
            FetchErrorKind::TransientServer => "transient-server",
            FetchErrorKind::Corrupt => "corrupt",
            FetchErrorKind::NonRetryableClient => "non-retryable-client",
        };
        f.write_str(s)
    }
}

/// One endpoint's contribution to an `AllEndpointsFailed` error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointFailure {
    pub endpoint: String,
    pub kind: FetchErrorKind,
    pub message: String,
}

impl std::fmt::Display for EndpointFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.endpoint, self.kind, self.message)
    }
}

/// Error taxonomy shared by every veil crate.
///
/// Messages carry indices, addresses and principals only. Key bytes and
/// ciphertext never appear in a variant.
#[derive(Debug, Error)]
pub enum VeilError {
    #[error("file key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("chunk {index} failed authentication (tampered, wrong key, or wrong position)")]
    AuthenticationFailure { index: u64 },

    #[error("malformed chunk {index}: {len} bytes (minimum {min})")]
    MalformedChunk { index: u64, len: usize, min: usize },

    #[error("key decapsulation failed: {0}")]
    DecapsulationFailure(String),

    #[error("chunk {index} failed: {cause}")]
    FailedChunk {
        index: u64,
        #[source]
        cause: Box<VeilError>,
    },

    #[error("all endpoints failed for {address}: [{}]", join_failures(.failures))]
    AllEndpointsFailed {
        address: String,
        failures: Vec<EndpointFailure>,
    },

    #[error("access denied: {grantee} holds no grant for {address}")]
    AccessDenied { grantee: String, address: String },

    #[error("access not yet valid: grant opens at {valid_from}")]
    AccessNotYetValid { valid_from: u64 },

    #[error("access expired at {valid_to}")]
    AccessExpired { valid_to: u64 },

    #[error("access revoked for {address}")]
    AccessRevoked { address: String },

    #[error("session corrupt: {0}")]
    SessionCorrupt(String),

    #[error("signature request rejected: {0}")]
    RejectedBySigner(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("storage error: {message}")]
    Storage { message: String, retryable: bool },

    #[error("ledger error: {0}")]
    Ledger(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VeilError {
    /// Retry policy: transport failures are retried, cryptographic and
    /// authorization failures are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            VeilError::Timeout { .. } => true,
            VeilError::Storage { retryable, .. } => *retryable,
            VeilError::AllEndpointsFailed { failures, .. } => {
                failures.iter().any(|f| f.kind.is_transient())
            }
            _ => false,
        }
    }

    pub fn storage(message: impl Into<String>, retryable: bool) -> Self {
        VeilError::Storage {
            message: message.into(),
            retryable,
        }
    }

    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        VeilError::Timeout {
            operation: operation.into(),
            after,
        }
    }
}

fn join_failures(failures: &[EndpointFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
