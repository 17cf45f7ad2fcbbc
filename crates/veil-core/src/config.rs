use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration (loaded from veil.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VeilConfig {
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub gateway: GatewayConfig,
    pub transfer: TransferConfig,
    pub ledger: LedgerConfig,
    pub signer: SignerConfig,
}

impl VeilConfig {
    /// Parse a TOML document, filling unspecified fields with defaults.
    pub fn from_toml(text: &str) -> crate::VeilResult<Self> {
        toml::from_str(text).map_err(|e| crate::VeilError::Config(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

/// Backend that receives uploaded chunks and manifests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageScheme {
    /// Local directory (development, tests)
    Fs,
    /// Process memory (tests only; contents vanish on exit)
    Memory,
    /// Any S3-compatible object store
    S3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub scheme: StorageScheme,
    /// Root directory for `fs`
    pub root: PathBuf,
    /// S3 endpoint
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// Bucket name
    pub bucket: String,
    /// Key prefix under which `blobs/{address}` objects are written
    pub prefix: String,
    /// Refuse plaintext HTTP endpoints
    pub enforce_tls: bool,
    /// Timeout for one blob write, in seconds
    pub put_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            scheme: StorageScheme::Fs,
            root: PathBuf::from("~/.local/share/veil/blobs"),
            endpoint: "http://localhost:8333".into(),
            region: "us-east-1".into(),
            bucket: "veil".into(),
            prefix: "veil".into(),
            enforce_tls: false,
            put_timeout_secs: 30,
        }
    }
}

impl StorageConfig {
    pub fn put_timeout(&self) -> Duration {
        Duration::from_secs(self.put_timeout_secs)
    }
}

/// One retrieval endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Label used in logs and error reports
    pub name: String,
    /// `http(s)://...` gateway URL, or `file:///path` for a local mirror
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Per-attempt timeout in seconds
    pub attempt_timeout_secs: u64,
    /// Reorder candidates by recent health (configured order breaks ties)
    pub rank_by_health: bool,
    /// Ordered retrieval endpoints. Empty means "read back from storage".
    pub endpoints: Vec<EndpointConfig>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_secs: 15,
            rank_by_health: true,
            endpoints: Vec::new(),
        }
    }
}

impl GatewayConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Plaintext bytes per chunk (default: 2 MiB)
    pub chunk_size: u64,
    /// Worker count (0 = available parallelism)
    pub concurrency: usize,
    /// Attempts per chunk after the first failure
    pub max_retries: u32,
    /// Initial backoff between chunk retries, doubled each attempt
    pub retry_backoff_ms: u64,
    /// Upper bound on a single backoff sleep
    pub retry_backoff_max_ms: u64,
    /// Debounce window for session snapshot writes
    pub persist_debounce_ms: u64,
    /// Directory holding resumable session snapshots
    pub session_dir: PathBuf,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 2 * 1024 * 1024,
            concurrency: 4,
            max_retries: 3,
            retry_backoff_ms: 250,
            retry_backoff_max_ms: 8_000,
            persist_debounce_ms: 500,
            session_dir: PathBuf::from("~/.local/share/veil/sessions"),
        }
    }
}

impl TransferConfig {
    /// Resolve `concurrency = 0` to the machine's parallelism.
    pub fn effective_concurrency(&self) -> usize {
        if self.concurrency > 0 {
            return self.concurrency;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }

    /// Backoff before retry `attempt` (1-based), capped.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let ms = self
            .retry_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.retry_backoff_max_ms);
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// JSON file backing the local ledger
    pub path: PathBuf,
    /// Timeout for one ledger call, in seconds
    pub timeout_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("~/.local/share/veil/ledger.json"),
            timeout_secs: 20,
        }
    }
}

impl LedgerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// What to do when the principal declines to sign the ledger registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionPolicy {
    /// Stop; the session stays resumable at `ManifestPublished`
    Abort,
    /// Finish the upload without ledger registration
    ContinueUnregistered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignerConfig {
    /// Hex-encoded Ed25519 seed file for the local principal
    pub identity_file: PathBuf,
    /// Principal name (defaults to the hex public key)
    pub principal: Option<String>,
    pub on_rejected: RejectionPolicy,
    /// Timeout for one signature request, in seconds
    pub timeout_secs: u64,
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            identity_file: PathBuf::from("~/.config/veil/identity.key"),
            principal: None,
            on_rejected: RejectionPolicy::Abort,
            timeout_secs: 120,
        }
    }
}

impl SignerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Expand a leading `~/` against `$HOME`.
pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Some(rest) = path.to_str().and_then(|s| s.strip_prefix("~/")) {
        let home = std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"));
        return home.join(rest);
    }
    path.to_path_buf()
}
