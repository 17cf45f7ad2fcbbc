//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opendal::Operator;
use tempfile::TempDir;
use veil_core::config::{RejectionPolicy, VeilConfig};
use veil_core::{unix_now, ContentAddress, VeilError, VeilResult};
use veil_crypto::{Ed25519Signer, Signer, KEY_DERIVATION_CHALLENGE};
use veil_storage::{BlobSink, Endpoint, GatewayFetcher, OperatorSink};
use veil_transfer::{LocalLedger, ManualClock, SessionStore, TransferEngine};

pub const PREFIX: &str = "test";
pub const MB: usize = 1024 * 1024;

pub fn memory_operator() -> Operator {
    Operator::new(opendal::services::Memory::default())
        .expect("memory operator")
        .finish()
}

pub fn write_test_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).expect("write test file");
    path
}

/// Deterministic, non-repeating-per-chunk test content.
pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31) ^ (i >> 11)) as u8).collect()
}

pub fn signer(seed: u8, name: &str) -> Ed25519Signer {
    Ed25519Signer::from_seed([seed; 32], Some(name.to_string()))
}

/// Signs the key derivation challenge but declines everything else.
pub struct RejectingSigner(pub Ed25519Signer);

#[async_trait]
impl Signer for RejectingSigner {
    fn principal(&self) -> &str {
        self.0.principal()
    }

    async fn sign(&self, message: &[u8]) -> VeilResult<Vec<u8>> {
        if message == KEY_DERIVATION_CHALLENGE {
            return self.0.sign(message).await;
        }
        Err(VeilError::RejectedBySigner("user declined".into()))
    }
}

/// Passes the first `budget` puts through, then fails every put for good.
pub struct FlakySink {
    inner: OperatorSink,
    budget: usize,
    puts: AtomicUsize,
}

impl FlakySink {
    pub fn new(op: Operator, budget: usize) -> Self {
        Self {
            inner: OperatorSink::new(op, PREFIX, Duration::from_secs(5)),
            budget,
            puts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BlobSink for FlakySink {
    async fn put(&self, bytes: Vec<u8>) -> VeilResult<ContentAddress> {
        if self.puts.fetch_add(1, Ordering::SeqCst) >= self.budget {
            return Err(VeilError::storage("injected failure", false));
        }
        self.inner.put(bytes).await
    }
}

/// One shared world: blob backend, ledger, clock and session directory.
pub struct Harness {
    pub dir: TempDir,
    pub op: Operator,
    pub clock: Arc<ManualClock>,
    pub ledger: Arc<LocalLedger>,
    pub config: VeilConfig,
}

impl Harness {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let clock = Arc::new(ManualClock::new(unix_now()));
        let ledger = Arc::new(LocalLedger::in_memory(clock.clone()));

        let mut config = VeilConfig::default();
        config.storage.prefix = PREFIX.into();
        config.transfer.chunk_size = 2 * MB as u64;
        config.transfer.concurrency = 4;
        config.transfer.max_retries = 1;
        config.transfer.retry_backoff_ms = 1;
        config.transfer.retry_backoff_max_ms = 2;
        config.transfer.persist_debounce_ms = 10;
        config.transfer.session_dir = dir.path().join("sessions");

        Self {
            dir,
            op: memory_operator(),
            clock,
            ledger,
            config,
        }
    }

    pub fn with_policy(mut self, policy: RejectionPolicy) -> Self {
        self.config.signer.on_rejected = policy;
        self
    }

    pub fn store(&self) -> Arc<SessionStore> {
        Arc::new(SessionStore::open(&self.config.transfer.session_dir).expect("session store"))
    }

    pub fn fetcher(&self) -> Arc<GatewayFetcher> {
        let endpoint = Endpoint::storage_readback(self.op.clone(), PREFIX);
        Arc::new(GatewayFetcher::new(vec![endpoint], &self.config.gateway).expect("fetcher"))
    }

    pub fn engine_with_sink(&self, sink: Arc<dyn BlobSink>) -> TransferEngine {
        TransferEngine::new(
            sink,
            self.fetcher(),
            self.ledger.clone(),
            self.store(),
            &self.config,
        )
        .with_clock(self.clock.clone())
    }

    pub fn engine(&self) -> TransferEngine {
        let sink = OperatorSink::new(self.op.clone(), PREFIX, Duration::from_secs(5));
        self.engine_with_sink(Arc::new(sink))
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }
}
