//! Bounded-concurrency chunk worker pool
//!
//! `min(concurrency, total)` tokio tasks share one `AtomicU64` cursor. Each
//! claim is a single `fetch_add`, so no index is ever handed to two workers.
//! Indices already present in the session's completion map are skipped,
//! which is what makes resume transfer only the missing chunks.
//!
//! Retryable errors (see `VeilError::is_retryable`) are retried with capped
//! exponential backoff. The first chunk that fails for good raises the run's
//! own halt flag and surfaces as `FailedChunk`; other workers stop at their
//! next claim. Completed chunks stay recorded. The caller's cancel flag is
//! only ever read, so the same options can drive the resume.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{debug, warn};
use veil_core::config::TransferConfig;
use veil_core::{ChunkRecord, VeilError, VeilResult};

use crate::session::TransferSession;

/// The per-chunk unit of work (seal + put, or fetch + open + write).
#[async_trait]
pub trait ChunkTask: Send + Sync + 'static {
    async fn process(&self, index: u64) -> VeilResult<ChunkRecord>;
}

pub type RecordFn = Arc<dyn Fn(&ChunkRecord) + Send + Sync>;

#[derive(Clone, Default)]
pub struct PoolHooks {
    /// Caller cancellation, checked before every claim. Never written here.
    pub cancel: Arc<AtomicBool>,
    /// Called after each completion is recorded
    pub on_record: Option<RecordFn>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolReport {
    /// Indices processed by this run, sorted
    pub processed: Vec<u64>,
    /// Indices skipped because they were already complete
    pub skipped: u64,
}

#[derive(Debug, Clone)]
pub struct WorkerPool {
    concurrency: usize,
    retry: TransferConfig,
}

impl WorkerPool {
    pub fn from_config(cfg: &TransferConfig) -> Self {
        Self {
            concurrency: cfg.effective_concurrency().max(1),
            retry: cfg.clone(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub async fn run(
        &self,
        session: Arc<TransferSession>,
        task: Arc<dyn ChunkTask>,
        hooks: PoolHooks,
    ) -> VeilResult<PoolReport> {
        let total = session.chunks()?.total();
        if total == 0 {
            return Ok(PoolReport::default());
        }
        let workers = self.concurrency.min(total as usize);
        let cursor = Arc::new(AtomicU64::new(0));
        let halt = Arc::new(AtomicBool::new(false));
        let report = Arc::new(Mutex::new(PoolReport::default()));

        debug!(session = %session.id(), total, workers, "worker pool starting");

        let mut set = JoinSet::new();
        for worker in 0..workers {
            let w = Worker {
                id: worker,
                total,
                session: session.clone(),
                task: task.clone(),
                hooks: hooks.clone(),
                cursor: cursor.clone(),
                halt: halt.clone(),
                report: report.clone(),
                retry: self.retry.clone(),
            };
            set.spawn(w.run());
        }

        let mut failure: Option<VeilError> = None;
        while let Some(joined) = set.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(VeilError::Other(anyhow::anyhow!("chunk worker panicked: {e}")))
            });
            if let Err(e) = result {
                halt.store(true, Ordering::SeqCst);
                // Prefer the real failure over the Cancelled it caused elsewhere.
                let replace = match &failure {
                    None => true,
                    Some(VeilError::Cancelled) => !matches!(e, VeilError::Cancelled),
                    Some(_) => false,
                };
                if replace {
                    failure = Some(e);
                }
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }

        let mut report = std::mem::take(&mut *report.lock().unwrap_or_else(|p| p.into_inner()));
        report.processed.sort_unstable();
        Ok(report)
    }
}

struct Worker {
    id: usize,
    total: u64,
    session: Arc<TransferSession>,
    task: Arc<dyn ChunkTask>,
    hooks: PoolHooks,
    cursor: Arc<AtomicU64>,
    /// Set by the first worker whose chunk fails for good
    halt: Arc<AtomicBool>,
    report: Arc<Mutex<PoolReport>>,
    retry: TransferConfig,
}

impl Worker {
    fn stopped(&self) -> bool {
        self.hooks.cancel.load(Ordering::SeqCst) || self.halt.load(Ordering::SeqCst)
    }

    async fn run(self) -> VeilResult<()> {
        let map = self.session.chunks()?;
        loop {
            if self.stopped() {
                return Err(VeilError::Cancelled);
            }
            let index = self.cursor.fetch_add(1, Ordering::AcqRel);
            if index >= self.total {
                return Ok(());
            }
            if map.is_complete(index) {
                self.report.lock().unwrap_or_else(|p| p.into_inner()).skipped += 1;
                continue;
            }

            let task = self.task.clone();
            let outcome = with_retries(&self.retry, || self.stopped(), &format!("chunk {index}"), || {
                let task = task.clone();
                async move { task.process(index).await }
            })
            .await;

            let record = match outcome {
                Ok(record) => record,
                Err(VeilError::Cancelled) => return Err(VeilError::Cancelled),
                Err(cause) => {
                    self.halt.store(true, Ordering::SeqCst);
                    warn!(worker = self.id, index, "chunk failed: {cause}");
                    return Err(VeilError::FailedChunk {
                        index,
                        cause: Box::new(cause),
                    });
                }
            };
            if record.index != index {
                return Err(VeilError::SessionCorrupt(format!(
                    "task for chunk {index} returned record for {}",
                    record.index
                )));
            }

            map.record(record.clone())?;
            self.report
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .processed
                .push(index);
            if let Some(cb) = &self.hooks.on_record {
                cb(&record);
            }
        }
    }
}

/// Run `op`, retrying retryable errors up to `cfg.max_retries` times.
/// `stopped` is polled after every backoff.
pub async fn with_retries<T, S, F, Fut>(
    cfg: &TransferConfig,
    stopped: S,
    what: &str,
    mut op: F,
) -> VeilResult<T>
where
    S: Fn() -> bool,
    F: FnMut() -> Fut,
    Fut: Future<Output = VeilResult<T>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < cfg.max_retries => {
                attempt += 1;
                let delay = cfg.backoff_for(attempt);
                debug!(what, attempt, delay_ms = delay.as_millis() as u64, "retrying: {e}");
                tokio::time::sleep(delay).await;
                if stopped() {
                    return Err(VeilError::Cancelled);
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestFields;
    use crate::session::SourceFingerprint;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicU32;
    use veil_chunks::address_of;

    fn session(total: u64) -> Arc<TransferSession> {
        Arc::new(TransferSession::new_upload(
            "alice",
            ManifestFields {
                filename: "f".into(),
                mime_type: "application/octet-stream".into(),
                file_size: total,
                chunk_size: 1,
                total_chunks: total,
                uploader: "alice".into(),
            },
            SourceFingerprint {
                path: PathBuf::from("/tmp/f"),
                size: total,
                modified: None,
            },
        ))
    }

    fn fast_retry() -> TransferConfig {
        TransferConfig {
            concurrency: 4,
            max_retries: 2,
            retry_backoff_ms: 1,
            retry_backoff_max_ms: 2,
            ..Default::default()
        }
    }

    fn rec(index: u64) -> ChunkRecord {
        ChunkRecord {
            index,
            content_address: address_of(&index.to_le_bytes()),
            size: 29,
        }
    }

    struct Ok1;

    #[async_trait]
    impl ChunkTask for Ok1 {
        async fn process(&self, index: u64) -> VeilResult<ChunkRecord> {
            Ok(rec(index))
        }
    }

    /// Fails `fail_times` with a retryable error before succeeding.
    struct Flaky {
        fail_times: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ChunkTask for Flaky {
        async fn process(&self, index: u64) -> VeilResult<ChunkRecord> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.fail_times {
                return Err(VeilError::storage("503", true));
            }
            Ok(rec(index))
        }
    }

    struct FailAt(u64);

    #[async_trait]
    impl ChunkTask for FailAt {
        async fn process(&self, index: u64) -> VeilResult<ChunkRecord> {
            if index == self.0 {
                return Err(VeilError::AuthenticationFailure { index });
            }
            Ok(rec(index))
        }
    }

    #[tokio::test]
    async fn test_all_chunks_complete() {
        let s = session(10);
        let report = WorkerPool::from_config(&fast_retry())
            .run(s.clone(), Arc::new(Ok1), PoolHooks::default())
            .await
            .unwrap();
        assert_eq!(report.processed, (0..10).collect::<Vec<_>>());
        assert!(s.chunks().unwrap().all_done());
    }

    #[tokio::test]
    async fn test_skips_completed() {
        let s = session(5);
        s.record(rec(0)).unwrap();
        s.record(rec(3)).unwrap();
        let report = WorkerPool::from_config(&fast_retry())
            .run(s.clone(), Arc::new(Ok1), PoolHooks::default())
            .await
            .unwrap();
        assert_eq!(report.processed, vec![1, 2, 4]);
        assert_eq!(report.skipped, 2);
    }

    #[tokio::test]
    async fn test_transient_errors_retried() {
        let s = session(1);
        let task = Arc::new(Flaky {
            fail_times: 2,
            calls: AtomicU32::new(0),
        });
        WorkerPool::from_config(&fast_retry())
            .run(s.clone(), task.clone(), PoolHooks::default())
            .await
            .unwrap();
        assert_eq!(task.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_chunk() {
        let s = session(1);
        let task = Arc::new(Flaky {
            fail_times: 10,
            calls: AtomicU32::new(0),
        });
        let err = WorkerPool::from_config(&fast_retry())
            .run(s, task.clone(), PoolHooks::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VeilError::FailedChunk { index: 0, .. }));
        // first attempt + max_retries
        assert_eq!(task.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_crypto_failure_not_retried_and_aborts_pool() {
        let s = session(50);
        let hooks = PoolHooks::default();
        let err = WorkerPool::from_config(&fast_retry())
            .with_concurrency(1)
            .run(s.clone(), Arc::new(FailAt(7)), hooks.clone())
            .await
            .unwrap_err();
        match err {
            VeilError::FailedChunk { index, cause } => {
                assert_eq!(index, 7);
                assert!(matches!(*cause, VeilError::AuthenticationFailure { index: 7 }));
            }
            other => panic!("expected FailedChunk, got {other:?}"),
        }
        // The failure halts the run without touching the caller's flag.
        assert!(!hooks.cancel.load(Ordering::SeqCst));
        // Single worker: exactly 0..7 were recorded before the failure.
        assert_eq!(s.chunks().unwrap().completed(), 7);
    }

    #[tokio::test]
    async fn test_external_abort_cancels() {
        let s = session(5);
        let hooks = PoolHooks::default();
        hooks.cancel.store(true, Ordering::SeqCst);
        let err = WorkerPool::from_config(&fast_retry())
            .run(s, Arc::new(Ok1), hooks)
            .await
            .unwrap_err();
        assert!(matches!(err, VeilError::Cancelled));
    }

    #[tokio::test]
    async fn test_on_record_called_per_completion() {
        let s = session(6);
        let seen = Arc::new(AtomicU32::new(0));
        let counter = seen.clone();
        let hooks = PoolHooks {
            on_record: Some(Arc::new(move |_r: &ChunkRecord| {
                counter.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        };
        WorkerPool::from_config(&fast_retry())
            .run(s, Arc::new(Ok1), hooks)
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 6);
    }
}
