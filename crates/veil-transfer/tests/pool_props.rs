//! Worker pool property: every index is processed exactly once, whatever
//! the chunk count and worker count.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use proptest::prelude::*;
use veil_core::config::TransferConfig;
use veil_core::{ChunkRecord, VeilResult};
use veil_transfer::{
    ChunkTask, ManifestFields, PoolHooks, SourceFingerprint, TransferSession, WorkerPool,
};

/// Records every index it is handed and yields between claims.
struct Tally(Mutex<Vec<u64>>);

#[async_trait]
impl ChunkTask for Tally {
    async fn process(&self, index: u64) -> VeilResult<ChunkRecord> {
        tokio::task::yield_now().await;
        self.0.lock().unwrap().push(index);
        Ok(ChunkRecord {
            index,
            content_address: veil_chunks::address_of(&index.to_be_bytes()),
            size: 28,
        })
    }
}

fn session(total: u64) -> Arc<TransferSession> {
    Arc::new(TransferSession::new_upload(
        "alice",
        ManifestFields {
            filename: "p".into(),
            mime_type: "application/octet-stream".into(),
            file_size: total,
            chunk_size: 1,
            total_chunks: total,
            uploader: "alice".into(),
        },
        SourceFingerprint {
            path: PathBuf::from("/dev/null"),
            size: total,
            modified: None,
        },
    ))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn each_index_claimed_exactly_once(total in 1u64..40, workers_seed in 1usize..40) {
        let workers = 1 + (workers_seed - 1) % total as usize;
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .unwrap();

        let s = session(total);
        let tally = Arc::new(Tally(Mutex::new(Vec::new())));
        let pool = WorkerPool::from_config(&TransferConfig::default()).with_concurrency(workers);
        let report = rt
            .block_on(pool.run(s.clone(), tally.clone(), PoolHooks::default()))
            .unwrap();

        let seen = tally.0.lock().unwrap().clone();
        let unique: HashSet<u64> = seen.iter().copied().collect();
        prop_assert_eq!(seen.len() as u64, total);
        prop_assert_eq!(unique.len() as u64, total);
        prop_assert_eq!(report.processed, (0..total).collect::<Vec<_>>());
        prop_assert!(s.chunks().unwrap().all_done());
    }

    #[test]
    fn resume_processes_only_missing(total in 2u64..30, done_mask in any::<u32>()) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();

        let s = session(total);
        let mut expected = Vec::new();
        for i in 0..total {
            if done_mask & (1 << (i % 32)) != 0 {
                s.record(ChunkRecord {
                    index: i,
                    content_address: veil_chunks::address_of(&i.to_be_bytes()),
                    size: 28,
                })
                .unwrap();
            } else {
                expected.push(i);
            }
        }

        let tally = Arc::new(Tally(Mutex::new(Vec::new())));
        let pool = WorkerPool::from_config(&TransferConfig::default()).with_concurrency(3);
        let report = rt
            .block_on(pool.run(s.clone(), tally.clone(), PoolHooks::default()))
            .unwrap();

        prop_assert_eq!(report.processed, expected);
        prop_assert_eq!(report.skipped as usize + tally.0.lock().unwrap().len(), total as usize);
    }
}
