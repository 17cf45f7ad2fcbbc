//! Interrupted uploads and downloads resume from their last snapshot and
//! transfer only the chunks that are still missing.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::*;
use veil_core::VeilError;
use veil_storage::blob_path;
use veil_transfer::session::KEY_ALIAS_FIELDS;
use veil_transfer::{Manifest, SessionPhase, TransferOptions};

fn serial() -> TransferOptions {
    TransferOptions {
        concurrency: Some(1),
        ..Default::default()
    }
}

#[tokio::test]
async fn upload_resumes_after_failed_chunk() {
    let h = Harness::new();
    let alice = signer(1, "alice");
    let original = patterned(10 * MB);
    let src = write_test_file(h.dir.path(), "ten.bin", &original);

    // Storage accepts three chunks, then refuses.
    let flaky = h.engine_with_sink(Arc::new(FlakySink::new(h.op.clone(), 3)));
    let err = flaky.upload(&src, &alice, &serial()).await.unwrap_err();
    match err {
        VeilError::FailedChunk { index, .. } => assert_eq!(index, 3),
        other => panic!("expected FailedChunk, got {other:?}"),
    }

    let sessions = flaky.sessions().unwrap();
    assert_eq!(sessions.len(), 1);
    let snap = &sessions[0];
    assert_eq!(snap.phase, SessionPhase::Aborted);
    assert_eq!(snap.aborted_from, Some(SessionPhase::Uploading));
    let done: Vec<u64> = snap.completed_chunks.iter().map(|c| c.index).collect();
    assert_eq!(done, vec![0, 1, 2]);

    let raw = std::fs::read_to_string(h.store().path_for(&snap.id)).unwrap();
    for alias in KEY_ALIAS_FIELDS {
        assert!(!raw.contains(&format!("\"{alias}\"")), "snapshot carries {alias}");
    }
    assert!(raw.contains("ownerEncapsulatedKey"));

    // Same backend, healthy sink.
    let engine = h.engine();
    let outcome = engine.resume_upload(&snap.id, &alice, &serial()).await.unwrap();
    assert_eq!(outcome.transferred, vec![3, 4]);
    assert_eq!(outcome.total_chunks, 5);
    assert!(outcome.registered);

    let fetched = engine.fetcher().fetch(&outcome.manifest_address).await.unwrap();
    let manifest = Manifest::from_bytes(&fetched.bytes).unwrap();
    let indices: Vec<u64> = manifest.chunks.iter().map(|c| c.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    assert_eq!(manifest.file_size, original.len() as u64);
    assert_eq!(manifest.uploader, "alice");

    let dest = h.path("ten.out");
    engine
        .download(&outcome.manifest_address, "alice", &dest, &alice, &TransferOptions::default())
        .await
        .unwrap();
    assert_eq!(std::fs::read(&dest).unwrap(), original);
}

#[tokio::test]
async fn failed_upload_resumes_with_the_same_options() {
    let h = Harness::new();
    let alice = signer(1, "alice");
    let src = write_test_file(h.dir.path(), "ten.bin", &patterned(10 * MB));
    let opts = serial();

    let flaky = h.engine_with_sink(Arc::new(FlakySink::new(h.op.clone(), 3)));
    let err = flaky.upload(&src, &alice, &opts).await.unwrap_err();
    assert!(matches!(err, VeilError::FailedChunk { index: 3, .. }), "got {err:?}");
    assert!(!opts.cancel.load(Ordering::SeqCst), "chunk failure leaked into cancel");

    let id = flaky.sessions().unwrap()[0].id.clone();
    let outcome = h.engine().resume_upload(&id, &alice, &opts).await.unwrap();
    assert_eq!(outcome.transferred, vec![3, 4]);
    assert!(!opts.cancel.load(Ordering::SeqCst));
}

#[tokio::test]
async fn resume_refuses_modified_source() {
    let h = Harness::new();
    let alice = signer(1, "alice");
    let src = write_test_file(h.dir.path(), "doc.bin", &patterned(5 * MB));

    let flaky = h.engine_with_sink(Arc::new(FlakySink::new(h.op.clone(), 1)));
    flaky.upload(&src, &alice, &serial()).await.unwrap_err();
    let id = flaky.sessions().unwrap()[0].id.clone();

    std::fs::write(&src, patterned(5 * MB + 7)).unwrap();
    let err = h.engine().resume_upload(&id, &alice, &serial()).await.unwrap_err();
    assert!(matches!(err, VeilError::SessionCorrupt(_)), "got {err:?}");
}

#[tokio::test]
async fn resume_requires_the_same_principal() {
    let h = Harness::new();
    let alice = signer(1, "alice");
    let src = write_test_file(h.dir.path(), "doc.bin", &patterned(3 * MB));

    let flaky = h.engine_with_sink(Arc::new(FlakySink::new(h.op.clone(), 0)));
    flaky.upload(&src, &alice, &serial()).await.unwrap_err();
    let id = flaky.sessions().unwrap()[0].id.clone();

    let mallory = signer(9, "mallory");
    let err = h.engine().resume_upload(&id, &mallory, &serial()).await.unwrap_err();
    assert!(matches!(err, VeilError::SessionCorrupt(_)));
}

#[tokio::test]
async fn cancelled_upload_parks_session() {
    let h = Harness::new();
    let alice = signer(1, "alice");
    let src = write_test_file(h.dir.path(), "doc.bin", &patterned(4 * MB));
    let engine = h.engine();

    let opts = TransferOptions::default();
    opts.cancel.store(true, Ordering::SeqCst);
    let err = engine.upload(&src, &alice, &opts).await.unwrap_err();
    assert!(matches!(err, VeilError::Cancelled));

    let snap = &engine.sessions().unwrap()[0];
    assert_eq!(snap.phase, SessionPhase::Aborted);
    assert!(snap.completed_chunks.is_empty());

    let outcome = engine
        .resume_upload(&snap.id, &alice, &TransferOptions::default())
        .await
        .unwrap();
    assert_eq!(outcome.transferred, vec![0, 1]);
}

#[tokio::test]
async fn download_resumes_after_missing_blob() {
    let h = Harness::new();
    let alice = signer(1, "alice");
    let original = patterned(9 * MB + 123);
    let src = write_test_file(h.dir.path(), "nine.bin", &original);
    let engine = h.engine();

    let up = engine.upload(&src, &alice, &TransferOptions::default()).await.unwrap();
    assert_eq!(up.total_chunks, 5);

    let fetched = engine.fetcher().fetch(&up.manifest_address).await.unwrap();
    let manifest = Manifest::from_bytes(&fetched.bytes).unwrap();
    let victim = blob_path(PREFIX, &manifest.chunks[2].content_address);
    let stash = h.op.read(&victim).await.unwrap().to_vec();
    h.op.delete(&victim).await.unwrap();

    let dest = h.path("nine.out");
    let err = engine
        .download(&up.manifest_address, "alice", &dest, &alice, &serial())
        .await
        .unwrap_err();
    assert!(matches!(err, VeilError::FailedChunk { index: 2, .. }), "got {err:?}");
    assert!(!dest.exists());

    let snap = engine
        .sessions()
        .unwrap()
        .into_iter()
        .find(|s| s.phase == SessionPhase::Aborted)
        .unwrap();
    assert_eq!(snap.completed(), 2);

    h.op.write(&victim, stash).await.unwrap();
    let outcome = engine.resume_download(&snap.id, &alice, &serial()).await.unwrap();
    assert_eq!(outcome.transferred, vec![2, 3, 4]);
    assert_eq!(std::fs::read(&dest).unwrap(), original);
}

#[tokio::test]
async fn download_resume_without_part_file_is_corrupt() {
    let h = Harness::new();
    let alice = signer(1, "alice");
    let src = write_test_file(h.dir.path(), "six.bin", &patterned(6 * MB));
    let engine = h.engine();
    let up = engine.upload(&src, &alice, &TransferOptions::default()).await.unwrap();

    let fetched = engine.fetcher().fetch(&up.manifest_address).await.unwrap();
    let manifest = Manifest::from_bytes(&fetched.bytes).unwrap();
    let victim = blob_path(PREFIX, &manifest.chunks[1].content_address);
    h.op.delete(&victim).await.unwrap();

    let dest = h.path("six.out");
    engine
        .download(&up.manifest_address, "alice", &dest, &alice, &serial())
        .await
        .unwrap_err();
    let snap = engine
        .sessions()
        .unwrap()
        .into_iter()
        .find(|s| s.phase == SessionPhase::Aborted)
        .unwrap();

    std::fs::remove_file(veil_transfer::engine::part_path(&dest)).unwrap();
    let err = engine.resume_download(&snap.id, &alice, &serial()).await.unwrap_err();
    assert!(matches!(err, VeilError::SessionCorrupt(_)));
}

#[tokio::test]
async fn empty_file_roundtrip() {
    let h = Harness::new();
    let alice = signer(1, "alice");
    let src = write_test_file(h.dir.path(), "empty.txt", b"");
    let engine = h.engine();

    let up = engine.upload(&src, &alice, &TransferOptions::default()).await.unwrap();
    assert_eq!(up.total_chunks, 1);
    assert_eq!(up.file_size, 0);

    let dest = h.path("empty.out");
    let down = engine
        .download(&up.manifest_address, "alice", &dest, &alice, &TransferOptions::default())
        .await
        .unwrap();
    assert_eq!(down.file_size, 0);
    assert_eq!(std::fs::read(&dest).unwrap(), Vec::<u8>::new());
}

#[tokio::test]
async fn progress_reports_every_chunk() {
    let h = Harness::new();
    let alice = signer(1, "alice");
    let src = write_test_file(h.dir.path(), "p.bin", &patterned(7 * MB));
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    let opts = TransferOptions {
        progress: Some(Arc::new(move |done: u64, total: u64| {
            sink.lock().unwrap().push((done, total));
        })),
        concurrency: Some(1),
        ..Default::default()
    };

    h.engine().upload(&src, &alice, &opts).await.unwrap();
    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen, vec![(1u64, 4u64), (2, 4), (3, 4), (4, 4)]);
}
