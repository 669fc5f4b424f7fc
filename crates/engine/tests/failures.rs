mod common;

use std::time::Duration;

use common::*;
use haul_engine::{EngineError, JobOptions, SubmitRequest};
use haul_protocol::{ChunkBounds, ChunkStatus, ErrorClass, JobStatus, TransferEvent};
use haul_state::StateStore;
use haul_transfer::{ObjectLocator, checksum_bytes};

fn ten_byte_chunks(parallelism: u32) -> JobOptions {
    JobOptions {
        parallelism: Some(parallelism),
        chunk_bounds: Some(ChunkBounds { min: 10, max: 10 }),
        ..JobOptions::default()
    }
}

#[tokio::test]
async fn permanent_error_fails_job_after_one_attempt() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = harness_at(dir.path(), fast_config());
    let (src, _) = write_source(dir.path(), "src.bin", 40);
    h.store.fail_part(2, &[Fault::Unauthorized]);

    let id = h
        .orch
        .submit(SubmitRequest::upload(path_str(&src), "bucket/denied.bin").with_options(ten_byte_chunks(1)))
        .await
        .unwrap();
    let snap = h.orch.wait(&id).await.unwrap();

    assert_eq!(snap.status, JobStatus::Failed);
    let failure = snap.failure.unwrap();
    assert_eq!(failure.class, ErrorClass::Permanent);
    assert_eq!(failure.chunk_index, Some(2));
    assert_eq!(snap.failed_range, Some((2, 2)));
    assert_eq!(snap.chunk_summary.completed, 2);

    assert_eq!(h.store.uploads_of(2).len(), 1);
    assert!(h.store.uploads_of(3).is_empty());
    // A failed upload keeps its session so it can be resubmitted.
    assert!(h.store.aborted().is_empty());

    let events = drain(&mut h.events);
    assert!(matches!(
        events.last(),
        Some(TransferEvent::Failed { failure, .. }) if failure.chunk_index == Some(2)
    ));
}

#[tokio::test]
async fn resubmit_continues_without_re_uploading_completed_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness_at(dir.path(), fast_config());
    let (src, data) = write_source(dir.path(), "src.bin", 40);
    h.store.fail_part(2, &[Fault::Unauthorized]);

    let failed = h
        .orch
        .submit(SubmitRequest::upload(path_str(&src), "bucket/again.bin").with_options(ten_byte_chunks(1)))
        .await
        .unwrap();
    assert_eq!(h.orch.wait(&failed).await.unwrap().status, JobStatus::Failed);

    h.store.clear_faults();
    let retry = h.orch.resubmit(&failed).unwrap();
    assert_ne!(retry, failed);
    let snap = h.orch.wait(&retry).await.unwrap();

    assert_eq!(snap.status, JobStatus::Completed);
    assert_eq!(h.store.uploads_of(0).len(), 1);
    assert_eq!(h.store.uploads_of(1).len(), 1);
    assert_eq!(h.store.uploads_of(2).len(), 2);
    assert_eq!(h.store.uploads_of(3).len(), 1);
    let object = ObjectLocator::parse("bucket/again.bin").unwrap();
    assert_eq!(std::fs::read(h.store.local().object_path(&object)).unwrap(), data);

    // The original job is left as it was.
    assert_eq!(h.orch.query(&failed).unwrap().status, JobStatus::Failed);
}

#[tokio::test]
async fn only_failed_jobs_can_be_resubmitted() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness_at(dir.path(), fast_config());
    let (src, _) = write_source(dir.path(), "src.bin", 20);

    let id = h
        .orch
        .submit(SubmitRequest::upload(path_str(&src), "bucket/ok.bin"))
        .await
        .unwrap();
    h.orch.wait(&id).await.unwrap();

    assert!(matches!(
        h.orch.resubmit(&id),
        Err(EngineError::InvalidRequest(_))
    ));
}

#[tokio::test]
async fn exhausted_transient_retries_fail_the_job() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness_at(dir.path(), fast_config());
    let object = ObjectLocator::parse("bucket/flaky.bin").unwrap();
    h.store.local().put_object(&object, &payload(40), None).await.unwrap();
    h.store.fail_read(10, &[Fault::Timeout; 5]);

    let dest = dir.path().join("flaky.bin");
    let id = h
        .orch
        .submit(SubmitRequest::download("bucket/flaky.bin", path_str(&dest)).with_options(ten_byte_chunks(4)))
        .await
        .unwrap();
    let snap = h.orch.wait(&id).await.unwrap();

    assert_eq!(snap.status, JobStatus::Failed);
    let failure = snap.failure.unwrap();
    assert_eq!(failure.class, ErrorClass::Transient);
    assert_eq!(failure.chunk_index, Some(1));

    let reads_of_chunk = h.store.read_calls().iter().filter(|c| c.key == 10).count();
    assert_eq!(reads_of_chunk, 5);
    let manifest = h.state.snapshot(&id).unwrap();
    assert_eq!(manifest.chunks[1].status, ChunkStatus::Failed);
    assert_eq!(manifest.chunks[1].attempts, 5);
}

#[tokio::test]
async fn stalled_chunk_times_out_and_is_retried() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config();
    config.chunk_timeout = Duration::from_millis(100);
    config.retry_policy.max_attempts = 2;
    let h = harness_at(dir.path(), config);
    let (src, _) = write_source(dir.path(), "src.bin", 20);
    h.store.gate_parts([1]);

    let id = h
        .orch
        .submit(SubmitRequest::upload(path_str(&src), "bucket/stall.bin").with_options(ten_byte_chunks(2)))
        .await
        .unwrap();
    let snap = h.orch.wait(&id).await.unwrap();

    assert_eq!(snap.status, JobStatus::Failed);
    let failure = snap.failure.unwrap();
    assert_eq!(failure.class, ErrorClass::Transient);
    assert_eq!(failure.chunk_index, Some(1));
    assert_eq!(h.store.uploads_of(1).len(), 2);
    assert_eq!(h.store.uploads_of(0).len(), 1);
}

#[tokio::test]
async fn whole_object_mismatch_refetches_once_then_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = harness_at(dir.path(), fast_config());
    let object = ObjectLocator::parse("bucket/bad.bin").unwrap();
    h.store.local().put_object(&object, &payload(40), None).await.unwrap();

    let dest = dir.path().join("bad.bin");
    let req = SubmitRequest::download("bucket/bad.bin", path_str(&dest)).with_options(JobOptions {
        expected_digest: Some(checksum_bytes(b"not the object")),
        ..ten_byte_chunks(4)
    });
    let id = h.orch.submit(req).await.unwrap();
    let snap = h.orch.wait(&id).await.unwrap();

    assert_eq!(snap.status, JobStatus::Failed);
    let failure = snap.failure.unwrap();
    assert_eq!(failure.class, ErrorClass::IntegrityMismatch);
    assert_eq!(failure.chunk_index, None);
    assert!(snap.final_digest.is_none());

    for offset in [0u64, 10, 20, 30] {
        let reads = h.store.read_calls().iter().filter(|c| c.key == offset).count();
        assert_eq!(reads, 2, "offset {offset}");
    }
    assert!(
        drain(&mut h.events)
            .iter()
            .any(|e| matches!(e, TransferEvent::Failed { failure, .. } if failure.class == ErrorClass::IntegrityMismatch))
    );
}

#[tokio::test]
async fn matching_expected_digest_completes_download() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness_at(dir.path(), fast_config());
    let object = ObjectLocator::parse("bucket/good.bin").unwrap();
    let data = payload(40);
    h.store.local().put_object(&object, &data, None).await.unwrap();

    let dest = dir.path().join("good.bin");
    let req = SubmitRequest::download("bucket/good.bin", path_str(&dest)).with_options(JobOptions {
        expected_digest: Some(checksum_bytes(&data).to_uppercase()),
        ..ten_byte_chunks(4)
    });
    let id = h.orch.submit(req).await.unwrap();
    let snap = h.orch.wait(&id).await.unwrap();

    assert_eq!(snap.status, JobStatus::Completed);
    assert_eq!(h.store.read_calls().len(), 4);
}

#[tokio::test]
async fn pause_after_a_chunk_gave_up_still_fails_the_job() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness_at(dir.path(), fast_config());
    let (src, _) = write_source(dir.path(), "src.bin", 40);
    h.store.gate_parts([0]);
    h.store.fail_part(1, &[Fault::Unauthorized]);

    let id = h
        .orch
        .submit(SubmitRequest::upload(path_str(&src), "bucket/denied.bin").with_options(ten_byte_chunks(2)))
        .await
        .unwrap();
    h.store.wait_gated(1).await;
    while h.state.snapshot(&id).unwrap().job.failure.is_none() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Part 0 is still in flight when the pause lands.
    h.orch.pause(&id).unwrap();
    h.store.release(1);
    let snap = h.orch.wait(&id).await.unwrap();

    assert_eq!(snap.status, JobStatus::Failed);
    let failure = snap.failure.unwrap();
    assert_eq!(failure.class, ErrorClass::Permanent);
    assert_eq!(failure.chunk_index, Some(1));

    h.orch.resume(&id).unwrap();
    assert_eq!(h.orch.query(&id).unwrap().status, JobStatus::Failed);
    assert_eq!(h.store.uploads_of(1).len(), 1);
}

#[tokio::test]
async fn upload_accepts_plain_sha256_of_the_source() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness_at(dir.path(), fast_config());
    let (src, data) = write_source(dir.path(), "src.bin", 40);

    let id = h
        .orch
        .submit(
            SubmitRequest::upload(path_str(&src), "bucket/plain.bin").with_options(JobOptions {
                expected_digest: Some(checksum_bytes(&data)),
                ..ten_byte_chunks(2)
            }),
        )
        .await
        .unwrap();
    let snap = h.orch.wait(&id).await.unwrap();

    assert_eq!(snap.status, JobStatus::Completed);
    assert_eq!(snap.chunk_summary.total, 4);
    // Verified without a second pass over the parts.
    assert_eq!(h.store.upload_calls().len(), 4);
    let object = ObjectLocator::parse("bucket/plain.bin").unwrap();
    assert_eq!(std::fs::read(h.store.local().object_path(&object)).unwrap(), data);
}

#[tokio::test]
async fn upload_with_wrong_plain_digest_fails_after_one_re_upload() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness_at(dir.path(), fast_config());
    let (src, _) = write_source(dir.path(), "src.bin", 40);

    let id = h
        .orch
        .submit(
            SubmitRequest::upload(path_str(&src), "bucket/wrong.bin").with_options(JobOptions {
                expected_digest: Some(checksum_bytes(b"something else")),
                ..ten_byte_chunks(2)
            }),
        )
        .await
        .unwrap();
    let snap = h.orch.wait(&id).await.unwrap();

    assert_eq!(snap.status, JobStatus::Failed);
    let failure = snap.failure.unwrap();
    assert_eq!(failure.class, ErrorClass::IntegrityMismatch);
    assert!(failure.message.contains("file digest"), "{}", failure.message);
    assert_eq!(h.store.upload_calls().len(), 8);
}
