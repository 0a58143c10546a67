//! StepUpload behavior against the in-memory backend and transport.
//!
//! Every test builds its own store, scheduler and `TempDir`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio_test::assert_ok;

use artisync_core::{ArtifactId, SaveName};
use artisync_sync::{
    job::JobContext, scheduler::SchedulerSettings, CompletionSink, CustomSave, JobOutcome,
    MemoryBackend, MemoryStore, MemoryTransport, ProgressCallback, RecordingNotifier, SaveOutcome,
    StepUpload, TransferError, TransferStats, UploadRequest, UploadStrategy,
};

// ---------------------------------------------------------------------------
// Helper
// ---------------------------------------------------------------------------

struct Rig {
    scheduler: StepUpload,
    backend: Arc<MemoryBackend>,
    transport: Arc<MemoryTransport>,
    stats: Arc<TransferStats>,
    notifier: Arc<RecordingNotifier>,
    sink: CompletionSink,
    dir: TempDir,
}

impl Rig {
    fn file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name.replace('/', "_"));
        std::fs::write(&path, content).expect("write fixture");
        path
    }

    fn request(&self, name: &str, content: &str) -> UploadRequest {
        UploadRequest::new(name, self.file(name, content), content.len() as u64)
    }
}

fn rig_with(
    workers: usize,
    backend: MemoryBackend,
    transport: MemoryTransport,
    max_resubmits: u32,
) -> Rig {
    let backend = Arc::new(backend);
    let transport = Arc::new(transport);
    let stats = Arc::new(TransferStats::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let ctx = JobContext {
        backend: backend.clone(),
        transport: transport.clone(),
        stats: stats.clone(),
        notifier: notifier.clone(),
        silent: false,
    };
    let settings = SchedulerSettings {
        workers,
        resubmit_delay: Duration::from_millis(10),
        max_resubmits,
    };
    let sink = CompletionSink::start();
    Rig {
        scheduler: StepUpload::start(settings, ctx, sink.sender()),
        backend,
        transport,
        stats,
        notifier,
        sink,
        dir: TempDir::new().expect("tempdir"),
    }
}

fn rig(workers: usize, latency: Duration) -> Rig {
    let store = MemoryStore::new();
    rig_with(
        workers,
        MemoryBackend::new(store.clone()),
        MemoryTransport::new(store).with_latency(latency),
        3,
    )
}

// ---------------------------------------------------------------------------
// Pool limits
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn at_most_w_jobs_run_concurrently() {
    let rig = rig(3, Duration::from_millis(50));
    let completions: Vec<_> = (0..10)
        .map(|i| rig.scheduler.submit(rig.request(&format!("f{i}.txt"), "payload")))
        .collect();
    for completion in completions {
        assert_eq!(completion.await.expect("completion"), JobOutcome::Uploaded);
    }
    assert_eq!(rig.transport.max_in_flight(), 3);
    assert_eq!(rig.stats.summary().uploaded_bytes, 70);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_destination_never_runs_twice_at_once() {
    let rig = rig(4, Duration::from_millis(30));
    let first = rig.scheduler.submit(rig.request("shared.bin", "one"));
    let other = rig.scheduler.submit(rig.request("other.bin", "two"));
    let second = rig.scheduler.submit(rig.request("shared.bin", "one"));

    assert_eq!(first.await.expect("first"), JobOutcome::Uploaded);
    assert_eq!(other.await.expect("other"), JobOutcome::Uploaded);
    // Serialized behind the first job, so the object already exists.
    assert_eq!(second.await.expect("second"), JobOutcome::Deduped);
    assert_eq!(rig.transport.overlapping_uploads(), 0);
    assert_eq!(rig.transport.uploads().len(), 2);
}

// ---------------------------------------------------------------------------
// Failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn panicking_job_yields_one_failure_completion() {
    let rig = rig(2, Duration::ZERO);
    rig.transport.panic_matching("boom");
    let copy = rig.file("boom.bin", "data");

    let boom = rig
        .scheduler
        .submit(UploadRequest::new("boom.bin", copy.clone(), 4).copied(true));
    let ok = rig.scheduler.submit(rig.request("ok.bin", "data"));

    match boom.await.expect("boom completion") {
        JobOutcome::Failed(line) => assert!(line.contains("Panic"), "got: {line}"),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(ok.await.expect("ok completion"), JobOutcome::Uploaded);
    assert!(!copy.exists(), "temporary copy must be removed after a panic");
    assert!(rig.stats.summary().failed_files.contains("boom.bin"));
}

#[tokio::test]
async fn transfer_failure_surfaces_response_body_and_cleans_copy() {
    let rig = rig(2, Duration::ZERO);
    rig.transport.fail_matching("bad");
    let copy = rig.file("bad.bin", "data");

    let outcome = rig
        .scheduler
        .submit(UploadRequest::new("bad.bin", copy.clone(), 4).copied(true))
        .await
        .expect("completion");
    match outcome {
        JobOutcome::Failed(line) => {
            assert!(line.starts_with("Error uploading \"bad.bin\": HTTPError, "), "got: {line}");
            assert!(line.contains("<Code>InternalError</Code>"), "got: {line}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(!copy.exists());
}

#[tokio::test]
async fn stats_count_exactly_the_failed_jobs() {
    let rig = rig(3, Duration::ZERO);
    rig.transport.fail_matching("fail-");
    let names = ["a", "fail-b", "c", "fail-d", "e", "f"];
    let completions: Vec<_> = names
        .iter()
        .map(|name| rig.scheduler.submit(rig.request(name, "12345")))
        .collect();
    let mut failed = 0;
    for completion in completions {
        if !completion.await.expect("completion").is_success() {
            failed += 1;
        }
    }

    let summary = rig.stats.summary();
    assert_eq!(failed, 2);
    assert_eq!(summary.failed_files.len(), 2);
    assert_eq!(summary.uploaded_bytes, 4 * 5);
    assert_eq!(summary.total_bytes, 6 * 5);
    assert!(summary.deduped_files.is_empty());
}

// ---------------------------------------------------------------------------
// Resubmission
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transient_unavailability_is_resubmitted() {
    let rig = rig(2, Duration::ZERO);
    rig.backend.fail_unavailable("flaky.bin", 2);

    let outcome = rig
        .scheduler
        .submit(rig.request("flaky.bin", "data"))
        .await
        .expect("completion");
    assert_eq!(outcome, JobOutcome::Uploaded);
    let requests = rig.backend.upload_url_requests();
    assert_eq!(requests.iter().filter(|n| n.as_str() == "flaky.bin").count(), 3);
    assert!(rig.stats.summary().failed_files.is_empty());
}

#[tokio::test]
async fn resubmission_is_bounded() {
    let store = MemoryStore::new();
    let rig = rig_with(
        2,
        MemoryBackend::new(store.clone()),
        MemoryTransport::new(store),
        2,
    );
    rig.backend.fail_unavailable("down.bin", 10);
    let copy = rig.file("down.bin", "data");

    let outcome = rig
        .scheduler
        .submit(UploadRequest::new("down.bin", copy.clone(), 4).copied(true))
        .await
        .expect("completion");
    assert!(matches!(outcome, JobOutcome::Failed(_)), "got {outcome:?}");
    assert_eq!(rig.backend.upload_url_requests().len(), 3);
    assert!(rig.stats.summary().failed_files.contains("down.bin"));
    assert!(!copy.exists());
}

#[tokio::test]
async fn rejected_slot_is_not_resubmitted() {
    let rig = rig(1, Duration::ZERO);
    rig.backend.reject("nope.bin");
    let outcome = rig
        .scheduler
        .submit(rig.request("nope.bin", "x"))
        .await
        .expect("completion");
    assert!(!outcome.is_success());
    assert_eq!(rig.backend.upload_url_requests().len(), 1);
}

// ---------------------------------------------------------------------------
// Transfer details
// ---------------------------------------------------------------------------

#[tokio::test]
async fn relative_url_and_headers_reach_transport() {
    let store = MemoryStore::new();
    let backend = MemoryBackend::new(store.clone()).with_upload_headers(vec![
        "Content-MD5:abc==".to_string(),
        "x-amz-meta-origin:https://host:8443".to_string(),
    ]);
    let rig = rig_with(1, backend, MemoryTransport::new(store.clone()), 0);

    let completion = rig.scheduler.submit(rig.request("dir/f.txt", "hello"));
    assert_ok!(completion.await);

    let uploads = rig.transport.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].url, "memory://store/uploads/dir/f.txt");
    assert_eq!(
        uploads[0].headers,
        vec![
            ("Content-MD5".to_string(), "abc==".to_string()),
            ("x-amz-meta-origin".to_string(), "https://host:8443".to_string()),
        ]
    );
    assert_eq!(store.get("memory://store/uploads/dir/f.txt").as_deref(), Some(&b"hello"[..]));
}

#[tokio::test]
async fn existing_object_is_deduped_without_transfer() {
    let rig = rig(1, Duration::ZERO);
    rig.backend
        .store()
        .put("memory://store/uploads/known.bin", b"abc".to_vec());

    let outcome = rig
        .scheduler
        .submit(rig.request("known.bin", "abc").for_artifact(ArtifactId::from("art-1")))
        .await
        .expect("completion");
    assert_eq!(outcome, JobOutcome::Deduped);
    assert!(rig.transport.uploads().is_empty());
    let summary = rig.stats.summary();
    assert!(summary.deduped_files.contains("known.bin"));
    assert_eq!(summary.deduped_bytes, 3);
    assert_eq!(rig.notifier.events().len(), 1);
}

#[tokio::test]
async fn success_notifies_only_artifact_files() {
    let rig = rig(2, Duration::ZERO);
    let owned = rig
        .scheduler
        .submit(rig.request("owned.bin", "x").for_artifact(ArtifactId::from("art-7")));
    let loose = rig.scheduler.submit(rig.request("loose.bin", "y"));
    assert_ok!(owned.await);
    assert_ok!(loose.await);

    let events = rig.notifier.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].0, ArtifactId::from("art-7"));
    assert_eq!(events[0].1.as_str(), "owned.bin");
    assert_eq!(rig.stats.summary().artifact_files, 1);
}

// ---------------------------------------------------------------------------
// Custom strategy
// ---------------------------------------------------------------------------

struct QuotaSave;

#[async_trait]
impl CustomSave for QuotaSave {
    async fn save(&self, progress: ProgressCallback) -> Result<SaveOutcome, TransferError> {
        progress(2);
        Err(TransferError::Custom {
            kind: "HTTPError".into(),
            message: "403 Forbidden".into(),
            response_body: Some("<Error><Code>QuotaExceeded</Code></Error>".into()),
        })
    }
}

struct AlreadyThere;

#[async_trait]
impl CustomSave for AlreadyThere {
    async fn save(&self, _progress: ProgressCallback) -> Result<SaveOutcome, TransferError> {
        Ok(SaveOutcome { deduped: true })
    }
}

#[tokio::test]
async fn custom_save_error_reports_response_body() {
    let rig = rig(1, Duration::ZERO);
    let path = rig.file("custom.bin", "abcd");
    let outcome = rig
        .scheduler
        .submit(
            UploadRequest::new("custom.bin", path, 4)
                .with_strategy(UploadStrategy::Custom(Arc::new(QuotaSave))),
        )
        .await
        .expect("completion");
    assert_eq!(
        outcome,
        JobOutcome::Failed(
            "Error uploading \"custom.bin\": HTTPError, <Error><Code>QuotaExceeded</Code></Error>"
                .to_string()
        )
    );
    let summary = rig.stats.summary();
    assert!(summary.failed_files.contains("custom.bin"));
    assert_eq!(summary.uploaded_bytes, 0);
    assert!(rig.backend.upload_url_requests().is_empty());
}

#[tokio::test]
async fn custom_save_can_report_dedup() {
    let rig = rig(1, Duration::ZERO);
    let path = rig.file("c.bin", "abcd");
    let outcome = rig
        .scheduler
        .submit(
            UploadRequest::new("c.bin", path, 4)
                .with_strategy(UploadStrategy::Custom(Arc::new(AlreadyThere))),
        )
        .await
        .expect("completion");
    assert_eq!(outcome, JobOutcome::Deduped);
    assert!(rig.stats.summary().deduped_files.contains("c.bin"));
}

// ---------------------------------------------------------------------------
// Shutdown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shutdown_drains_queue_then_rejects() {
    let rig = rig(1, Duration::from_millis(5));
    let completions: Vec<_> = (0..4)
        .map(|i| rig.scheduler.submit(rig.request(&format!("q{i}"), "zz")))
        .collect();
    rig.scheduler.shutdown().await;

    for completion in completions {
        assert_eq!(assert_ok!(completion.await), JobOutcome::Uploaded);
    }
}

#[tokio::test]
async fn submit_after_shutdown_fails_with_one_event() {
    let rig = rig(2, Duration::ZERO);
    rig.scheduler.shutdown().await;
    let mut events = rig.sink.subscribe();
    let (batch, done) = rig.sink.open_batch(1);

    let copy = rig.file("late.bin", "zz");
    let late = rig
        .scheduler
        .submit(UploadRequest::new("late.bin", copy.clone(), 2).copied(true).in_batch(batch));

    let outcome = assert_ok!(late.await);
    assert!(
        matches!(&outcome, JobOutcome::Failed(line) if line.contains("shut down")),
        "got: {outcome:?}"
    );
    let event = assert_ok!(events.recv().await);
    assert_eq!(event.save_name, SaveName::from("late.bin"));
    assert_eq!(event.outcome, outcome);
    assert!(!assert_ok!(done.await).is_success());

    let summary = rig.stats.summary();
    assert!(summary.failed_files.contains("late.bin"));
    assert_eq!(summary.uploaded_bytes, 0);
    assert!(!copy.exists(), "temporary copy must be removed");
    assert!(rig.transport.uploads().is_empty());
}
