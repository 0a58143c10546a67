//! Manifest building and cross-artifact dedup for `artisync-core`.
//!
//! Each test gets its own `DigestCache` and `TempDir`; nothing is shared.

use std::fs;
use std::sync::Arc;

use artisync_core::{
    hash::digest_bytes, Artifact, ArtifactError, ArtifactId, ContentOwner, ContentSource,
    DigestCache, Reservation,
};
use rstest::rstest;
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helper
// ---------------------------------------------------------------------------

fn artifact(name: &str, cache: &Arc<DigestCache>, staging: &TempDir) -> Artifact {
    Artifact::new(name, "dataset", cache.clone()).with_staging_dir(staging.path())
}

fn write(dir: &TempDir, filename: &str, content: &str) -> std::path::PathBuf {
    let path = dir.path().join(filename);
    fs::write(&path, content).expect("write fixture");
    path
}

// ---------------------------------------------------------------------------
// Within one artifact
// ---------------------------------------------------------------------------

#[test]
fn same_content_twice_is_two_entries_one_upload() {
    let cache = Arc::new(DigestCache::new());
    let staging = TempDir::new().expect("staging");
    let data = TempDir::new().expect("data");
    let file = write(&data, "t1.json", r#"{"a": 1}"#);

    let mut art = artifact("a1", &cache, &staging);
    art.add_file("t1.json", &file).expect("first add");
    art.add_file("t2.json", &file).expect("second add");

    let manifest = art.manifest();
    assert_eq!(manifest.len(), 2);
    assert!(manifest.entries().all(|e| e.reference.is_none()));
    assert_eq!(
        manifest.get("t1.json").expect("t1").digest,
        manifest.get("t2.json").expect("t2").digest
    );

    let uploads = manifest.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].paths, vec!["t1.json", "t2.json"]);
    assert_eq!(cache.len(), 1);
}

#[test]
fn duplicate_path_fails_before_hashing() {
    let cache = Arc::new(DigestCache::new());
    let staging = TempDir::new().expect("staging");
    let mut art = artifact("a1", &cache, &staging);
    art.add_bytes("x.txt", "hello").expect("add");

    // The second source does not exist: the path check must win.
    let err = art
        .add_file("./x.txt", "/definitely/not/here")
        .expect_err("duplicate path");
    assert!(
        matches!(&err, ArtifactError::DuplicatePath { path } if path == "x.txt"),
        "got: {err}"
    );
}

#[test]
fn staged_bytes_share_one_copy_per_digest() {
    let cache = Arc::new(DigestCache::new());
    let staging = TempDir::new().expect("staging");
    let mut art = artifact("a1", &cache, &staging);
    art.add_bytes("a.txt", "hello").expect("a");
    art.add_bytes("b.txt", "hello").expect("b");

    let staged = art.manifest().staged_paths();
    assert_eq!(staged.len(), 1);
    assert!(staged[0].starts_with(staging.path()));
    assert_eq!(fs::read_to_string(&staged[0]).expect("read copy"), "hello");
}

#[test]
fn staged_file_is_copied_into_staging_dir() {
    let cache = Arc::new(DigestCache::new());
    let staging = TempDir::new().expect("staging");
    let data = TempDir::new().expect("data");
    let file = write(&data, "model.bin", "weights");

    let mut art = artifact("a1", &cache, &staging);
    let entry = art
        .add("model.bin", ContentSource::StagedFile(file.clone()))
        .expect("add")
        .clone();

    assert!(entry.staged);
    let local = entry.local_path.expect("local path");
    assert_ne!(local, file);
    assert!(local.starts_with(staging.path().join(art.client_id().as_str())));
    assert!(file.exists(), "original must be left alone");
}

// ---------------------------------------------------------------------------
// Across artifacts
// ---------------------------------------------------------------------------

#[test]
fn second_artifact_references_committed_owner() {
    let cache = Arc::new(DigestCache::new());
    let staging = TempDir::new().expect("staging");
    let data = TempDir::new().expect("data");
    let file = write(&data, "t1.json", "shared");

    let mut first = artifact("a1", &cache, &staging);
    first.add_file("t1.json", &file).expect("first");
    first.add_file("t2.json", &file).expect("first dup");
    let confirmed = cache.confirm(
        &digest_bytes(b"shared"),
        ContentOwner {
            artifact: first.client_id().clone(),
            path: "t1.json".into(),
            size: 6,
        },
    );
    assert!(confirmed);

    let mut second = artifact("a2", &cache, &staging);
    let entry = second.add_file("copy.json", &file).expect("second").clone();

    assert!(entry.digest.is_none());
    assert_eq!(
        entry.reference.as_deref(),
        Some(format!("artisync-artifact://{}/t1.json", first.client_id()).as_str())
    );
    assert_eq!(entry.size, Some(6));
    assert!(second.manifest().uploads().is_empty());

    // The owner keeps its content entries.
    assert!(first.manifest().entries().all(|e| e.reference.is_none()));
}

#[test]
fn uncommitted_owner_hands_out_no_reference() {
    let cache = Arc::new(DigestCache::new());
    let staging = TempDir::new().expect("staging");

    let mut first = artifact("a1", &cache, &staging);
    first.add_bytes("t1.json", "shared content").expect("first");
    let mut second = artifact("a2", &cache, &staging);
    let entry = second
        .add_bytes("copy.json", "shared content")
        .expect("second")
        .clone();

    assert!(entry.reference.is_none());
    assert_eq!(entry.digest, Some(digest_bytes(b"shared content")));
    assert_eq!(second.manifest().uploads().len(), 1);
    assert!(entry
        .local_path
        .expect("own copy")
        .starts_with(staging.path().join(second.client_id().as_str())));
}

#[test]
fn dropping_unlogged_artifact_releases_reservations_and_copies() {
    let cache = Arc::new(DigestCache::new());
    let staging = TempDir::new().expect("staging");

    let mut first = artifact("a1", &cache, &staging);
    first.add_bytes("t1.json", "shared content").expect("first");
    let copies = staging.path().join(first.client_id().as_str());
    assert!(copies.exists());
    assert_eq!(cache.len(), 1);

    drop(first);
    assert!(cache.is_empty());
    assert!(!copies.exists());

    let mut second = artifact("a2", &cache, &staging);
    second
        .add_bytes("copy.json", "shared content")
        .expect("second");
    assert_eq!(
        cache.reserve(
            &digest_bytes(b"shared content"),
            ContentOwner {
                artifact: ArtifactId::from("a3"),
                path: "x".into(),
                size: 14,
            },
        ),
        Reservation::InFlight(ContentOwner {
            artifact: second.client_id().clone(),
            path: "copy.json".into(),
            size: 14,
        })
    );
}

#[test]
fn reservation_is_released_after_failed_owner() {
    let cache = Arc::new(DigestCache::new());
    let staging = TempDir::new().expect("staging");

    let mut first = artifact("a1", &cache, &staging);
    first.add_bytes("f.txt", "hello").expect("first");
    assert_eq!(cache.release_artifact(first.client_id()), 1);

    let mut second = artifact("a2", &cache, &staging);
    let entry = second.add_bytes("f.txt", "hello").expect("second").clone();
    assert!(entry.reference.is_none());
    assert_eq!(entry.digest, Some(digest_bytes(b"hello")));
}

#[test]
fn reference_entries_are_not_reserved() {
    let cache = Arc::new(DigestCache::new());
    let staging = TempDir::new().expect("staging");
    let mut art = artifact("a1", &cache, &staging);
    art.add_reference("remote.csv", "s3://bucket/remote.csv", None)
        .expect("reference");
    assert!(cache.is_empty());

    let digest = digest_bytes(b"other");
    let owner = ContentOwner {
        artifact: art.client_id().clone(),
        path: "x".into(),
        size: 5,
    };
    assert_eq!(cache.reserve(&digest, owner), Reservation::Reserved);
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

#[rstest]
#[case("artisync-artifact://abc/t1.json")]
#[case("file:///data/x.csv")]
#[case("http://host/x")]
#[case("https://host/x")]
#[case("s3://bucket/key")]
#[case("gs://bucket/key")]
#[case("az://account/container/blob")]
fn supported_reference_schemes(#[case] uri: &str) {
    let cache = Arc::new(DigestCache::new());
    let staging = TempDir::new().expect("staging");
    let mut art = artifact("a1", &cache, &staging);
    let entry = art.add_reference("r", uri, Some(1)).expect("supported");
    assert_eq!(entry.reference.as_deref(), Some(uri));
    assert!(entry.digest.is_none());
}

#[rstest]
#[case("ftp://host/x", "ftp")]
#[case("hdfs://cluster/path", "hdfs")]
fn unsupported_reference_scheme(#[case] uri: &str, #[case] expected: &str) {
    let cache = Arc::new(DigestCache::new());
    let staging = TempDir::new().expect("staging");
    let mut art = artifact("a1", &cache, &staging);
    let err = art.add_reference("r", uri, None).expect_err("unsupported");
    assert!(
        matches!(&err, ArtifactError::UnsupportedProvider { scheme, .. } if scheme == expected),
        "got: {err}"
    );
    assert!(art.manifest().is_empty());
}

#[test]
fn reference_without_scheme_is_invalid() {
    let cache = Arc::new(DigestCache::new());
    let staging = TempDir::new().expect("staging");
    let mut art = artifact("a1", &cache, &staging);
    let err = art
        .add_reference("r", "bucket/key", None)
        .expect_err("no scheme");
    assert!(matches!(err, ArtifactError::InvalidReference { .. }), "got: {err}");
}

#[rstest]
#[case(&["v1", "best"], true)]
#[case(&["run/1"], false)]
#[case(&["ok", "a:b"], false)]
fn alias_validation(#[case] aliases: &[&str], #[case] valid: bool) {
    let cache = Arc::new(DigestCache::new());
    let art = Artifact::new("a1", "model", cache).with_aliases(aliases.iter().copied());
    let result = art.validate();
    assert_eq!(result.is_ok(), valid, "aliases {aliases:?}: {result:?}");
    if let Err(err) = result {
        assert!(err
            .to_string()
            .contains("Aliases must not contain any of the following characters: /, :"));
    }
}

#[test]
fn into_parts_hands_over_manifest_and_cache() {
    let cache = Arc::new(DigestCache::new());
    let staging = TempDir::new().expect("staging");
    let mut art = artifact("a1", &cache, &staging)
        .with_metadata("epoch", serde_json::json!(3))
        .incremental();
    art.add_bytes("a.txt", "hello").expect("add");

    let (info, manifest, shared) = art.into_parts();
    // Handing over keeps the reservation for the sync engine.
    assert_eq!(cache.len(), 1);
    assert_eq!(info.name, "a1");
    assert_eq!(info.metadata["epoch"], 3);
    assert!(info.incremental);
    assert_eq!(manifest.len(), 1);
    assert!(Arc::ptr_eq(&shared, &cache));
}
