//! In-process `Backend` and `Transport`.
//!
//! `MemoryBackend` hands out relative upload URLs under `memory://store`,
//! answers with a null URL when the object already exists, and keeps a log
//! of every call. `MemoryTransport` writes uploaded bytes into the shared
//! [`MemoryStore`]. Both can be scripted to fail.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use artisync_core::{ArtifactId, Digest, Manifest, SaveName};

use crate::backend::{
    Backend, CreateArtifact, ProgressCallback, RemoteArtifact, RemoteState, Transport, UploadSlot,
};
use crate::error::{BackendError, TransferError};

pub const MEMORY_BASE_URL: &str = "memory://store";

/// Uploaded objects keyed by absolute URL.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, url: impl Into<String>, data: Vec<u8>) {
        self.objects.lock().insert(url.into(), data);
    }

    pub fn get(&self, url: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(url).cloned()
    }

    pub fn contains(&self, url: &str) -> bool {
        self.objects.lock().contains_key(url)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }
}

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    CreateArtifact {
        name: String,
        aliases: Vec<String>,
        distributed_id: Option<String>,
    },
    GetUploadUrl(SaveName),
    CreateManifestEntry(SaveName),
    Commit(ArtifactId),
    Upsert { artifact_id: ArtifactId, group: String },
    Finish { artifact_id: ArtifactId, group: String },
    ArtifactState(ArtifactId),
}

/// Server-side record of an artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub id: ArtifactId,
    pub name: String,
    pub distributed_id: Option<String>,
    pub state: RemoteState,
    pub manifest: Manifest,
    manifest_url: Option<String>,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    artifacts: HashMap<ArtifactId, StoredArtifact>,
    by_distributed_id: HashMap<String, ArtifactId>,
    calls: Vec<BackendCall>,
    /// Remaining transient failures per save name.
    unavailable: HashMap<SaveName, u32>,
    rejected: HashSet<SaveName>,
    pending_polls: u32,
    polls_left: HashMap<ArtifactId, u32>,
    forced_state: Option<RemoteState>,
    reference_sizes: BTreeMap<String, u64>,
    upload_headers: Vec<String>,
}

pub struct MemoryBackend {
    store: Arc<MemoryStore>,
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            state: Mutex::new(State::default()),
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// Fail the next `times` slot requests for `save_name` as unavailable.
    pub fn fail_unavailable(&self, save_name: impl Into<SaveName>, times: u32) {
        self.state.lock().unavailable.insert(save_name.into(), times);
    }

    /// Reject every slot request for `save_name`.
    pub fn reject(&self, save_name: impl Into<SaveName>) {
        self.state.lock().rejected.insert(save_name.into());
    }

    /// Report `Pending` for this many polls after each commit.
    pub fn with_pending_polls(self, polls: u32) -> Self {
        self.state.lock().pending_polls = polls;
        self
    }

    /// Report this state for every committed artifact.
    pub fn force_state(&self, state: RemoteState) {
        self.state.lock().forced_state = Some(state);
    }

    /// Size the service resolves for an external reference URI.
    pub fn set_reference_size(&self, uri: impl Into<String>, size: u64) {
        self.state.lock().reference_sizes.insert(uri.into(), size);
    }

    /// Raw `Key:Value` headers attached to every upload slot.
    pub fn with_upload_headers(self, headers: Vec<String>) -> Self {
        self.state.lock().upload_headers = headers;
        self
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.state.lock().calls.clone()
    }

    pub fn upload_url_requests(&self) -> Vec<SaveName> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                BackendCall::GetUploadUrl(name) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn artifact(&self, id: &ArtifactId) -> Option<StoredArtifact> {
        self.state.lock().artifacts.get(id).cloned()
    }

    pub fn artifacts(&self) -> Vec<StoredArtifact> {
        let mut artifacts: Vec<_> = self.state.lock().artifacts.values().cloned().collect();
        artifacts.sort_by(|a, b| a.id.cmp(&b.id));
        artifacts
    }

    /// Absolute URL of a relative slot path.
    pub fn object_url(&self, relative: &str) -> String {
        format!("{MEMORY_BASE_URL}{relative}")
    }

    fn slot(&self, state: &State, save_name: &SaveName, relative: String) -> Result<UploadSlot, BackendError> {
        if state.rejected.contains(save_name) {
            return Err(BackendError::Rejected {
                status: 400,
                message: format!("upload of {save_name} rejected"),
            });
        }
        let url = (!self.store.contains(&self.object_url(&relative))).then_some(relative);
        Ok(UploadSlot {
            url,
            headers: state.upload_headers.clone(),
        })
    }

    fn take_unavailable(state: &mut State, save_name: &SaveName) -> Result<(), BackendError> {
        match state.unavailable.get_mut(save_name) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(BackendError::Unavailable(format!("503 for {save_name}")))
            }
            _ => Ok(()),
        }
    }

    fn mark_committed(state: &mut State, id: &ArtifactId) {
        let polls = state.pending_polls;
        state.polls_left.insert(id.clone(), polls);
        if let Some(artifact) = state.artifacts.get_mut(id) {
            artifact.state = RemoteState::Committed;
        }
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn base_url(&self) -> &str {
        MEMORY_BASE_URL
    }

    async fn create_artifact(&self, request: &CreateArtifact) -> Result<ArtifactId, BackendError> {
        let mut state = self.state.lock();
        state.calls.push(BackendCall::CreateArtifact {
            name: request.info.name.clone(),
            aliases: request.aliases.clone(),
            distributed_id: request.distributed_id.clone(),
        });
        if let Some(existing) = request
            .distributed_id
            .as_ref()
            .and_then(|id| state.by_distributed_id.get(id))
        {
            return Ok(existing.clone());
        }

        state.next_id += 1;
        let id = ArtifactId(format!("srv-{}", state.next_id));
        let kind = request.info.incremental.then_some(artisync_core::ManifestKind::Incremental);
        state.artifacts.insert(
            id.clone(),
            StoredArtifact {
                id: id.clone(),
                name: request.info.name.clone(),
                distributed_id: request.distributed_id.clone(),
                state: RemoteState::Pending,
                manifest: Manifest::new(kind.unwrap_or_default()),
                manifest_url: None,
            },
        );
        if let Some(distributed_id) = &request.distributed_id {
            state
                .by_distributed_id
                .insert(distributed_id.clone(), id.clone());
        }
        Ok(id)
    }

    async fn get_upload_url(&self, save_name: &SaveName) -> Result<UploadSlot, BackendError> {
        let mut state = self.state.lock();
        state.calls.push(BackendCall::GetUploadUrl(save_name.clone()));
        Self::take_unavailable(&mut state, save_name)?;
        self.slot(&state, save_name, format!("/uploads/{save_name}"))
    }

    async fn create_manifest_entry(
        &self,
        save_name: &SaveName,
        digest: &Digest,
        artifact_id: &ArtifactId,
    ) -> Result<UploadSlot, BackendError> {
        let mut state = self.state.lock();
        state
            .calls
            .push(BackendCall::CreateManifestEntry(save_name.clone()));
        Self::take_unavailable(&mut state, save_name)?;
        let relative = format!("/manifests/{artifact_id}/{digest}");
        let absolute = self.object_url(&relative);
        match state.artifacts.get_mut(artifact_id) {
            Some(artifact) => artifact.manifest_url = Some(absolute),
            None => return Err(BackendError::NotFound(format!("artifact {artifact_id}"))),
        }
        self.slot(&state, save_name, relative)
    }

    async fn commit_artifact(&self, artifact_id: &ArtifactId) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.calls.push(BackendCall::Commit(artifact_id.clone()));
        let Some(artifact) = state.artifacts.get_mut(artifact_id) else {
            return Err(BackendError::NotFound(format!("artifact {artifact_id}")));
        };
        let uploaded = artifact
            .manifest_url
            .as_deref()
            .and_then(|url| self.store.get(url));
        let Some(bytes) = uploaded else {
            return Err(BackendError::Rejected {
                status: 400,
                message: "manifest was not uploaded".into(),
            });
        };
        artifact.manifest = Manifest::from_json_slice(&bytes).map_err(|err| BackendError::Rejected {
            status: 400,
            message: format!("invalid manifest: {err}"),
        })?;
        Self::mark_committed(&mut state, artifact_id);
        Ok(())
    }

    async fn upsert_artifact(
        &self,
        artifact_id: &ArtifactId,
        manifest: &Manifest,
        group: &str,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.calls.push(BackendCall::Upsert {
            artifact_id: artifact_id.clone(),
            group: group.to_string(),
        });
        let Some(artifact) = state.artifacts.get_mut(artifact_id) else {
            return Err(BackendError::NotFound(format!("artifact {artifact_id}")));
        };
        artifact.manifest.merge(manifest);
        Ok(())
    }

    async fn finish_artifact(
        &self,
        artifact_id: &ArtifactId,
        manifest: &Manifest,
        group: &str,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.calls.push(BackendCall::Finish {
            artifact_id: artifact_id.clone(),
            group: group.to_string(),
        });
        let Some(artifact) = state.artifacts.get_mut(artifact_id) else {
            return Err(BackendError::NotFound(format!("artifact {artifact_id}")));
        };
        artifact.manifest.merge(manifest);
        Self::mark_committed(&mut state, artifact_id);
        Ok(())
    }

    async fn artifact_state(&self, artifact_id: &ArtifactId) -> Result<RemoteArtifact, BackendError> {
        let mut state = self.state.lock();
        state
            .calls
            .push(BackendCall::ArtifactState(artifact_id.clone()));
        let Some(artifact) = state.artifacts.get(artifact_id) else {
            return Err(BackendError::NotFound(format!("artifact {artifact_id}")));
        };
        let stored_state = artifact.state;
        let sizes: BTreeMap<String, u64> = artifact
            .manifest
            .entries()
            .filter(|entry| entry.size.is_none())
            .filter_map(|entry| {
                let uri = entry.reference.as_ref()?;
                let size = state.reference_sizes.get(uri)?;
                Some((entry.path.clone(), *size))
            })
            .collect();

        let mut reported = match (stored_state, state.forced_state) {
            (RemoteState::Committed, Some(forced)) => forced,
            (stored, _) => stored,
        };
        if reported == RemoteState::Committed {
            if let Some(left) = state.polls_left.get_mut(artifact_id) {
                if *left > 0 {
                    *left -= 1;
                    reported = RemoteState::Pending;
                }
            }
        }
        Ok(RemoteArtifact {
            id: artifact_id.clone(),
            state: reported,
            sizes,
        })
    }
}

/// One transfer seen by [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedUpload {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub bytes: u64,
}

/// Failure injected for URLs containing a pattern.
#[derive(Debug, Clone)]
enum Fault {
    Http { status: u16, body: String },
    Panic,
}

pub struct MemoryTransport {
    store: Arc<MemoryStore>,
    latency: Duration,
    chunk_size: usize,
    faults: Mutex<Vec<(String, Fault)>>,
    uploads: Mutex<Vec<RecordedUpload>>,
    active: Mutex<HashSet<String>>,
    overlaps: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MemoryTransport {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            latency: Duration::ZERO,
            chunk_size: 4096,
            faults: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
            active: Mutex::new(HashSet::new()),
            overlaps: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Time each transfer takes.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Bytes reported per progress callback.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Fail transfers whose URL contains `pattern` with an HTTP 500 and an
    /// XML error body.
    pub fn fail_matching(&self, pattern: impl Into<String>) {
        self.fail_matching_with(
            pattern,
            500,
            "<?xml version=\"1.0\"?><Error><Code>InternalError</Code></Error>",
        );
    }

    pub fn fail_matching_with(&self, pattern: impl Into<String>, status: u16, body: impl Into<String>) {
        self.faults.lock().push((
            pattern.into(),
            Fault::Http {
                status,
                body: body.into(),
            },
        ));
    }

    /// Panic inside transfers whose URL contains `pattern`.
    pub fn panic_matching(&self, pattern: impl Into<String>) {
        self.faults.lock().push((pattern.into(), Fault::Panic));
    }

    pub fn uploads(&self) -> Vec<RecordedUpload> {
        self.uploads.lock().clone()
    }

    /// Highest number of transfers observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Transfers that started while another transfer to the same URL ran.
    pub fn overlapping_uploads(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    fn fault_for(&self, url: &str) -> Option<Fault> {
        self.faults
            .lock()
            .iter()
            .find(|(pattern, _)| url.contains(pattern.as_str()))
            .map(|(_, fault)| fault.clone())
    }
}

/// Decrements the in-flight counters even if the transfer panics.
struct InFlight<'a> {
    transport: &'a MemoryTransport,
    url: String,
}

impl<'a> InFlight<'a> {
    fn enter(transport: &'a MemoryTransport, url: &str) -> Self {
        let now = transport.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        transport.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !transport.active.lock().insert(url.to_string()) {
            transport.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        Self {
            transport,
            url: url.to_string(),
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.transport.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.transport.active.lock().remove(&self.url);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn upload(
        &self,
        url: &str,
        path: &Path,
        headers: &[(String, String)],
        progress: ProgressCallback,
    ) -> Result<(), TransferError> {
        let _in_flight = InFlight::enter(self, url);
        let data = tokio::fs::read(path).await.map_err(|source| TransferError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match self.fault_for(url) {
            Some(Fault::Http { status, body }) => return Err(TransferError::Http { status, body }),
            Some(Fault::Panic) => panic!("simulated transport panic for {url}"),
            None => {}
        }

        let total = data.len() as u64;
        let mut sent = 0u64;
        for chunk in data.chunks(self.chunk_size) {
            sent += chunk.len() as u64;
            progress(sent);
        }
        if total == 0 {
            progress(0);
        }

        self.uploads.lock().push(RecordedUpload {
            url: url.to_string(),
            headers: headers.to_vec(),
            bytes: total,
        });
        self.store.put(url, data);
        Ok(())
    }
}
