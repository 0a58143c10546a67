//! Collaborator interfaces: the remote service, the byte transport and the
//! success notifier.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use artisync_core::{ArtifactId, ArtifactInfo, Digest, Manifest, SaveName};

use crate::error::{BackendError, TransferError};

/// Receives cumulative bytes transferred for one file.
pub type ProgressCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Answer to an upload-slot request. A `None` url means the content is
/// already stored and nothing needs to be transferred.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSlot {
    pub url: Option<String>,
    /// Raw `Key:Value` strings to attach to the transfer request.
    #[serde(default)]
    pub headers: Vec<String>,
}

/// Request body of [`Backend::create_artifact`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateArtifact {
    pub info: ArtifactInfo,
    pub aliases: Vec<String>,
    /// Writers sharing this id land on the same server-side artifact.
    pub distributed_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RemoteState {
    Pending,
    Committed,
    Failed,
    Deleted,
}

/// Server-side view of an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteArtifact {
    pub id: ArtifactId,
    pub state: RemoteState,
    /// Sizes of reference entries the service resolved, keyed by path.
    #[serde(default)]
    pub sizes: BTreeMap<String, u64>,
}

/// The remote artifact service.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Base for relative upload URLs.
    fn base_url(&self) -> &str;

    async fn create_artifact(&self, request: &CreateArtifact) -> Result<ArtifactId, BackendError>;

    async fn get_upload_url(&self, save_name: &SaveName) -> Result<UploadSlot, BackendError>;

    /// Pre-addressed upload of an artifact's manifest file.
    async fn create_manifest_entry(
        &self,
        save_name: &SaveName,
        digest: &Digest,
        artifact_id: &ArtifactId,
    ) -> Result<UploadSlot, BackendError>;

    async fn commit_artifact(&self, artifact_id: &ArtifactId) -> Result<(), BackendError>;

    async fn upsert_artifact(
        &self,
        artifact_id: &ArtifactId,
        manifest: &Manifest,
        group: &str,
    ) -> Result<(), BackendError>;

    async fn finish_artifact(
        &self,
        artifact_id: &ArtifactId,
        manifest: &Manifest,
        group: &str,
    ) -> Result<(), BackendError>;

    async fn artifact_state(&self, artifact_id: &ArtifactId)
        -> Result<RemoteArtifact, BackendError>;
}

/// Moves file bytes to a storage URL.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn upload(
        &self,
        url: &str,
        path: &Path,
        headers: &[(String, String)],
        progress: ProgressCallback,
    ) -> Result<(), TransferError>;
}

/// Told about every successful artifact upload.
pub trait NotificationSink: Send + Sync {
    fn push_success(&self, artifact_id: &ArtifactId, save_name: &SaveName);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveOutcome {
    pub deduped: bool,
}

/// Caller-provided upload routine. Owns its own retries.
#[async_trait]
pub trait CustomSave: Send + Sync {
    async fn save(&self, progress: ProgressCallback) -> Result<SaveOutcome, TransferError>;
}

#[derive(Debug, Default)]
pub struct NullNotifier;

impl NotificationSink for NullNotifier {
    fn push_success(&self, _artifact_id: &ArtifactId, _save_name: &SaveName) {}
}

/// Keeps every notification, in arrival order.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<(ArtifactId, SaveName)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(ArtifactId, SaveName)> {
        self.events.lock().clone()
    }
}

impl NotificationSink for RecordingNotifier {
    fn push_success(&self, artifact_id: &ArtifactId, save_name: &SaveName) {
        self.events
            .lock()
            .push((artifact_id.clone(), save_name.clone()));
    }
}
