//! Caller-facing view of an artifact being synchronized.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;

use artisync_core::{ArtifactId, ArtifactInfo, Manifest};

use crate::backend::{Backend, RemoteState};
use crate::commit::CommitMode;
use crate::error::SyncError;

/// Stand-in deadline for timeouts too large to add to `Instant::now()`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Progress published by the pipeline task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelinePhase {
    Pending,
    Uploading { artifact_id: ArtifactId },
    /// The commit call was accepted by the backend.
    Submitted { artifact_id: ArtifactId },
    Failed { reason: String },
}

/// Caller-visible state of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactState {
    Pending,
    Uploading,
    /// An upsert was accepted. The remote artifact stays pending until a
    /// writer finishes it.
    Contributed,
    Committed,
    Failed,
}

/// A committed artifact as returned by [`ArtifactHandle::wait`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommittedArtifact {
    pub id: ArtifactId,
    pub client_id: ArtifactId,
    pub name: String,
    /// Reference sizes reported by the backend are filled in.
    pub manifest: Manifest,
}

/// Owns the frozen manifest and a watch on the pipeline. Dropping it does not
/// cancel the upload.
pub struct ArtifactHandle {
    info: ArtifactInfo,
    manifest: Arc<Manifest>,
    mode: CommitMode,
    phase: watch::Receiver<PipelinePhase>,
    backend: Arc<dyn Backend>,
    poll_interval: Duration,
    remote: Mutex<Option<RemoteState>>,
}

impl ArtifactHandle {
    pub(crate) fn new(
        info: ArtifactInfo,
        manifest: Arc<Manifest>,
        mode: CommitMode,
        phase: watch::Receiver<PipelinePhase>,
        backend: Arc<dyn Backend>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            info,
            manifest,
            mode,
            phase,
            backend,
            poll_interval,
            remote: Mutex::new(None),
        }
    }

    pub fn info(&self) -> &ArtifactInfo {
        &self.info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    pub fn mode(&self) -> &CommitMode {
        &self.mode
    }

    /// Server-assigned id, once the artifact was created remotely.
    pub fn artifact_id(&self) -> Option<ArtifactId> {
        match &*self.phase.borrow() {
            PipelinePhase::Uploading { artifact_id } | PipelinePhase::Submitted { artifact_id } => {
                Some(artifact_id.clone())
            }
            PipelinePhase::Pending | PipelinePhase::Failed { .. } => None,
        }
    }

    pub fn state(&self) -> ArtifactState {
        match *self.remote.lock() {
            Some(RemoteState::Committed) => return ArtifactState::Committed,
            Some(RemoteState::Failed | RemoteState::Deleted) => return ArtifactState::Failed,
            Some(RemoteState::Pending) | None => {}
        }
        match &*self.phase.borrow() {
            PipelinePhase::Pending => ArtifactState::Pending,
            PipelinePhase::Uploading { .. } => ArtifactState::Uploading,
            PipelinePhase::Submitted { .. } if !self.mode.awaits_remote_commit() => {
                ArtifactState::Contributed
            }
            PipelinePhase::Submitted { .. } => ArtifactState::Uploading,
            PipelinePhase::Failed { .. } => ArtifactState::Failed,
        }
    }

    /// Wait until the artifact is terminal or `timeout` elapses.
    ///
    /// A zero or sub-millisecond timeout on a non-terminal artifact returns
    /// [`SyncError::WaitTimeout`] without sleeping.
    pub async fn wait(&self, timeout: Duration) -> Result<CommittedArtifact, SyncError> {
        let now = Instant::now();
        let deadline = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + FAR_FUTURE);
        let artifact_id = self.wait_submitted(deadline, timeout).await?;

        if !self.mode.awaits_remote_commit() {
            return Ok(self.committed(artifact_id, (*self.manifest).clone()));
        }
        self.poll_committed(artifact_id, deadline, timeout).await
    }

    async fn wait_submitted(
        &self,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<ArtifactId, SyncError> {
        let mut phase = self.phase.clone();
        let mut closed = false;
        loop {
            let current = phase.borrow_and_update().clone();
            match current {
                PipelinePhase::Submitted { artifact_id } => return Ok(artifact_id),
                PipelinePhase::Failed { reason } => return Err(self.failed(reason)),
                PipelinePhase::Pending | PipelinePhase::Uploading { .. } => {}
            }
            if closed {
                return Err(SyncError::ChannelClosed("artifact pipeline"));
            }
            if timeout < Duration::from_millis(1) || Instant::now() >= deadline {
                return Err(self.timed_out(timeout));
            }
            match tokio::time::timeout_at(deadline, phase.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => closed = true,
                Err(_) => return Err(self.timed_out(timeout)),
            }
        }
    }

    async fn poll_committed(
        &self,
        artifact_id: ArtifactId,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<CommittedArtifact, SyncError> {
        loop {
            match tokio::time::timeout_at(deadline, self.backend.artifact_state(&artifact_id)).await
            {
                Err(_) => return Err(self.timed_out(timeout)),
                Ok(Ok(remote)) => {
                    *self.remote.lock() = Some(remote.state);
                    match remote.state {
                        RemoteState::Committed => {
                            let mut manifest = (*self.manifest).clone();
                            manifest.resolve_sizes(&remote.sizes);
                            return Ok(self.committed(artifact_id, manifest));
                        }
                        RemoteState::Failed | RemoteState::Deleted => {
                            return Err(self.failed(format!(
                                "backend reported state {:?}",
                                remote.state
                            )));
                        }
                        RemoteState::Pending => {}
                    }
                }
                Ok(Err(err)) => {
                    tracing::warn!(artifact_id = %artifact_id, error = %err, "artifact state poll failed");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(self.timed_out(timeout));
            }
            tokio::time::sleep_until((now + self.poll_interval).min(deadline)).await;
        }
    }

    fn committed(&self, id: ArtifactId, manifest: Manifest) -> CommittedArtifact {
        CommittedArtifact {
            id,
            client_id: self.info.client_id.clone(),
            name: self.info.name.clone(),
            manifest,
        }
    }

    fn failed(&self, reason: String) -> SyncError {
        SyncError::ArtifactFailed {
            name: self.info.name.clone(),
            reason,
        }
    }

    fn timed_out(&self, timeout: Duration) -> SyncError {
        SyncError::WaitTimeout {
            name: self.info.name.clone(),
            timeout,
        }
    }
}

impl std::fmt::Debug for ArtifactHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactHandle")
            .field("name", &self.info.name)
            .field("client_id", &self.info.client_id)
            .field("mode", &self.mode)
            .field("phase", &*self.phase.borrow())
            .finish_non_exhaustive()
    }
}
