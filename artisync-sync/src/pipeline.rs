//! Per-artifact pipeline: create remotely, upload content, upload the
//! manifest (direct mode), commit.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::watch;

use artisync_core::{ArtifactId, ArtifactInfo, ContentOwner, DigestCache, Manifest, SaveName};

use crate::backend::{Backend, CreateArtifact};
use crate::commit::{self, CommitMode};
use crate::error::{io_err, SyncError};
use crate::events::CompletionSink;
use crate::handle::PipelinePhase;
use crate::job::{JobOutcome, UploadStrategy};
use crate::scheduler::{StepUpload, UploadRequest};

const MANIFEST_FILE: &str = "artifact_manifest.json";

pub(crate) struct ArtifactPipeline {
    pub info: ArtifactInfo,
    pub manifest: Arc<Manifest>,
    pub cache: Arc<DigestCache>,
    pub mode: CommitMode,
    pub backend: Arc<dyn Backend>,
    pub scheduler: StepUpload,
    pub completions: CompletionSink,
    /// `<staging_dir>/<client_id>`; removed once the pipeline is terminal.
    pub staging: PathBuf,
    pub phase: watch::Sender<PipelinePhase>,
}

impl ArtifactPipeline {
    /// Staging is cleaned before the terminal phase is published.
    pub async fn run(self) {
        let result = self.execute().await;
        self.cleanup_staging();
        match result {
            Ok(artifact_id) => {
                self.confirm_content();
                self.phase.send_replace(PipelinePhase::Submitted { artifact_id });
            }
            Err(err) => {
                tracing::error!(artifact = %self.info.name, error = %err, "artifact sync failed");
                let released = self.cache.release_artifact(&self.info.client_id);
                if released > 0 {
                    tracing::debug!(artifact = %self.info.name, released, "released digest reservations");
                }
                self.phase.send_replace(PipelinePhase::Failed {
                    reason: err.to_string(),
                });
            }
        }
    }

    async fn execute(&self) -> Result<ArtifactId, SyncError> {
        let request = CreateArtifact {
            info: self.info.clone(),
            aliases: self.info.effective_aliases(),
            distributed_id: self.mode.distributed_id(),
        };
        let artifact_id = self.backend.create_artifact(&request).await?;
        self.phase.send_replace(PipelinePhase::Uploading {
            artifact_id: artifact_id.clone(),
        });
        tracing::info!(
            artifact = %self.info.name,
            artifact_id = %artifact_id,
            entries = self.manifest.len(),
            "uploading artifact",
        );

        self.upload_content(&artifact_id).await?;

        if matches!(self.mode, CommitMode::Direct) {
            self.upload_manifest(&artifact_id).await?;
        }
        commit::submit(self.backend.as_ref(), &self.mode, &artifact_id, &self.manifest).await?;
        Ok(artifact_id)
    }

    async fn upload_content(&self, artifact_id: &ArtifactId) -> Result<(), SyncError> {
        let uploads = self.manifest.uploads();
        let (batch, done) = self.completions.open_batch(uploads.len());
        for upload in uploads {
            let request = UploadRequest::new(
                SaveName::for_content(&upload.digest),
                upload.local_path,
                upload.size,
            )
            .for_artifact(artifact_id.clone())
            .copied(upload.staged)
            .in_batch(batch);
            // Aggregated through the batch instead.
            drop(self.scheduler.submit(request));
        }

        let outcome = done
            .await
            .map_err(|_| SyncError::ChannelClosed("completion batch"))?;
        if outcome.is_success() {
            return Ok(());
        }
        let total = outcome.completed();
        let (first, reason) = &outcome.failed[0];
        Err(SyncError::ArtifactFailed {
            name: self.info.name.clone(),
            reason: format!(
                "{} of {total} uploads failed (first: {first}: {reason})",
                outcome.failed.len()
            ),
        })
    }

    async fn upload_manifest(&self, artifact_id: &ArtifactId) -> Result<(), SyncError> {
        let bytes = self.manifest.to_json_bytes()?;
        let digest = self.manifest.digest()?;
        std::fs::create_dir_all(&self.staging).map_err(|e| io_err(&self.staging, e))?;
        let path = self.staging.join(MANIFEST_FILE);
        std::fs::write(&path, &bytes).map_err(|e| io_err(&path, e))?;

        let request = UploadRequest::new(
            SaveName::for_manifest(&self.info.client_id),
            path,
            bytes.len() as u64,
        )
        .with_strategy(UploadStrategy::Manifest {
            digest,
            artifact_id: artifact_id.clone(),
        })
        .for_artifact(artifact_id.clone())
        .copied(true)
        .untracked();

        match self.scheduler.submit(request).await? {
            JobOutcome::Uploaded | JobOutcome::Deduped => Ok(()),
            JobOutcome::Failed(reason) => Err(SyncError::ArtifactFailed {
                name: self.info.name.clone(),
                reason: format!("manifest upload failed: {reason}"),
            }),
        }
    }

    /// Content of a submitted artifact may now be referenced by later
    /// artifacts instead of being uploaded again.
    fn confirm_content(&self) {
        for upload in self.manifest.uploads() {
            let Some(path) = upload.paths.first() else {
                continue;
            };
            let owner = ContentOwner {
                artifact: self.info.client_id.clone(),
                path: path.clone(),
                size: upload.size,
            };
            if self.cache.confirm(&upload.digest, owner) {
                tracing::trace!(digest = %upload.digest, path = %path, "content confirmed");
            }
        }
    }

    /// Jobs delete their own copies; this catches copies no job was ever
    /// submitted for, plus the artifact's staging directory.
    fn cleanup_staging(&self) {
        for path in self.manifest.staged_paths() {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to remove temporary copy",
                ),
            }
        }
        match std::fs::remove_dir_all(&self.staging) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(
                path = %self.staging.display(),
                error = %err,
                "failed to remove staging directory",
            ),
        }
    }
}
