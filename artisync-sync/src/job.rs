//! One upload job: transfers exactly one logical file.
//!
//! A job runs once per attempt. The scheduler owns it between attempts, so
//! the temporary-copy guard fires only when the job is finally dropped: after
//! the terminal outcome, or during unwinding if the attempt panicked.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use artisync_core::{ArtifactId, Digest, SaveName};

use crate::backend::{Backend, CustomSave, NotificationSink, ProgressCallback, Transport, UploadSlot};
use crate::error::{BackendError, TransferError};
use crate::stats::TransferStats;

/// How a job obtains its destination.
#[derive(Clone)]
pub enum UploadStrategy {
    /// Caller-provided routine; it owns retries and progress.
    Custom(Arc<dyn CustomSave>),
    /// Pre-addressed manifest upload via `create_manifest_entry`.
    Manifest { digest: Digest, artifact_id: ArtifactId },
    /// `get_upload_url`; a missing url means the content is already stored.
    Classic,
}

impl fmt::Debug for UploadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UploadStrategy::Custom(_) => f.write_str("Custom"),
            UploadStrategy::Manifest {
                digest,
                artifact_id,
            } => f
                .debug_struct("Manifest")
                .field("digest", digest)
                .field("artifact_id", artifact_id)
                .finish(),
            UploadStrategy::Classic => f.write_str("Classic"),
        }
    }
}

/// Collaborators shared by every job of a session.
#[derive(Clone)]
pub struct JobContext {
    pub backend: Arc<dyn Backend>,
    pub transport: Arc<dyn Transport>,
    pub stats: Arc<TransferStats>,
    pub notifier: Arc<dyn NotificationSink>,
    pub silent: bool,
}

/// Terminal result of a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Uploaded,
    /// Content already present remotely; nothing transferred.
    Deduped,
    Failed(String),
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, JobOutcome::Failed(_))
    }
}

/// Result of one attempt.
#[derive(Debug)]
pub enum Attempt {
    Finished(JobOutcome),
    /// The backend was transiently unavailable before any transfer started.
    Requeue(BackendError),
}

pub struct UploadJob {
    save_name: SaveName,
    path: PathBuf,
    artifact_id: Option<ArtifactId>,
    strategy: UploadStrategy,
    ctx: JobContext,
    _copy: TempCopyGuard,
}

impl fmt::Debug for UploadJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadJob")
            .field("save_name", &self.save_name)
            .field("path", &self.path)
            .field("artifact_id", &self.artifact_id)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

impl UploadJob {
    pub fn new(
        save_name: SaveName,
        path: PathBuf,
        artifact_id: Option<ArtifactId>,
        strategy: UploadStrategy,
        copied: bool,
        ctx: JobContext,
    ) -> Self {
        let copy = TempCopyGuard::new(&path, copied);
        Self {
            save_name,
            path,
            artifact_id,
            strategy,
            ctx,
            _copy: copy,
        }
    }

    pub fn save_name(&self) -> &SaveName {
        &self.save_name
    }

    /// Run one attempt.
    pub async fn run(&self) -> Attempt {
        match &self.strategy {
            UploadStrategy::Custom(save) => Attempt::Finished(self.run_custom(save.as_ref()).await),
            UploadStrategy::Manifest {
                digest,
                artifact_id,
            } => {
                let slot = self
                    .ctx
                    .backend
                    .create_manifest_entry(&self.save_name, digest, artifact_id)
                    .await;
                self.after_slot(slot).await
            }
            UploadStrategy::Classic => {
                let slot = self.ctx.backend.get_upload_url(&self.save_name).await;
                self.after_slot(slot).await
            }
        }
    }

    /// Terminal failure after the scheduler exhausted its resubmissions.
    pub fn give_up(&self, err: BackendError) -> JobOutcome {
        self.fail(&TransferError::Backend(err), false)
    }

    async fn run_custom(&self, save: &dyn CustomSave) -> JobOutcome {
        match save.save(self.progress()).await {
            Ok(outcome) if outcome.deduped => self.deduped(),
            Ok(_) => self.succeeded(),
            // Custom savers surface their response body even when silent.
            Err(err) => self.fail(&err, true),
        }
    }

    async fn after_slot(&self, slot: Result<UploadSlot, BackendError>) -> Attempt {
        let slot = match slot {
            Ok(slot) => slot,
            Err(err) if err.is_transient() => return Attempt::Requeue(err),
            Err(err) => return Attempt::Finished(self.fail(&TransferError::Backend(err), false)),
        };
        let Some(url) = slot.url else {
            return Attempt::Finished(self.deduped());
        };

        let url = resolve_url(self.ctx.backend.base_url(), &url);
        let headers = parse_headers(&slot.headers);
        let result = self
            .ctx
            .transport
            .upload(&url, &self.path, &headers, self.progress())
            .await;
        Attempt::Finished(match result {
            Ok(()) => self.succeeded(),
            Err(err) => self.fail(&err, false),
        })
    }

    fn progress(&self) -> ProgressCallback {
        let stats = self.ctx.stats.clone();
        let name = self.save_name.to_string();
        Arc::new(move |uploaded| stats.update_uploaded_file(&name, uploaded))
    }

    fn succeeded(&self) -> JobOutcome {
        self.ctx.stats.set_file_uploaded(self.save_name.as_str());
        self.notify();
        tracing::debug!(save_name = %self.save_name, "upload finished");
        JobOutcome::Uploaded
    }

    fn deduped(&self) -> JobOutcome {
        self.ctx.stats.set_file_deduped(self.save_name.as_str());
        self.notify();
        tracing::debug!(save_name = %self.save_name, "content already stored, skipped transfer");
        JobOutcome::Deduped
    }

    fn fail(&self, err: &TransferError, always_log: bool) -> JobOutcome {
        self.ctx.stats.update_failed_file(self.save_name.as_str());
        let line = format!(
            "Error uploading \"{}\": {}, {}",
            self.save_name,
            err.kind(),
            err.diagnostic()
        );
        if self.ctx.silent && !always_log {
            tracing::debug!(save_name = %self.save_name, "{line}");
        } else {
            tracing::error!(save_name = %self.save_name, "{line}");
        }
        JobOutcome::Failed(line)
    }

    fn notify(&self) {
        if let Some(artifact_id) = &self.artifact_id {
            self.ctx.notifier.push_success(artifact_id, &self.save_name);
        }
    }
}

/// Deletes a temporary upload copy when dropped.
#[derive(Debug)]
struct TempCopyGuard {
    path: Option<PathBuf>,
}

impl TempCopyGuard {
    fn new(path: &Path, copied: bool) -> Self {
        Self {
            path: copied.then(|| path.to_path_buf()),
        }
    }
}

impl Drop for TempCopyGuard {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        match std::fs::remove_file(&path) {
            Ok(()) => tracing::trace!(path = %path.display(), "removed temporary copy"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "failed to remove temporary copy")
            }
        }
    }
}

/// Join a relative url (leading `/`) onto the backend base url.
pub fn resolve_url(base: &str, url: &str) -> String {
    if url.starts_with('/') {
        format!("{}{}", base.trim_end_matches('/'), url)
    } else {
        url.to_string()
    }
}

/// Split `Key:Value` strings on the first `:`. Both halves are kept verbatim;
/// strings without a `:` are skipped.
pub fn parse_headers(raw: &[String]) -> Vec<(String, String)> {
    raw.iter()
        .filter_map(|header| match header.split_once(':') {
            Some((key, value)) => Some((key.to_string(), value.to_string())),
            None => {
                tracing::warn!(header = %header, "ignoring malformed upload header");
                None
            }
        })
        .collect()
}
