//! Commit protocol: direct commit, group upsert, distributed finish.
//!
//! The commit group is resolved before any I/O so a contract violation never
//! leaves a half-created artifact behind.

use artisync_core::{ArtifactId, Manifest};

use crate::backend::Backend;
use crate::error::SyncError;

/// Where a commit group id came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSource {
    Explicit,
    RunGroup,
}

/// Correlation id shared by every writer of one distributed artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitGroup {
    pub id: String,
    pub source: GroupSource,
}

impl CommitGroup {
    /// The explicit id wins, else the session's run group. Empty strings
    /// count as absent.
    pub fn resolve(
        operation: &str,
        distributed_id: Option<&str>,
        run_group: Option<&str>,
    ) -> Result<Self, SyncError> {
        let present = |id: Option<&str>| id.filter(|id| !id.is_empty()).map(str::to_string);
        if let Some(id) = present(distributed_id) {
            return Ok(Self {
                id,
                source: GroupSource::Explicit,
            });
        }
        if let Some(id) = present(run_group) {
            return Ok(Self {
                id,
                source: GroupSource::RunGroup,
            });
        }
        Err(SyncError::Contract(format!(
            "Cannot {operation} artifact unless the session has a run group or a distributed id is provided"
        )))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitMode {
    /// Upload the manifest file, then `commit_artifact`.
    Direct,
    /// Contribute a partial manifest; the server keeps the artifact pending.
    Upsert(CommitGroup),
    /// Submit the final contribution and close the distributed artifact.
    Finish(CommitGroup),
}

impl CommitMode {
    pub fn group(&self) -> Option<&CommitGroup> {
        match self {
            CommitMode::Direct => None,
            CommitMode::Upsert(group) | CommitMode::Finish(group) => Some(group),
        }
    }

    pub fn distributed_id(&self) -> Option<String> {
        self.group().map(|group| group.id.clone())
    }

    pub fn label(&self) -> &'static str {
        match self {
            CommitMode::Direct => "commit",
            CommitMode::Upsert(_) => "upsert",
            CommitMode::Finish(_) => "finish",
        }
    }

    /// Whether `wait` must see the backend report the artifact committed.
    pub fn awaits_remote_commit(&self) -> bool {
        !matches!(self, CommitMode::Upsert(_))
    }
}

/// Submit the commit once. `finish` is not idempotent and is never retried.
pub async fn submit(
    backend: &dyn Backend,
    mode: &CommitMode,
    artifact_id: &ArtifactId,
    manifest: &Manifest,
) -> Result<(), SyncError> {
    match mode {
        CommitMode::Direct => backend.commit_artifact(artifact_id).await?,
        CommitMode::Upsert(group) => {
            backend
                .upsert_artifact(artifact_id, manifest, &group.id)
                .await?
        }
        CommitMode::Finish(group) => {
            backend
                .finish_artifact(artifact_id, manifest, &group.id)
                .await?
        }
    }
    tracing::info!(
        artifact_id = %artifact_id,
        mode = mode.label(),
        group = mode.group().map(|g| g.id.as_str()).unwrap_or(""),
        "artifact submitted",
    );
    Ok(())
}
