//! `SyncSession`: wires the digest cache, stats, scheduler and completion
//! sink together and exposes the artifact operations.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};

use artisync_core::artifact::validate_aliases;
use artisync_core::{Artifact, DigestCache, SaveName};

use crate::backend::{Backend, CustomSave, NotificationSink, Transport};
use crate::commit::{CommitGroup, CommitMode};
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::events::{CompletionSink, JobEvent};
use crate::handle::{ArtifactHandle, PipelinePhase};
use crate::job::{JobContext, UploadStrategy};
use crate::pipeline::ArtifactPipeline;
use crate::scheduler::{JobCompletion, SchedulerSettings, StepUpload, UploadRequest};
use crate::stats::TransferStats;

pub struct SyncSession {
    config: SyncConfig,
    backend: Arc<dyn Backend>,
    cache: Arc<DigestCache>,
    stats: Arc<TransferStats>,
    scheduler: StepUpload,
    completions: CompletionSink,
    runtime: Handle,
}

impl SyncSession {
    /// Start the scheduler and completion sink.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    pub fn start(
        config: SyncConfig,
        backend: Arc<dyn Backend>,
        transport: Arc<dyn Transport>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        let runtime = Handle::current();
        let stats = Arc::new(TransferStats::new());
        let completions = CompletionSink::start();
        let ctx = JobContext {
            backend: backend.clone(),
            transport,
            stats: stats.clone(),
            notifier,
            silent: config.silent,
        };
        let settings = SchedulerSettings {
            workers: config.workers(),
            resubmit_delay: config.resubmit_delay,
            max_resubmits: config.max_resubmits,
        };
        let scheduler = StepUpload::start(settings, ctx, completions.sender());
        tracing::debug!(workers = settings.workers, "sync session started");
        Self {
            config,
            backend,
            cache: Arc::new(DigestCache::new()),
            stats,
            scheduler,
            completions,
            runtime,
        }
    }

    /// Share a digest cache with other sessions of the same process.
    pub fn with_digest_cache(mut self, cache: Arc<DigestCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<TransferStats> {
        self.stats.clone()
    }

    pub fn digest_cache(&self) -> Arc<DigestCache> {
        self.cache.clone()
    }

    /// Every job completion of this session.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.completions.subscribe()
    }

    /// A new artifact bound to this session's digest cache and staging dir.
    pub fn new_artifact(&self, name: impl Into<String>, kind: impl Into<String>) -> Artifact {
        Artifact::new(name, kind, self.cache.clone()).with_staging_dir(&self.config.staging_dir)
    }

    /// Upload a standalone file (not part of an artifact).
    pub fn upload_file(
        &self,
        save_name: impl Into<SaveName>,
        path: impl Into<PathBuf>,
    ) -> Result<JobCompletion, SyncError> {
        let path = path.into();
        let size = std::fs::metadata(&path)
            .map_err(|e| crate::error::io_err(&path, e))?
            .len();
        Ok(self.scheduler.submit(UploadRequest::new(save_name, path, size)))
    }

    /// Upload through a caller-provided routine.
    pub fn upload_custom(
        &self,
        save_name: impl Into<SaveName>,
        path: impl Into<PathBuf>,
        size: u64,
        save: Arc<dyn CustomSave>,
    ) -> JobCompletion {
        self.scheduler.submit(
            UploadRequest::new(save_name, path, size).with_strategy(UploadStrategy::Custom(save)),
        )
    }

    /// Submit any prepared request.
    pub fn submit(&self, request: UploadRequest) -> JobCompletion {
        self.scheduler.submit(request)
    }

    /// Upload and commit a complete artifact version.
    pub fn log_artifact(&self, artifact: Artifact) -> Result<ArtifactHandle, SyncError> {
        self.spawn_pipeline(artifact, CommitMode::Direct)
    }

    /// Contribute to a distributed artifact. The target is `distributed_id`,
    /// else the session's run group.
    pub fn upsert_artifact(
        &self,
        artifact: Artifact,
        distributed_id: Option<&str>,
    ) -> Result<ArtifactHandle, SyncError> {
        let group = CommitGroup::resolve("upsert", distributed_id, self.config.run_group.as_deref())?;
        self.spawn_pipeline(artifact, CommitMode::Upsert(group))
    }

    /// Submit the final contribution of a distributed artifact. Not retried.
    pub fn finish_artifact(
        &self,
        artifact: Artifact,
        distributed_id: Option<&str>,
    ) -> Result<ArtifactHandle, SyncError> {
        let group = CommitGroup::resolve("finish", distributed_id, self.config.run_group.as_deref())?;
        self.spawn_pipeline(artifact, CommitMode::Finish(group))
    }

    /// Stop accepting uploads and wait for queued and running jobs.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }

    fn spawn_pipeline(
        &self,
        artifact: Artifact,
        mode: CommitMode,
    ) -> Result<ArtifactHandle, SyncError> {
        validate_aliases(&artifact.info().aliases)?;
        let (info, manifest, cache) = artifact.into_parts();
        let manifest = Arc::new(manifest);
        let (phase_tx, phase_rx) = watch::channel(PipelinePhase::Pending);

        let handle = ArtifactHandle::new(
            info.clone(),
            manifest.clone(),
            mode.clone(),
            phase_rx,
            self.backend.clone(),
            self.config.poll_interval,
        );
        let pipeline = ArtifactPipeline {
            staging: self.config.staging_dir.join(info.client_id.as_str()),
            info,
            manifest,
            cache,
            mode,
            backend: self.backend.clone(),
            scheduler: self.scheduler.clone(),
            completions: self.completions.clone(),
            phase: phase_tx,
        };
        self.runtime.spawn(pipeline.run());
        Ok(handle)
    }
}
