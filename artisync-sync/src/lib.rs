//! # artisync-sync
//!
//! Upload scheduling and commit protocol for artifacts built with
//! `artisync-core`.
//!
//! Start a [`SyncSession`] with a [`Backend`], a [`Transport`] and a
//! [`NotificationSink`], build artifacts with [`SyncSession::new_artifact`],
//! then hand them to [`SyncSession::log_artifact`],
//! [`SyncSession::upsert_artifact`] or [`SyncSession::finish_artifact`].
//! The returned [`ArtifactHandle`] resolves with [`ArtifactHandle::wait`].

pub mod backend;
pub mod commit;
pub mod config;
mod error;
pub mod events;
pub mod handle;
pub mod http;
pub mod job;
mod logging;
pub mod memory;
mod pipeline;
pub mod scheduler;
mod session;
pub mod stats;

pub use backend::{
    Backend, CreateArtifact, CustomSave, NotificationSink, NullNotifier, ProgressCallback,
    RecordingNotifier, RemoteArtifact, RemoteState, SaveOutcome, Transport, UploadSlot,
};
pub use commit::{CommitGroup, CommitMode, GroupSource};
pub use config::SyncConfig;
pub use error::{BackendError, SyncError, TransferError};
pub use events::{BatchId, BatchOutcome, CompletionSink, JobEvent};
pub use handle::{ArtifactHandle, ArtifactState, CommittedArtifact, PipelinePhase};
pub use http::HttpTransport;
pub use job::{JobOutcome, UploadStrategy};
pub use logging::{init_tracing, init_tracing_json};
pub use memory::{MemoryBackend, MemoryStore, MemoryTransport};
pub use scheduler::{JobCompletion, StepUpload, UploadRequest};
pub use session::SyncSession;
pub use stats::{StatsSummary, TransferStats};
