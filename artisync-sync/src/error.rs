use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failures reported by a [`Backend`](crate::backend::Backend).
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("backend transport error: {0}")]
    Transport(String),

    /// The service is temporarily unable to answer; the request may be resubmitted.
    #[error("backend temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("backend rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("not found: {0}")]
    NotFound(String),
}

impl BackendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Unavailable(_))
    }
}

/// Job-level transfer failure. Never escapes the job: it is recorded in the
/// stats, logged, and turned into a failure completion.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP {status}")]
    Http { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("{kind}: {message}")]
    Custom {
        kind: String,
        message: String,
        response_body: Option<String>,
    },
}

impl TransferError {
    /// Short class name used in the `Error uploading` line.
    pub fn kind(&self) -> &str {
        match self {
            TransferError::Io { .. } => "IoError",
            TransferError::Http { .. } => "HTTPError",
            TransferError::Transport(_) => "TransportError",
            TransferError::Backend(_) => "BackendError",
            TransferError::Custom { kind, .. } => kind.as_str(),
        }
    }

    /// Body of the failing HTTP response, if the failure carried one.
    pub fn response_body(&self) -> Option<&str> {
        match self {
            TransferError::Http { body, .. } if !body.is_empty() => Some(body.as_str()),
            TransferError::Custom {
                response_body: Some(body),
                ..
            } => Some(body.as_str()),
            _ => None,
        }
    }

    /// The response body when there is one, else the error message.
    pub fn diagnostic(&self) -> String {
        match self.response_body() {
            Some(body) => body.to_string(),
            None => match self {
                TransferError::Custom { message, .. } => message.clone(),
                other => other.to_string(),
            },
        }
    }
}

/// Error surface of the sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A caller-side precondition was violated before any network call.
    #[error("{0}")]
    Contract(String),

    #[error("artifact '{name}' did not become ready within {timeout:?}")]
    WaitTimeout { name: String, timeout: Duration },

    #[error("artifact '{name}' failed: {reason}")]
    ArtifactFailed { name: String, reason: String },

    #[error("artifact error: {0}")]
    Artifact(#[from] artisync_core::ArtifactError),

    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
