//! Error types for artisync-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise while assembling an artifact.
#[derive(Debug, Error)]
pub enum ArtifactError {
    /// The logical path is already present in the manifest.
    #[error("path '{path}' is already present in the artifact manifest")]
    DuplicatePath { path: String },

    /// An alias contains a reserved character.
    #[error("Aliases must not contain any of the following characters: /, : (got '{alias}')")]
    InvalidAlias { alias: String },

    /// A reference URI names a storage provider this engine cannot resolve.
    #[error("unsupported storage provider '{scheme}' in reference {uri}")]
    UnsupportedProvider { scheme: String, uri: String },

    /// A reference URI has no `scheme://` prefix.
    #[error("invalid reference URI '{uri}'")]
    InvalidReference { uri: String },

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Manifest JSON serialization/deserialization error.
    #[error("manifest JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience constructor for [`ArtifactError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> ArtifactError {
    ArtifactError::Io {
        path: path.into(),
        source,
    }
}
