//! Artisync core library: artifact manifests and the digest cache behind upload dedup.
//!
//! Public API surface:
//! - [`types`]: newtypes for artifact ids, save names and digests
//! - [`error`]: [`ArtifactError`]
//! - [`hash`]: SHA-256 content digests
//! - [`manifest`]: [`Manifest`] and [`ManifestEntry`]
//! - [`digest_cache`]: cross-artifact [`DigestCache`]
//! - [`artifact`]: the [`Artifact`] manifest builder

pub mod artifact;
pub mod digest_cache;
pub mod error;
pub mod hash;
pub mod manifest;
pub mod types;

pub use artifact::{Artifact, ArtifactInfo, ContentSource, ARTIFACT_SCHEME};
pub use digest_cache::{ContentOwner, DigestCache, Reservation};
pub use error::ArtifactError;
pub use manifest::{Manifest, ManifestEntry, PendingUpload};
pub use types::{ArtifactId, Digest, ManifestKind, SaveName};
