//! The [`Artifact`] manifest builder.
//!
//! ## `add`: dedup protocol
//!
//! 1. Reject a logical path already present in the manifest.
//! 2. References: validate the provider scheme, record verbatim, no hashing.
//! 3. Content: hash with SHA-256.
//! 4. Same digest already in this manifest → share that entry's local file.
//! 5. Otherwise reserve the digest in the [`DigestCache`]. Content another
//!    artifact already uploaded and committed turns this entry into a
//!    reference; content that is only reserved elsewhere is uploaded again.
//! 6. Staged sources are copied into the staging directory only when this
//!    artifact will actually upload them.
//!
//! Dropping an artifact that was never handed to the sync engine releases
//! its reservations and removes its staging copies.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::digest_cache::{ContentOwner, DigestCache, Reservation};
use crate::error::{io_err, ArtifactError};
use crate::hash::{digest_bytes, digest_file};
use crate::manifest::{Manifest, ManifestEntry};
use crate::types::{ArtifactId, Digest, ManifestKind};

/// URI scheme of references to another artifact's entry.
pub const ARTIFACT_SCHEME: &str = "artisync-artifact";

/// Reference schemes the backend knows how to resolve.
pub const SUPPORTED_SCHEMES: &[&str] = &[ARTIFACT_SCHEME, "file", "http", "https", "s3", "gs", "az"];

const FORBIDDEN_ALIAS_CHARS: &[char] = &['/', ':'];

/// Where the content of a manifest entry comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentSource {
    /// Upload straight from this file.
    File(PathBuf),
    /// Copy into the staging directory first; the copy is deleted after upload.
    StagedFile(PathBuf),
    /// In-memory content, written to a staging copy.
    Bytes(Vec<u8>),
    /// Content owned elsewhere, recorded verbatim.
    Reference { uri: String, size: Option<u64> },
}

/// Everything about an artifact except its manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactInfo {
    pub client_id: ArtifactId,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub aliases: Vec<String>,
    pub metadata: Map<String, Value>,
    pub incremental: bool,
    pub created_at: DateTime<Utc>,
}

impl ArtifactInfo {
    /// Aliases sent to the backend; an artifact without aliases is `latest`.
    pub fn effective_aliases(&self) -> Vec<String> {
        if self.aliases.is_empty() {
            vec!["latest".to_string()]
        } else {
            self.aliases.clone()
        }
    }
}

/// A locally-assembled artifact: metadata plus its manifest.
#[derive(Debug)]
pub struct Artifact {
    info: ArtifactInfo,
    manifest: Manifest,
    cache: Arc<DigestCache>,
    staging_dir: PathBuf,
    handed_over: bool,
}

impl Artifact {
    pub fn new(name: impl Into<String>, kind: impl Into<String>, cache: Arc<DigestCache>) -> Self {
        Self {
            info: ArtifactInfo {
                client_id: ArtifactId::generate(),
                name: name.into(),
                kind: kind.into(),
                aliases: Vec::new(),
                metadata: Map::new(),
                incremental: false,
                created_at: Utc::now(),
            },
            manifest: Manifest::new(ManifestKind::Full),
            cache,
            staging_dir: default_staging_dir(),
            handed_over: false,
        }
    }

    /// Directory receiving staging copies (`<dir>/<client_id>/<digest>`).
    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = dir.into();
        self
    }

    /// Mark the manifest as an incremental contribution.
    pub fn incremental(mut self) -> Self {
        self.info.incremental = true;
        self.manifest.kind = ManifestKind::Incremental;
        self
    }

    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.info.aliases = aliases.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.info.metadata.insert(key.into(), value);
        self
    }

    pub fn info(&self) -> &ArtifactInfo {
        &self.info
    }

    pub fn client_id(&self) -> &ArtifactId {
        &self.info.client_id
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn cache(&self) -> &Arc<DigestCache> {
        &self.cache
    }

    /// Add one logical path. See the module docs for the dedup protocol.
    pub fn add(
        &mut self,
        path: impl AsRef<str>,
        source: ContentSource,
    ) -> Result<&ManifestEntry, ArtifactError> {
        let path = normalize_path(path.as_ref());
        if self.manifest.contains(&path) {
            return Err(ArtifactError::DuplicatePath { path });
        }

        let entry = match source {
            ContentSource::Reference { uri, size } => {
                validate_reference(&uri)?;
                ManifestEntry::reference(path, uri, size)
            }
            ContentSource::File(local) => {
                let (digest, size) = digest_file(&local)?;
                self.content_entry(path, digest, size, Staging::None(local))?
            }
            ContentSource::StagedFile(local) => {
                let (digest, size) = digest_file(&local)?;
                self.content_entry(path, digest, size, Staging::CopyFrom(local))?
            }
            ContentSource::Bytes(data) => {
                let digest = digest_bytes(&data);
                let size = data.len() as u64;
                self.content_entry(path, digest, size, Staging::Write(data))?
            }
        };
        self.manifest.insert(entry)
    }

    pub fn add_file(
        &mut self,
        path: impl AsRef<str>,
        local: impl Into<PathBuf>,
    ) -> Result<&ManifestEntry, ArtifactError> {
        self.add(path, ContentSource::File(local.into()))
    }

    pub fn add_bytes(
        &mut self,
        path: impl AsRef<str>,
        data: impl Into<Vec<u8>>,
    ) -> Result<&ManifestEntry, ArtifactError> {
        self.add(path, ContentSource::Bytes(data.into()))
    }

    pub fn add_reference(
        &mut self,
        path: impl AsRef<str>,
        uri: impl Into<String>,
        size: Option<u64>,
    ) -> Result<&ManifestEntry, ArtifactError> {
        self.add(
            path,
            ContentSource::Reference {
                uri: uri.into(),
                size,
            },
        )
    }

    /// Check aliases before anything is sent to the backend.
    pub fn validate(&self) -> Result<(), ArtifactError> {
        validate_aliases(&self.info.aliases)
    }

    /// Hand the artifact over to the sync engine. The manifest can no longer
    /// be modified afterwards.
    pub fn into_parts(mut self) -> (ArtifactInfo, Manifest, Arc<DigestCache>) {
        self.handed_over = true;
        let kind = self.manifest.kind;
        let manifest = std::mem::replace(&mut self.manifest, Manifest::new(kind));
        (self.info.clone(), manifest, self.cache.clone())
    }

    fn content_entry(
        &self,
        path: String,
        digest: Digest,
        size: u64,
        staging: Staging,
    ) -> Result<ManifestEntry, ArtifactError> {
        if let Some(existing) = self.manifest.entry_for_digest(&digest) {
            if let Some(local) = &existing.local_path {
                return Ok(ManifestEntry::content(
                    path,
                    digest,
                    size,
                    local.clone(),
                    existing.staged,
                ));
            }
        }

        let candidate = ContentOwner {
            artifact: self.info.client_id.clone(),
            path: path.clone(),
            size,
        };
        match self.cache.reserve(&digest, candidate) {
            Reservation::Existing(owner) => {
                tracing::debug!(
                    path = %path,
                    owner = %owner.artifact,
                    "content already committed by another artifact, adding reference",
                );
                return Ok(ManifestEntry::reference(
                    path,
                    owner.reference_uri(),
                    Some(owner.size),
                ));
            }
            Reservation::InFlight(owner) => tracing::debug!(
                path = %path,
                owner = %owner.artifact,
                "content not yet committed by its owner, uploading it here too",
            ),
            Reservation::Reserved | Reservation::Owned(_) => {}
        }

        let (local, staged) = match staging {
            Staging::None(local) => (local, false),
            Staging::CopyFrom(source) => {
                let dest = self.staging_path(&digest);
                let copied = prepare_parent(&dest)
                    .and_then(|()| std::fs::copy(&source, &dest).map_err(|e| io_err(&source, e)));
                if let Err(err) = copied {
                    self.cache.release(&digest, &self.info.client_id);
                    return Err(err);
                }
                (dest, true)
            }
            Staging::Write(data) => {
                let dest = self.staging_path(&digest);
                let written = prepare_parent(&dest)
                    .and_then(|()| std::fs::write(&dest, &data).map_err(|e| io_err(&dest, e)));
                if let Err(err) = written {
                    self.cache.release(&digest, &self.info.client_id);
                    return Err(err);
                }
                (dest, true)
            }
        };
        Ok(ManifestEntry::content(path, digest, size, local, staged))
    }

    fn staging_path(&self, digest: &Digest) -> PathBuf {
        self.staging_dir
            .join(self.info.client_id.as_str())
            .join(digest.as_str())
    }
}

impl Drop for Artifact {
    fn drop(&mut self) {
        if self.handed_over {
            return;
        }
        let released = self.cache.release_artifact(&self.info.client_id);
        if released > 0 {
            tracing::debug!(artifact = %self.info.name, released, "released digest reservations");
        }
        let staging = self.staging_dir.join(self.info.client_id.as_str());
        match std::fs::remove_dir_all(&staging) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => tracing::warn!(
                path = %staging.display(),
                error = %err,
                "failed to remove staging copies",
            ),
        }
    }
}

enum Staging {
    None(PathBuf),
    CopyFrom(PathBuf),
    Write(Vec<u8>),
}

/// `<tmp>/artisync-staging`
pub fn default_staging_dir() -> PathBuf {
    std::env::temp_dir().join("artisync-staging")
}

/// Aliases must not contain `/` or `:`.
pub fn validate_aliases(aliases: &[String]) -> Result<(), ArtifactError> {
    match aliases.iter().find(|a| a.contains(FORBIDDEN_ALIAS_CHARS)) {
        Some(alias) => Err(ArtifactError::InvalidAlias {
            alias: alias.clone(),
        }),
        None => Ok(()),
    }
}

/// Reference URIs must be `scheme://…` with a supported scheme.
pub fn validate_reference(uri: &str) -> Result<(), ArtifactError> {
    let Some((scheme, rest)) = uri.split_once("://") else {
        return Err(ArtifactError::InvalidReference {
            uri: uri.to_string(),
        });
    };
    if scheme.is_empty() || rest.is_empty() {
        return Err(ArtifactError::InvalidReference {
            uri: uri.to_string(),
        });
    }
    let scheme = scheme.to_ascii_lowercase();
    if !SUPPORTED_SCHEMES.contains(&scheme.as_str()) {
        return Err(ArtifactError::UnsupportedProvider {
            scheme,
            uri: uri.to_string(),
        });
    }
    Ok(())
}

fn normalize_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let mut trimmed = unified.as_str();
    while let Some(rest) = trimmed.strip_prefix("./") {
        trimmed = rest;
    }
    trimmed.trim_start_matches('/').to_string()
}

fn prepare_parent(path: &Path) -> Result<(), ArtifactError> {
    match path.parent() {
        Some(parent) => std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e)),
        None => Ok(()),
    }
}
