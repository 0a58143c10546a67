//! Content-addressed artifact manifest.
//!
//! A [`Manifest`] maps every logical path of an artifact to either a content
//! digest (uploaded by this artifact) or a reference to content owned
//! elsewhere. Entries are kept in a `BTreeMap`, so iteration and the JSON
//! serialization are ordered by path and the manifest digest is stable.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ArtifactError;
use crate::hash::digest_bytes;
use crate::types::{Digest, ManifestKind};

/// Current manifest document version.
pub const MANIFEST_VERSION: u32 = 1;

/// One logical path of an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
    /// Content owned by another artifact or an external location.
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// `None` only for external references not yet resolved by the backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Local file holding the content until the upload succeeds.
    #[serde(skip)]
    pub local_path: Option<PathBuf>,
    /// `local_path` is a staging copy made solely for the upload.
    #[serde(skip)]
    pub staged: bool,
}

impl ManifestEntry {
    /// An entry whose content is uploaded by the owning artifact.
    pub fn content(
        path: impl Into<String>,
        digest: Digest,
        size: u64,
        local_path: PathBuf,
        staged: bool,
    ) -> Self {
        Self {
            path: path.into(),
            digest: Some(digest),
            reference: None,
            size: Some(size),
            local_path: Some(local_path),
            staged,
        }
    }

    /// An entry pointing at content stored elsewhere; never uploaded.
    pub fn reference(path: impl Into<String>, uri: impl Into<String>, size: Option<u64>) -> Self {
        Self {
            path: path.into(),
            digest: None,
            reference: Some(uri.into()),
            size,
            local_path: None,
            staged: false,
        }
    }

    pub fn is_reference(&self) -> bool {
        self.reference.is_some()
    }
}

/// One unique piece of content that must be transferred for a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpload {
    pub digest: Digest,
    pub local_path: PathBuf,
    pub size: u64,
    pub staged: bool,
    /// Every logical path served by this content, in path order.
    pub paths: Vec<String>,
}

/// Ordered mapping of logical path to [`ManifestEntry`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub kind: ManifestKind,
    #[serde(rename = "contents")]
    entries: BTreeMap<String, ManifestEntry>,
    /// First path holding each digest; rebuilt on load.
    #[serde(skip)]
    by_digest: HashMap<Digest, String>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new(ManifestKind::Full)
    }
}

impl Manifest {
    pub fn new(kind: ManifestKind) -> Self {
        Self {
            version: MANIFEST_VERSION,
            kind,
            entries: BTreeMap::new(),
            by_digest: HashMap::new(),
        }
    }

    /// Insert an entry, rejecting a path that is already present.
    pub fn insert(&mut self, entry: ManifestEntry) -> Result<&ManifestEntry, ArtifactError> {
        if self.entries.contains_key(&entry.path) {
            return Err(ArtifactError::DuplicatePath { path: entry.path });
        }
        if let Some(digest) = &entry.digest {
            self.by_digest
                .entry(digest.clone())
                .or_insert_with(|| entry.path.clone());
        }
        let path = entry.path.clone();
        Ok(self.entries.entry(path).or_insert(entry))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn get(&self, path: &str) -> Option<&ManifestEntry> {
        self.entries.get(path)
    }

    /// The first entry (by insertion) carrying `digest`.
    pub fn entry_for_digest(&self, digest: &Digest) -> Option<&ManifestEntry> {
        self.by_digest
            .get(digest)
            .and_then(|path| self.entries.get(path))
    }

    pub fn entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Unique content this manifest must upload: one item per digest, reference
    /// entries excluded.
    pub fn uploads(&self) -> Vec<PendingUpload> {
        let mut uploads: Vec<PendingUpload> = Vec::new();
        let mut index: HashMap<&Digest, usize> = HashMap::new();
        for entry in self.entries.values() {
            let (Some(digest), Some(local_path)) = (&entry.digest, &entry.local_path) else {
                continue;
            };
            if entry.is_reference() {
                continue;
            }
            match index.get(digest) {
                Some(&i) => uploads[i].paths.push(entry.path.clone()),
                None => {
                    index.insert(digest, uploads.len());
                    uploads.push(PendingUpload {
                        digest: digest.clone(),
                        local_path: local_path.clone(),
                        size: entry.size.unwrap_or(0),
                        staged: entry.staged,
                        paths: vec![entry.path.clone()],
                    });
                }
            }
        }
        uploads
    }

    /// Staging copies still referenced by this manifest.
    pub fn staged_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .entries
            .values()
            .filter(|e| e.staged)
            .filter_map(|e| e.local_path.clone())
            .collect();
        paths.sort();
        paths.dedup();
        paths
    }

    /// Fill in sizes the backend reported for unresolved references.
    pub fn resolve_sizes(&mut self, sizes: &BTreeMap<String, u64>) {
        for (path, size) in sizes {
            if let Some(entry) = self.entries.get_mut(path) {
                if entry.size.is_none() {
                    entry.size = Some(*size);
                }
            }
        }
    }

    /// Merge another manifest's entries; entries already present win.
    pub fn merge(&mut self, other: &Manifest) {
        for entry in other.entries.values() {
            if !self.entries.contains_key(&entry.path) {
                // Cannot collide: presence checked above.
                let _ = self.insert(entry.clone());
            }
        }
    }

    /// Canonical JSON document (path-ordered, pretty-printed).
    pub fn to_json_bytes(&self) -> Result<Vec<u8>, ArtifactError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Parse a manifest document and rebuild the digest index.
    pub fn from_json_slice(data: &[u8]) -> Result<Self, ArtifactError> {
        let mut manifest: Manifest = serde_json::from_slice(data)?;
        let mut by_digest = HashMap::new();
        for entry in manifest.entries.values() {
            if let Some(digest) = &entry.digest {
                by_digest
                    .entry(digest.clone())
                    .or_insert_with(|| entry.path.clone());
            }
        }
        manifest.by_digest = by_digest;
        Ok(manifest)
    }

    /// SHA-256 of [`Manifest::to_json_bytes`].
    pub fn digest(&self) -> Result<Digest, ArtifactError> {
        Ok(digest_bytes(&self.to_json_bytes()?))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
