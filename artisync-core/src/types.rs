//! Domain types shared by the manifest builder and the sync engine.
//!
//! Identifiers are plain-string newtypes so they serialize transparently
//! into manifests and backend requests.

use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Identifier of an artifact, either client-generated or assigned by the
/// backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactId(pub String);

impl ArtifactId {
    /// A fresh random client-side id (UUID v4, hyphen-free).
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for ArtifactId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ArtifactId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Logical destination of one upload job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SaveName(pub String);

impl SaveName {
    /// Content-addressed destination: every artifact uploading the same
    /// digest targets the same save name.
    pub fn for_content(digest: &Digest) -> Self {
        Self(format!("content/{}", digest.0))
    }

    /// Destination of an artifact's own manifest file.
    pub fn for_manifest(artifact: &ArtifactId) -> Self {
        Self(format!("artifacts/{}/artifact_manifest.json", artifact.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SaveName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for SaveName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for SaveName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Lowercase hex SHA-256 of a file's content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(pub String);

impl Digest {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for Digest {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Digest {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Whether a manifest describes a whole artifact version or a contribution
/// that is merged onto the previous version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManifestKind {
    #[default]
    Full,
    Incremental,
}

impl fmt::Display for ManifestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestKind::Full => write!(f, "FULL"),
            ManifestKind::Incremental => write!(f, "INCREMENTAL"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newtype_display() {
        assert_eq!(ArtifactId::from("a1").to_string(), "a1");
        assert_eq!(SaveName::from("x/y.json").to_string(), "x/y.json");
        assert_eq!(Digest::from("abc").to_string(), "abc");
    }

    #[test]
    fn content_save_name_is_keyed_by_digest() {
        let digest = Digest::from("deadbeef");
        assert_eq!(SaveName::for_content(&digest).as_str(), "content/deadbeef");
        assert_eq!(
            SaveName::for_manifest(&ArtifactId::from("42")).as_str(),
            "artifacts/42/artifact_manifest.json"
        );
    }

    #[test]
    fn generated_ids_are_distinct() {
        let a = ArtifactId::generate();
        let b = ArtifactId::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn manifest_kind_serializes_upper_case() {
        let json = serde_json::to_string(&ManifestKind::Incremental).expect("serialize");
        assert_eq!(json, "\"INCREMENTAL\"");
        assert_eq!(ManifestKind::Full.to_string(), "FULL");
    }
}
