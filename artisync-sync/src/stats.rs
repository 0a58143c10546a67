//! Shared transfer statistics.
//!
//! Every worker mutates the same [`TransferStats`]; all mutations go through
//! one `parking_lot::Mutex`, so a [`StatsSummary`] is always a consistent
//! snapshot.

use std::collections::{BTreeSet, HashMap};

use parking_lot::Mutex;
use serde::Serialize;

/// Progress record of one file (keyed by save name).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FileStats {
    pub total: u64,
    pub uploaded: u64,
    pub deduped: bool,
    pub failed: bool,
    pub artifact_file: bool,
}

/// Aggregate view returned by [`TransferStats::summary`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSummary {
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    pub deduped_bytes: u64,
    pub deduped_files: BTreeSet<String>,
    pub failed_files: BTreeSet<String>,
    pub artifact_files: usize,
}

#[derive(Debug, Default)]
struct Inner {
    files: HashMap<String, FileStats>,
    uploaded_bytes: u64,
    total_bytes: u64,
    deduped_bytes: u64,
    deduped_files: BTreeSet<String>,
    failed_files: BTreeSet<String>,
}

impl Inner {
    /// Remove a file's contribution to the aggregate counters.
    fn forget(&mut self, name: &str) {
        let Some(old) = self.files.remove(name) else {
            return;
        };
        self.total_bytes -= old.total;
        self.uploaded_bytes -= old.uploaded;
        if old.deduped {
            self.deduped_bytes -= old.total;
            self.deduped_files.remove(name);
        }
        if old.failed {
            self.failed_files.remove(name);
        }
    }
}

#[derive(Debug, Default)]
pub struct TransferStats {
    inner: Mutex<Inner>,
}

impl TransferStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a file about to be uploaded. Registering the same name again
    /// replaces its previous contribution.
    pub fn init_file(&self, name: &str, size: u64, artifact_file: bool) {
        let mut inner = self.inner.lock();
        inner.forget(name);
        inner.total_bytes += size;
        inner.files.insert(
            name.to_string(),
            FileStats {
                total: size,
                artifact_file,
                ..FileStats::default()
            },
        );
    }

    /// Record cumulative progress. Lower values than already recorded and
    /// unknown names are ignored.
    pub fn update_uploaded_file(&self, name: &str, uploaded: u64) {
        let mut inner = self.inner.lock();
        let Some(file) = inner.files.get_mut(name) else {
            return;
        };
        if uploaded <= file.uploaded {
            return;
        }
        let delta = uploaded - file.uploaded;
        file.uploaded = uploaded;
        inner.uploaded_bytes += delta;
    }

    /// The transfer finished: raise the file's progress to its total.
    pub fn set_file_uploaded(&self, name: &str) {
        let total = match self.inner.lock().files.get(name) {
            Some(file) => file.total,
            None => return,
        };
        self.update_uploaded_file(name, total);
    }

    /// The content was already present remotely; nothing was transferred.
    pub fn set_file_deduped(&self, name: &str) {
        let mut inner = self.inner.lock();
        let Some(file) = inner.files.get_mut(name) else {
            return;
        };
        if file.deduped {
            return;
        }
        file.deduped = true;
        let total = file.total;
        inner.deduped_bytes += total;
        inner.deduped_files.insert(name.to_string());
    }

    /// The upload failed; bytes it had reported no longer count as uploaded.
    pub fn update_failed_file(&self, name: &str) {
        let mut inner = self.inner.lock();
        let Some(file) = inner.files.get_mut(name) else {
            return;
        };
        file.failed = true;
        let uploaded = std::mem::take(&mut file.uploaded);
        inner.uploaded_bytes -= uploaded;
        inner.failed_files.insert(name.to_string());
    }

    pub fn file(&self, name: &str) -> Option<FileStats> {
        self.inner.lock().files.get(name).cloned()
    }

    pub fn summary(&self) -> StatsSummary {
        let inner = self.inner.lock();
        StatsSummary {
            uploaded_bytes: inner.uploaded_bytes,
            total_bytes: inner.total_bytes,
            deduped_bytes: inner.deduped_bytes,
            deduped_files: inner.deduped_files.clone(),
            failed_files: inner.failed_files.clone(),
            artifact_files: inner.files.values().filter(|f| f.artifact_file).count(),
        }
    }
}
