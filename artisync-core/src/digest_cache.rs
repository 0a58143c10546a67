//! Cross-artifact digest cache: the client half of upload dedup.
//!
//! A digest moves through two states. The first artifact to add some content
//! *reserves* it; the reservation only records who will upload it. Once that
//! artifact's upload and commit went through, the sync engine *confirms* the
//! digest, and from then on later artifacts get a reference to the confirmed
//! owner instead of scheduling another transfer. While a digest is merely
//! reserved, other artifacts upload their own copy, so no reference ever
//! points at content that has not reached the store.
//!
//! The cache is an explicitly-owned value (`Arc<DigestCache>`) injected into
//! each [`Artifact`](crate::Artifact), never ambient global state.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::artifact::ARTIFACT_SCHEME;
use crate::types::{ArtifactId, Digest};

/// The artifact entry that owns the upload of a digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentOwner {
    pub artifact: ArtifactId,
    pub path: String,
    pub size: u64,
}

impl ContentOwner {
    /// `artisync-artifact://<artifact>/<path>`
    pub fn reference_uri(&self) -> String {
        format!("{ARTIFACT_SCHEME}://{}/{}", self.artifact, self.path)
    }
}

/// Result of [`DigestCache::reserve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    /// The caller is now the owner of this digest.
    Reserved,
    /// The caller's own artifact already reserved this digest.
    Owned(ContentOwner),
    /// Another artifact reserved this digest but has not uploaded it yet.
    /// The caller uploads its own copy.
    InFlight(ContentOwner),
    /// Another artifact uploaded and committed this digest; reference it.
    Existing(ContentOwner),
}

#[derive(Debug, Clone)]
struct Slot {
    owner: ContentOwner,
    confirmed: bool,
}

/// Process-wide digest → owner map with atomic check-and-reserve.
#[derive(Debug, Default)]
pub struct DigestCache {
    slots: Mutex<HashMap<Digest, Slot>>,
}

impl DigestCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically look up `digest` and claim it for `candidate` if unowned.
    pub fn reserve(&self, digest: &Digest, candidate: ContentOwner) -> Reservation {
        let mut slots = self.slots.lock();
        match slots.get(digest) {
            Some(slot) if slot.confirmed => Reservation::Existing(slot.owner.clone()),
            Some(slot) if slot.owner.artifact == candidate.artifact => {
                Reservation::Owned(slot.owner.clone())
            }
            Some(slot) => Reservation::InFlight(slot.owner.clone()),
            None => {
                tracing::trace!(digest = %digest, artifact = %candidate.artifact, "digest reserved");
                slots.insert(
                    digest.clone(),
                    Slot {
                        owner: candidate,
                        confirmed: false,
                    },
                );
                Reservation::Reserved
            }
        }
    }

    /// Record that `owner` uploaded and committed `digest`. The first
    /// confirmation wins, even over another artifact's pending reservation.
    /// Returns `true` if `owner` became the referenced owner.
    pub fn confirm(&self, digest: &Digest, owner: ContentOwner) -> bool {
        let mut slots = self.slots.lock();
        match slots.get_mut(digest) {
            Some(slot) if slot.confirmed => false,
            Some(slot) => {
                slot.owner = owner;
                slot.confirmed = true;
                true
            }
            None => {
                slots.insert(
                    digest.clone(),
                    Slot {
                        owner,
                        confirmed: true,
                    },
                );
                true
            }
        }
    }

    /// Whether a reference to `digest` would be handed out.
    pub fn is_confirmed(&self, digest: &Digest) -> bool {
        self.slots
            .lock()
            .get(digest)
            .is_some_and(|slot| slot.confirmed)
    }

    /// Drop one unconfirmed reservation held by `artifact`. Returns `true` if
    /// removed.
    pub fn release(&self, digest: &Digest, artifact: &ArtifactId) -> bool {
        let mut slots = self.slots.lock();
        match slots.get(digest) {
            Some(slot) if !slot.confirmed && &slot.owner.artifact == artifact => {
                slots.remove(digest);
                true
            }
            _ => false,
        }
    }

    /// Drop every unconfirmed reservation held by `artifact` (it failed or
    /// was never logged), so later artifacts upload the content themselves.
    /// Returns the number removed.
    pub fn release_artifact(&self, artifact: &ArtifactId) -> usize {
        let mut slots = self.slots.lock();
        let before = slots.len();
        slots.retain(|_, slot| slot.confirmed || &slot.owner.artifact != artifact);
        before - slots.len()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}
