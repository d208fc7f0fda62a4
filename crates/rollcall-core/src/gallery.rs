//! In-memory cache of enrolled signatures.

use crate::store::{GallerySource, StoreError};
use crate::types::{GalleryEntry, IdentityId};
use serde::Serialize;
use std::collections::HashSet;

/// Ordered, read-only set of known signatures. Replaced wholesale on reload.
#[derive(Debug, Clone, Default)]
pub struct Gallery {
    entries: Vec<GalleryEntry>,
}

/// Size summary reported after a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GalleryStats {
    pub signatures: usize,
    pub identities: usize,
}

impl Gallery {
    /// Build a gallery, keeping source order.
    ///
    /// The first entry fixes the signature dimension; entries that disagree
    /// (or are empty) are dropped.
    pub fn new(entries: Vec<GalleryEntry>) -> Self {
        let dim = entries.iter().map(|e| e.signature.len()).find(|&n| n > 0);
        let mut kept = Vec::with_capacity(entries.len());
        for entry in entries {
            if Some(entry.signature.len()) == dim {
                kept.push(entry);
            } else {
                tracing::warn!(
                    identity = %entry.identity.id,
                    len = entry.signature.len(),
                    expected = ?dim,
                    "dropping signature with mismatched dimension"
                );
            }
        }
        Self { entries: kept }
    }

    /// Load every signature from the datastore.
    pub fn load(source: &impl GallerySource) -> Result<Self, StoreError> {
        let gallery = Self::new(source.load_all_signatures()?);
        let stats = gallery.stats();
        tracing::info!(
            signatures = stats.signatures,
            identities = stats.identities,
            "gallery loaded"
        );
        Ok(gallery)
    }

    pub fn entries(&self) -> &[GalleryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Signature dimension, or `None` for an empty gallery.
    pub fn dimension(&self) -> Option<usize> {
        self.entries.first().map(|e| e.signature.len())
    }

    pub fn stats(&self) -> GalleryStats {
        let identities: HashSet<IdentityId> =
            self.entries.iter().map(|e| e.identity.id).collect();
        GalleryStats {
            signatures: self.entries.len(),
            identities: identities.len(),
        }
    }
}
