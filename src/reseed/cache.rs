//! Hot-swappable bundle cache.
//!
//! The live [`Generation`] sits behind an `Arc` in a `tokio::sync::watch`
//! slot.  Publishing swaps the `Arc`; readers clone it and then work on an
//! immutable snapshot, so a reader sees one whole generation and never waits
//! for a build.
//!
//! Selection policy: uniform random over the live generation's bundles.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::watch;
use tracing::debug;

use super::error::ReseedError;

/// MIME type served with every bundle.
pub const SU3_CONTENT_TYPE: &str = "application/octet-stream";

/// One signed su3 file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    /// Id of the generation this bundle belongs to.
    pub generation: u64,
    /// Position within the generation.
    pub index: usize,
    pub record_count: usize,
    pub bytes: Bytes,
}

impl Bundle {
    pub fn content_type(&self) -> &'static str {
        SU3_CONTENT_TYPE
    }
}

/// Every bundle produced by one build cycle.
#[derive(Debug, Clone)]
pub struct Generation {
    /// Strictly increasing across publications.
    pub id: u64,
    pub built_at: DateTime<Utc>,
    /// Records the descriptor source offered for this build.
    pub source_records: usize,
    pub bundles: Vec<Bundle>,
}

impl Generation {
    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }
}

/// Observable cache state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Nothing published yet.
    Empty,
    /// A generation is live (possibly with zero bundles).
    Ready { generation: u64, bundles: usize },
}

#[derive(Clone)]
pub struct BundleCache {
    live: Arc<watch::Sender<Option<Arc<Generation>>>>,
}

impl Default for BundleCache {
    fn default() -> Self {
        Self::new()
    }
}

impl BundleCache {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { live: Arc::new(tx) }
    }

    /// Make `generation` live.
    ///
    /// Returns `false` (and changes nothing) if a generation with an equal or
    /// higher id is already live.
    pub fn publish(&self, generation: Generation) -> bool {
        let generation = Arc::new(generation);
        let id = generation.id;
        let published = self.live.send_if_modified(|slot| {
            let newer = slot.as_ref().map_or(true, |current| current.id < id);
            if newer {
                *slot = Some(generation);
            }
            newer
        });
        debug!(generation = id, published, "cache publish");
        published
    }

    /// The live generation, if any.
    pub fn current(&self) -> Option<Arc<Generation>> {
        self.live.borrow().clone()
    }

    pub fn status(&self) -> CacheStatus {
        match self.current() {
            None => CacheStatus::Empty,
            Some(g) => CacheStatus::Ready {
                generation: g.id,
                bundles: g.bundles.len(),
            },
        }
    }

    /// Watch publications (e.g. to wait for the first generation).
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Generation>>> {
        self.live.subscribe()
    }

    /// A uniformly random bundle from the live generation.
    pub fn get_random_bundle(&self) -> Result<Bundle, ReseedError> {
        let generation = self.current().ok_or(ReseedError::CacheNotReady)?;
        if generation.bundles.is_empty() {
            return Err(ReseedError::CacheEmpty);
        }
        let i = rand::thread_rng().gen_range(0..generation.bundles.len());
        Ok(generation.bundles[i].clone())
    }
}
