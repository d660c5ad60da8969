//! Artifact store port.
//!
//! Artifacts are addressed by `(step, fingerprint)`. Once published, an entry
//! is only replaced when it is corrupted or when a forced rebuild republishes
//! it. Implementations live in stepwise-infra.
//!
//! - `mirror` -- the remote mirror port consulted on local misses

pub mod mirror;

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use stepwise_types::artifact::Artifact;
use stepwise_types::error::StoreError;
use stepwise_types::fingerprint::Fingerprint;
use stepwise_types::identifier::StepIdentifier;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub use mirror::{BoxRemoteMirror, RemoteMirror, RemoteMirrorDyn};

/// Trait for the content-addressed artifact cache.
///
/// Uses RPITIT (native async fn in traits, Rust 2024 edition).
///
/// Writers of the same key are serialized with [`ArtifactStore::lock`];
/// readers (`exists`, `fetch`) never take the lock.
pub trait ArtifactStore: Send + Sync {
    /// Cheap presence check; does not validate contents.
    fn exists(
        &self,
        step: &StepIdentifier,
        fingerprint: &Fingerprint,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Load and validate an artifact.
    ///
    /// Returns `NotFound` when nothing is stored (locally or on the mirror)
    /// and `Corruption` when the stored copy fails validation.
    fn fetch(
        &self,
        step: &StepIdentifier,
        fingerprint: &Fingerprint,
    ) -> impl Future<Output = Result<Artifact, StoreError>> + Send;

    /// A fresh, empty directory for an adapter to write its output into.
    fn staging_dir(
        &self,
        step: &StepIdentifier,
        fingerprint: &Fingerprint,
    ) -> impl Future<Output = Result<PathBuf, StoreError>> + Send;

    /// Move a staging directory into the store under `(step, fingerprint)`.
    ///
    /// Publishing a key that already exists returns the stored artifact and
    /// discards the staging directory, unless `replace` is set: then the new
    /// output takes the place of the stored one (forced rebuilds).
    fn publish(
        &self,
        step: &StepIdentifier,
        fingerprint: &Fingerprint,
        staging: &Path,
        replace: bool,
    ) -> impl Future<Output = Result<Artifact, StoreError>> + Send;

    /// Remove a staging directory that will not be published.
    fn discard_staging(&self, staging: &Path) -> impl Future<Output = ()> + Send;

    /// Remove a stored entry (used for corrupted copies).
    fn invalidate(
        &self,
        step: &StepIdentifier,
        fingerprint: &Fingerprint,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Exclusive build guard for one key. Held from the second cache check
    /// until publish completes.
    fn lock(
        &self,
        step: &StepIdentifier,
        fingerprint: &Fingerprint,
    ) -> impl Future<Output = BuildLock> + Send;
}

/// Held while a key is being built. Dropping it releases the key.
#[derive(Debug)]
pub struct BuildLock {
    _guard: OwnedMutexGuard<()>,
}

/// Per-key async mutexes for single-writer publishing within a process.
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: DashMap<(StepIdentifier, Fingerprint), Arc<Mutex<()>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other holder builds `(step, fingerprint)`.
    pub async fn acquire(&self, step: &StepIdentifier, fingerprint: &Fingerprint) -> BuildLock {
        // Clone the Arc out so the map shard is not held across the await.
        let mutex = self
            .locks
            .entry((step.clone(), *fingerprint))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        BuildLock {
            _guard: mutex.lock_owned().await,
        }
    }

    /// Drop entries nobody holds or waits for.
    pub fn prune(&self) {
        self.locks.retain(|_, mutex| Arc::strong_count(mutex) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
