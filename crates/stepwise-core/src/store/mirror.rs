//! Remote mirror port and its type-erased wrapper.
//!
//! A mirror holds entries in the same layout as the local store
//! (`artifact.json` plus `payload/`). The local store pulls from it on a miss
//! and optionally pushes freshly published artifacts to it.
//!
//! Follows the usual blanket-impl pattern for RPITIT traits:
//! 1. `RemoteMirrorDyn` is object-safe with boxed futures
//! 2. Every `T: RemoteMirror` implements it
//! 3. `BoxRemoteMirror` wraps `Box<dyn RemoteMirrorDyn>` and delegates

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use stepwise_types::artifact::Artifact;
use stepwise_types::error::StoreError;
use stepwise_types::fingerprint::Fingerprint;
use stepwise_types::identifier::StepIdentifier;

/// Trait for a remote copy of the artifact store.
pub trait RemoteMirror: Send + Sync {
    /// Human-readable location, for logs.
    fn describe(&self) -> String;

    fn contains(
        &self,
        step: &StepIdentifier,
        fingerprint: &Fingerprint,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Download the entry into `dest` (manifest plus payload directory).
    /// Returns `false` when the mirror does not have it.
    fn pull(
        &self,
        step: &StepIdentifier,
        fingerprint: &Fingerprint,
        dest: &Path,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    /// Upload a published artifact; `artifact.location` is its payload directory.
    fn push(&self, artifact: &Artifact) -> impl Future<Output = Result<(), StoreError>> + Send;
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Object-safe version of [`RemoteMirror`] with boxed futures.
pub trait RemoteMirrorDyn: Send + Sync {
    fn describe(&self) -> String;

    fn contains_boxed<'a>(
        &'a self,
        step: &'a StepIdentifier,
        fingerprint: &'a Fingerprint,
    ) -> BoxFuture<'a, Result<bool, StoreError>>;

    fn pull_boxed<'a>(
        &'a self,
        step: &'a StepIdentifier,
        fingerprint: &'a Fingerprint,
        dest: &'a Path,
    ) -> BoxFuture<'a, Result<bool, StoreError>>;

    fn push_boxed<'a>(&'a self, artifact: &'a Artifact) -> BoxFuture<'a, Result<(), StoreError>>;
}

impl<T: RemoteMirror> RemoteMirrorDyn for T {
    fn describe(&self) -> String {
        RemoteMirror::describe(self)
    }

    fn contains_boxed<'a>(
        &'a self,
        step: &'a StepIdentifier,
        fingerprint: &'a Fingerprint,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(self.contains(step, fingerprint))
    }

    fn pull_boxed<'a>(
        &'a self,
        step: &'a StepIdentifier,
        fingerprint: &'a Fingerprint,
        dest: &'a Path,
    ) -> BoxFuture<'a, Result<bool, StoreError>> {
        Box::pin(self.pull(step, fingerprint, dest))
    }

    fn push_boxed<'a>(&'a self, artifact: &'a Artifact) -> BoxFuture<'a, Result<(), StoreError>> {
        Box::pin(self.push(artifact))
    }
}

/// Type-erased mirror, chosen at runtime from configuration.
pub struct BoxRemoteMirror {
    inner: Box<dyn RemoteMirrorDyn>,
}

impl BoxRemoteMirror {
    pub fn new<T: RemoteMirror + 'static>(mirror: T) -> Self {
        Self {
            inner: Box::new(mirror),
        }
    }

    pub fn describe(&self) -> String {
        self.inner.describe()
    }

    pub async fn contains(
        &self,
        step: &StepIdentifier,
        fingerprint: &Fingerprint,
    ) -> Result<bool, StoreError> {
        self.inner.contains_boxed(step, fingerprint).await
    }

    pub async fn pull(
        &self,
        step: &StepIdentifier,
        fingerprint: &Fingerprint,
        dest: &Path,
    ) -> Result<bool, StoreError> {
        self.inner.pull_boxed(step, fingerprint, dest).await
    }

    pub async fn push(&self, artifact: &Artifact) -> Result<(), StoreError> {
        self.inner.push_boxed(artifact).await
    }
}

impl std::fmt::Debug for BoxRemoteMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxRemoteMirror")
            .field("location", &self.inner.describe())
            .finish()
    }
}
