//! Step adapter port: the contract between the engine and step code.
//!
//! The engine hands an adapter the artifact locations of a node's
//! dependencies and an empty destination directory. The adapter writes the
//! node's output into the destination or reports why it could not. The
//! engine tracks nothing beyond location, fingerprint, and pass/fail.
//!
//! Dispatch is by [`ExecutorKind`]: one adapter per category, chosen with a
//! `match` in [`AdapterSet::get`].

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;

use stepwise_types::error::StepExecutionError;
use stepwise_types::fingerprint::Fingerprint;
use stepwise_types::identifier::{Category, StepIdentifier};
use tokio_util::sync::CancellationToken;

use crate::graph::ExecutorKind;

/// Resolved artifact of one dependency.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyInput {
    pub step: StepIdentifier,
    pub fingerprint: Fingerprint,
    /// Payload directory of the dependency's artifact.
    pub location: PathBuf,
}

/// Everything an adapter gets to build one node.
#[derive(Debug, Clone)]
pub struct StepInvocation {
    pub step: StepIdentifier,
    pub fingerprint: Fingerprint,
    /// Dependencies in identifier order.
    pub inputs: Vec<DependencyInput>,
    /// Empty directory the output must be written into.
    pub dest: PathBuf,
    /// Cancelled when the run is cancelled; adapters should stop promptly.
    pub cancel: CancellationToken,
}

/// Successful adapter result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdapterOutput {
    /// Free-form detail for logs (e.g. the tail of a command's stdout).
    pub detail: Option<String>,
}

/// Trait for executing one category of steps.
///
/// Uses RPITIT (native async fn in traits, Rust 2024 edition).
pub trait StepAdapter: Send + Sync {
    fn name(&self) -> &str;

    fn execute(
        &self,
        invocation: &StepInvocation,
    ) -> impl Future<Output = Result<AdapterOutput, StepExecutionError>> + Send;
}

/// Object-safe version of [`StepAdapter`] with boxed futures.
pub trait StepAdapterDyn: Send + Sync {
    fn name(&self) -> &str;

    fn execute_boxed<'a>(
        &'a self,
        invocation: &'a StepInvocation,
    ) -> Pin<Box<dyn Future<Output = Result<AdapterOutput, StepExecutionError>> + Send + 'a>>;
}

impl<T: StepAdapter> StepAdapterDyn for T {
    fn name(&self) -> &str {
        StepAdapter::name(self)
    }

    fn execute_boxed<'a>(
        &'a self,
        invocation: &'a StepInvocation,
    ) -> Pin<Box<dyn Future<Output = Result<AdapterOutput, StepExecutionError>> + Send + 'a>> {
        Box::pin(self.execute(invocation))
    }
}

/// Type-erased step adapter.
pub struct BoxStepAdapter {
    inner: Box<dyn StepAdapterDyn>,
}

impl BoxStepAdapter {
    pub fn new<T: StepAdapter + 'static>(adapter: T) -> Self {
        Self {
            inner: Box::new(adapter),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn execute(
        &self,
        invocation: &StepInvocation,
    ) -> Result<AdapterOutput, StepExecutionError> {
        self.inner.execute_boxed(invocation).await
    }
}

impl std::fmt::Debug for BoxStepAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStepAdapter")
            .field("name", &self.inner.name())
            .finish()
    }
}

/// One adapter slot per executor kind.
#[derive(Debug, Default)]
pub struct AdapterSet {
    snapshot: Option<BoxStepAdapter>,
    dataset: Option<BoxStepAdapter>,
    view: Option<BoxStepAdapter>,
    export: Option<BoxStepAdapter>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `adapter` for `kind`, replacing any previous one.
    pub fn with(mut self, kind: ExecutorKind, adapter: BoxStepAdapter) -> Self {
        *self.slot_mut(kind) = Some(adapter);
        self
    }

    pub fn get(&self, kind: ExecutorKind) -> Option<&BoxStepAdapter> {
        match kind {
            ExecutorKind::Snapshot => self.snapshot.as_ref(),
            ExecutorKind::Dataset => self.dataset.as_ref(),
            ExecutorKind::View => self.view.as_ref(),
            ExecutorKind::Export => self.export.as_ref(),
        }
    }

    fn slot_mut(&mut self, kind: ExecutorKind) -> &mut Option<BoxStepAdapter> {
        match kind {
            ExecutorKind::Snapshot => &mut self.snapshot,
            ExecutorKind::Dataset => &mut self.dataset,
            ExecutorKind::View => &mut self.view,
            ExecutorKind::Export => &mut self.export,
        }
    }

    /// Run `invocation` with the adapter for `kind`.
    pub async fn execute(
        &self,
        kind: ExecutorKind,
        invocation: &StepInvocation,
    ) -> Result<AdapterOutput, StepExecutionError> {
        match self.get(kind) {
            Some(adapter) => adapter.execute(invocation).await,
            None => Err(StepExecutionError::NoAdapter(category_of(kind))),
        }
    }
}

fn category_of(kind: ExecutorKind) -> Category {
    match kind {
        ExecutorKind::Snapshot => Category::RawSnapshot,
        ExecutorKind::Dataset => Category::CuratedDataset,
        ExecutorKind::View => Category::PublishedView,
        ExecutorKind::Export => Category::ExportedArtifact,
    }
}
