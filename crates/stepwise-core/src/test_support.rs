//! In-memory ports and scripted adapters for unit tests.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use stepwise_types::artifact::Artifact;
use stepwise_types::error::{StepExecutionError, StoreError};
use stepwise_types::fingerprint::Fingerprint;
use stepwise_types::identifier::StepIdentifier;
use tokio::sync::Notify;

use crate::adapter::{AdapterOutput, StepAdapter, StepInvocation};
use crate::checksum::{ChecksumError, DefinitionSource};
use crate::graph::DagNode;
use crate::store::{ArtifactStore, BuildLock, KeyLocks};

pub fn id(s: &str) -> StepIdentifier {
    StepIdentifier::parse(s).unwrap()
}

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
pub struct MemoryDefinitionSource {
    definitions: HashMap<StepIdentifier, Vec<u8>>,
}

impl MemoryDefinitionSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, step: &str, code: &str) -> Self {
        self.definitions.insert(id(step), code.as_bytes().to_vec());
        self
    }
}

impl DefinitionSource for MemoryDefinitionSource {
    async fn definition(&self, node: &DagNode) -> Result<Option<Vec<u8>>, ChecksumError> {
        Ok(self.definitions.get(&node.id).cloned())
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

type Key = (StepIdentifier, Fingerprint);

/// Artifact index in memory; staging directories in a temp dir so adapters
/// can write real files.
pub struct MemoryArtifactStore {
    root: tempfile::TempDir,
    entries: Mutex<HashMap<Key, Artifact>>,
    corrupted: Mutex<HashSet<Key>>,
    staged: AtomicUsize,
    locks: KeyLocks,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self {
            root: tempfile::tempdir().unwrap(),
            entries: Mutex::new(HashMap::new()),
            corrupted: Mutex::new(HashSet::new()),
            staged: AtomicUsize::new(0),
            locks: KeyLocks::new(),
        }
    }

    /// Make the next fetch of this key report corruption.
    pub fn corrupt(&self, step: &StepIdentifier, fingerprint: &Fingerprint) {
        self.corrupted
            .lock()
            .unwrap()
            .insert((step.clone(), *fingerprint));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

impl ArtifactStore for MemoryArtifactStore {
    async fn exists(
        &self,
        step: &StepIdentifier,
        fingerprint: &Fingerprint,
    ) -> Result<bool, StoreError> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .contains_key(&(step.clone(), *fingerprint)))
    }

    async fn fetch(
        &self,
        step: &StepIdentifier,
        fingerprint: &Fingerprint,
    ) -> Result<Artifact, StoreError> {
        let key = (step.clone(), *fingerprint);
        if self.corrupted.lock().unwrap().contains(&key) {
            return Err(StoreError::Corruption {
                step: step.clone(),
                fingerprint: *fingerprint,
                detail: "checksum mismatch".to_string(),
            });
        }
        self.entries
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                step: step.clone(),
                fingerprint: *fingerprint,
            })
    }

    async fn staging_dir(
        &self,
        _step: &StepIdentifier,
        _fingerprint: &Fingerprint,
    ) -> Result<PathBuf, StoreError> {
        let n = self.staged.fetch_add(1, Ordering::SeqCst);
        let dir = self.root.path().join(format!("staging-{n}"));
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        Ok(dir)
    }

    async fn publish(
        &self,
        step: &StepIdentifier,
        fingerprint: &Fingerprint,
        staging: &Path,
        replace: bool,
    ) -> Result<Artifact, StoreError> {
        let fresh = Artifact {
            step: step.clone(),
            fingerprint: *fingerprint,
            files: Vec::new(),
            size_bytes: 0,
            content_checksum: String::new(),
            created_at: Utc::now(),
            location: staging.to_path_buf(),
        };
        let mut entries = self.entries.lock().unwrap();
        let key = (step.clone(), *fingerprint);
        if replace {
            entries.insert(key, fresh.clone());
            return Ok(fresh);
        }
        Ok(entries.entry(key).or_insert(fresh).clone())
    }

    async fn discard_staging(&self, staging: &Path) {
        let _ = std::fs::remove_dir_all(staging);
    }

    async fn invalidate(
        &self,
        step: &StepIdentifier,
        fingerprint: &Fingerprint,
    ) -> Result<(), StoreError> {
        let key = (step.clone(), *fingerprint);
        self.corrupted.lock().unwrap().remove(&key);
        self.entries.lock().unwrap().remove(&key);
        Ok(())
    }

    async fn lock(&self, step: &StepIdentifier, fingerprint: &Fingerprint) -> BuildLock {
        self.locks.acquire(step, fingerprint).await
    }
}

// ---------------------------------------------------------------------------
// Adapters
// ---------------------------------------------------------------------------

type Calls = Arc<Mutex<Vec<StepIdentifier>>>;
type Inputs = Arc<Mutex<Vec<(StepIdentifier, Vec<StepIdentifier>)>>>;

async fn write_output(invocation: &StepInvocation) -> Result<(), StepExecutionError> {
    tokio::fs::write(invocation.dest.join("output.txt"), invocation.step.to_string())
        .await
        .map_err(|e| StepExecutionError::failed(e.to_string()))
}

/// Succeeds for every step and records the call order.
#[derive(Default)]
pub struct RecordingAdapter {
    calls: Calls,
    inputs: Inputs,
    delay: Option<Duration>,
}

impl RecordingAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Calls {
        Arc::clone(&self.calls)
    }

    pub fn inputs(&self) -> Inputs {
        Arc::clone(&self.inputs)
    }
}

impl StepAdapter for RecordingAdapter {
    fn name(&self) -> &str {
        "recording"
    }

    async fn execute(&self, invocation: &StepInvocation) -> Result<AdapterOutput, StepExecutionError> {
        self.calls.lock().unwrap().push(invocation.step.clone());
        self.inputs.lock().unwrap().push((
            invocation.step.clone(),
            invocation.inputs.iter().map(|i| i.step.clone()).collect(),
        ));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        write_output(invocation).await?;
        Ok(AdapterOutput::default())
    }
}

/// Fails the listed steps with "boom"; succeeds for the rest.
pub struct FailingAdapter {
    failing: HashSet<StepIdentifier>,
}

impl FailingAdapter {
    pub fn new(failing: impl IntoIterator<Item = StepIdentifier>) -> Self {
        Self {
            failing: failing.into_iter().collect(),
        }
    }
}

impl StepAdapter for FailingAdapter {
    fn name(&self) -> &str {
        "failing"
    }

    async fn execute(&self, invocation: &StepInvocation) -> Result<AdapterOutput, StepExecutionError> {
        if self.failing.contains(&invocation.step) {
            return Err(StepExecutionError::failed("boom"));
        }
        write_output(invocation).await?;
        Ok(AdapterOutput::default())
    }
}

/// Signals when it starts, then waits for cancellation.
#[derive(Default)]
pub struct BlockingAdapter {
    started: Arc<Notify>,
}

impl BlockingAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn started(&self) -> Arc<Notify> {
        Arc::clone(&self.started)
    }
}

impl StepAdapter for BlockingAdapter {
    fn name(&self) -> &str {
        "blocking"
    }

    async fn execute(&self, invocation: &StepInvocation) -> Result<AdapterOutput, StepExecutionError> {
        self.started.notify_one();
        invocation.cancel.cancelled().await;
        Err(StepExecutionError::Cancelled)
    }
}
