//! Local content-addressed artifact store.
//!
//! - `manifest` -- entry layout, manifest I/O, payload validation
//!
//! Layout:
//!
//! ```text
//! <cache_dir>/
//!   <scheme>/<relative_path>/<fingerprint-hex>/
//!     artifact.json
//!     payload/...
//!   .staging/<uuid>/
//!     payload/...        # adapter destination
//! ```
//!
//! An entry becomes visible in one step: the manifest is written inside the
//! staging directory and the whole directory is renamed into place. A
//! directory rename onto an existing non-empty entry fails, so a second
//! process publishing the same key loses the race and reads the winner's
//! copy instead.

pub mod manifest;

use std::path::{Path, PathBuf};

use stepwise_core::store::{ArtifactStore, BoxRemoteMirror, BuildLock, KeyLocks};
use stepwise_types::artifact::{Artifact, PAYLOAD_DIR};
use stepwise_types::error::StoreError;
use stepwise_types::fingerprint::Fingerprint;
use stepwise_types::identifier::StepIdentifier;
use uuid::Uuid;

use manifest::{build_manifest, entry_path, has_manifest, validate_entry, write_manifest};

const STAGING_DIR: &str = ".staging";

#[derive(Debug)]
pub struct LocalArtifactStore {
    root: PathBuf,
    mirror: Option<BoxRemoteMirror>,
    push: bool,
    locks: KeyLocks,
}

impl LocalArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mirror: None,
            push: false,
            locks: KeyLocks::new(),
        }
    }

    /// Consult `mirror` on local misses; upload published artifacts when `push`.
    pub fn with_mirror(mut self, mirror: BoxRemoteMirror, push: bool) -> Self {
        self.mirror = Some(mirror);
        self.push = push;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mirror(&self) -> Option<&BoxRemoteMirror> {
        self.mirror.as_ref()
    }

    pub fn entry_dir(&self, step: &StepIdentifier, fingerprint: &Fingerprint) -> PathBuf {
        entry_path(&self.root, step, fingerprint)
    }

    fn staging_root(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    async fn new_staging_entry(&self) -> Result<PathBuf, StoreError> {
        let dir = self.staging_root().join(Uuid::now_v7().to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;
        Ok(dir)
    }

    /// Rename a complete staged entry into place.
    ///
    /// Returns the installed artifact, or the one already installed when
    /// another writer got there first.
    async fn install(
        &self,
        staged: &Path,
        step: &StepIdentifier,
        fingerprint: &Fingerprint,
        mut artifact: Artifact,
    ) -> Result<(Artifact, bool), StoreError> {
        let entry = self.entry_dir(step, fingerprint);
        if let Some(parent) = entry.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }

        // A directory without a manifest is the leftover of an interrupted copy.
        if !has_manifest(&entry).await {
            remove_dir_if_exists(&entry).await?;
        }

        let Err(e) = tokio::fs::rename(staged, &entry).await else {
            artifact.location = entry.join(PAYLOAD_DIR);
            return Ok((artifact, true));
        };
        if !has_manifest(&entry).await {
            return Err(StoreError::io(&entry, e));
        }
        tracing::debug!(
            step = %step,
            fingerprint = %fingerprint.short(),
            error = %e,
            "entry already published, keeping existing copy"
        );
        remove_dir_if_exists(staged).await?;
        Ok((validate_entry(&entry, step, fingerprint).await?, false))
    }

    /// Move a published entry out of the key so a rebuild can take its place.
    async fn retire(&self, entry: &Path) -> Result<PathBuf, StoreError> {
        let retired = self.staging_root().join(format!("{}-retired", Uuid::now_v7()));
        tokio::fs::rename(entry, &retired)
            .await
            .map_err(|e| StoreError::io(entry, e))?;
        Ok(retired)
    }

    /// Fetch-through: download from the mirror into staging, validate, install.
    async fn pull_from_mirror(
        &self,
        mirror: &BoxRemoteMirror,
        step: &StepIdentifier,
        fingerprint: &Fingerprint,
    ) -> Result<Artifact, StoreError> {
        let staged = self.new_staging_entry().await?;
        let pulled = match mirror.pull(step, fingerprint, &staged).await {
            Ok(pulled) => pulled,
            Err(e) => {
                remove_dir_if_exists(&staged).await?;
                return Err(e);
            }
        };
        if !pulled {
            remove_dir_if_exists(&staged).await?;
            return Err(StoreError::NotFound {
                step: step.clone(),
                fingerprint: *fingerprint,
            });
        }

        let artifact = match validate_entry(&staged, step, fingerprint).await {
            Ok(artifact) => artifact,
            Err(e) => {
                remove_dir_if_exists(&staged).await?;
                return Err(e);
            }
        };
        let (artifact, _) = self.install(&staged, step, fingerprint, artifact).await?;
        tracing::info!(
            step = %step,
            fingerprint = %fingerprint.short(),
            mirror = %mirror.describe(),
            "pulled artifact from mirror"
        );
        Ok(artifact)
    }

    async fn push_to_mirror(&self, artifact: &Artifact) {
        let Some(mirror) = self.mirror.as_ref().filter(|_| self.push) else {
            return;
        };
        match mirror.push(artifact).await {
            Ok(()) => tracing::debug!(
                step = %artifact.step,
                fingerprint = %artifact.fingerprint.short(),
                "pushed artifact to mirror"
            ),
            Err(e) => tracing::warn!(
                step = %artifact.step,
                fingerprint = %artifact.fingerprint.short(),
                error = %e,
                "failed to push artifact to mirror"
            ),
        }
    }
}

async fn remove_dir_if_exists(dir: &Path) -> Result<(), StoreError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(dir, e)),
    }
}

impl ArtifactStore for LocalArtifactStore {
    async fn exists(
        &self,
        step: &StepIdentifier,
        fingerprint: &Fingerprint,
    ) -> Result<bool, StoreError> {
        if has_manifest(&self.entry_dir(step, fingerprint)).await {
            return Ok(true);
        }
        let Some(mirror) = &self.mirror else {
            return Ok(false);
        };
        match mirror.contains(step, fingerprint).await {
            Ok(found) => Ok(found),
            Err(e) => {
                tracing::warn!(
                    step = %step,
                    fingerprint = %fingerprint.short(),
                    error = %e,
                    "mirror lookup failed, treating as absent"
                );
                Ok(false)
            }
        }
    }

    async fn fetch(
        &self,
        step: &StepIdentifier,
        fingerprint: &Fingerprint,
    ) -> Result<Artifact, StoreError> {
        match validate_entry(&self.entry_dir(step, fingerprint), step, fingerprint).await {
            Err(e) if e.is_not_found() => match &self.mirror {
                Some(mirror) => self.pull_from_mirror(mirror, step, fingerprint).await,
                None => Err(e),
            },
            other => other,
        }
    }

    async fn staging_dir(
        &self,
        _step: &StepIdentifier,
        _fingerprint: &Fingerprint,
    ) -> Result<PathBuf, StoreError> {
        let payload = self.new_staging_entry().await?.join(PAYLOAD_DIR);
        tokio::fs::create_dir_all(&payload)
            .await
            .map_err(|e| StoreError::io(&payload, e))?;
        Ok(payload)
    }

    async fn publish(
        &self,
        step: &StepIdentifier,
        fingerprint: &Fingerprint,
        staging: &Path,
        replace: bool,
    ) -> Result<Artifact, StoreError> {
        let staged = staging.parent().ok_or_else(|| StoreError::Manifest {
            path: staging.to_path_buf(),
            detail: "staging directory has no parent".to_string(),
        })?;

        let entry = self.entry_dir(step, fingerprint);
        let mut retired = None;
        if replace && has_manifest(&entry).await {
            retired = Some(self.retire(&entry).await?);
        } else if has_manifest(&entry).await {
            match validate_entry(&entry, step, fingerprint).await {
                Ok(existing) => {
                    remove_dir_if_exists(staged).await?;
                    return Ok(existing);
                }
                Err(e) if e.is_corruption() => {
                    tracing::warn!(
                        step = %step,
                        fingerprint = %fingerprint.short(),
                        error = %e,
                        "replacing corrupted entry"
                    );
                    remove_dir_if_exists(&entry).await?;
                }
                Err(e) => return Err(e),
            }
        }

        let artifact = build_manifest(step, fingerprint, staged).await?;
        write_manifest(staged, &artifact).await?;
        let installed = self.install(staged, step, fingerprint, artifact).await;
        if let Some(retired) = retired {
            remove_dir_if_exists(&retired).await?;
        }
        let (artifact, installed) = installed?;
        if installed {
            tracing::debug!(
                step = %step,
                fingerprint = %fingerprint.short(),
                files = artifact.file_count(),
                size_bytes = artifact.size_bytes,
                "published artifact"
            );
            self.push_to_mirror(&artifact).await;
        }
        Ok(artifact)
    }

    async fn discard_staging(&self, staging: &Path) {
        let staging_root = self.staging_root();
        let target = staging
            .parent()
            .filter(|p| p.parent() == Some(staging_root.as_path()))
            .unwrap_or(staging);
        if let Err(e) = remove_dir_if_exists(target).await {
            tracing::warn!(error = %e, "failed to remove staging directory");
        }
    }

    async fn invalidate(
        &self,
        step: &StepIdentifier,
        fingerprint: &Fingerprint,
    ) -> Result<(), StoreError> {
        remove_dir_if_exists(&self.entry_dir(step, fingerprint)).await
    }

    async fn lock(&self, step: &StepIdentifier, fingerprint: &Fingerprint) -> BuildLock {
        // Forget keys whose builds are over.
        self.locks.prune();
        self.locks.acquire(step, fingerprint).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use stepwise_core::adapter::{AdapterOutput, AdapterSet, BoxStepAdapter, StepAdapter, StepInvocation};
    use stepwise_core::checksum::{ChecksumEngine, ChecksumError, DefinitionSource};
    use stepwise_core::event::EventBus;
    use stepwise_core::graph::{DagNode, DependencyGraph, ExecutorKind, Selection};
    use stepwise_core::scheduler::{RunOptions, Scheduler};
    use stepwise_types::error::StepExecutionError;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::mirror::DirectoryMirror;
    use stepwise_types::artifact::MANIFEST_FILE;
    use tempfile::TempDir;

    fn step() -> StepIdentifier {
        StepIdentifier::parse("data://garden/demo/2020-01-01/population").unwrap()
    }

    fn fp(b: u8) -> Fingerprint {
        Fingerprint::from_bytes([b; 32])
    }

    async fn build(store: &LocalArtifactStore, fingerprint: &Fingerprint, content: &str) -> Artifact {
        let staging = store.staging_dir(&step(), fingerprint).await.unwrap();
        tokio::fs::write(staging.join("population.csv"), content)
            .await
            .unwrap();
        store.publish(&step(), fingerprint, &staging, false).await.unwrap()
    }

    #[tokio::test]
    async fn publish_then_fetch() {
        let tmp = TempDir::new().unwrap();
        let store = LocalArtifactStore::new(tmp.path());
        assert!(!store.exists(&step(), &fp(1)).await.unwrap());

        let published = build(&store, &fp(1), "country,value\nfr,1\n").await;
        assert!(store.exists(&step(), &fp(1)).await.unwrap());
        assert_eq!(published.location, store.entry_dir(&step(), &fp(1)).join(PAYLOAD_DIR));

        let fetched = store.fetch(&step(), &fp(1)).await.unwrap();
        assert_eq!(fetched.content_checksum, published.content_checksum);
        assert_eq!(
            tokio::fs::read_to_string(fetched.location.join("population.csv"))
                .await
                .unwrap(),
            "country,value\nfr,1\n"
        );

        // Nothing left behind in staging.
        let mut staging = tokio::fs::read_dir(tmp.path().join(STAGING_DIR)).await.unwrap();
        assert!(staging.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fetch_missing_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = LocalArtifactStore::new(tmp.path());
        assert!(store.fetch(&step(), &fp(1)).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn fingerprints_are_separate_entries() {
        let tmp = TempDir::new().unwrap();
        let store = LocalArtifactStore::new(tmp.path());
        build(&store, &fp(1), "old").await;
        build(&store, &fp(2), "new").await;
        let old = store.fetch(&step(), &fp(1)).await.unwrap();
        let new = store.fetch(&step(), &fp(2)).await.unwrap();
        assert_ne!(old.content_checksum, new.content_checksum);
    }

    #[tokio::test]
    async fn republishing_keeps_the_first_artifact() {
        let tmp = TempDir::new().unwrap();
        let store = LocalArtifactStore::new(tmp.path());
        let first = build(&store, &fp(1), "first").await;
        let second = build(&store, &fp(1), "second").await;
        assert_eq!(first.content_checksum, second.content_checksum);
        let fetched = store.fetch(&step(), &fp(1)).await.unwrap();
        assert_eq!(
            tokio::fs::read_to_string(fetched.location.join("population.csv"))
                .await
                .unwrap(),
            "first"
        );
    }

    #[tokio::test]
    async fn replacing_publish_installs_the_rebuilt_payload() {
        let tmp = TempDir::new().unwrap();
        let store = LocalArtifactStore::new(tmp.path());
        let first = build(&store, &fp(1), "first").await;

        let staging = store.staging_dir(&step(), &fp(1)).await.unwrap();
        tokio::fs::write(staging.join("population.csv"), "second")
            .await
            .unwrap();
        let second = store.publish(&step(), &fp(1), &staging, true).await.unwrap();
        assert_ne!(first.content_checksum, second.content_checksum);

        let fetched = store.fetch(&step(), &fp(1)).await.unwrap();
        assert_eq!(fetched.content_checksum, second.content_checksum);
        assert_eq!(
            tokio::fs::read_to_string(fetched.location.join("population.csv"))
                .await
                .unwrap(),
            "second"
        );

        // The replaced entry does not linger in staging.
        let mut staged = tokio::fs::read_dir(tmp.path().join(STAGING_DIR)).await.unwrap();
        assert!(staged.next_entry().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn replacing_publish_of_a_new_key_installs_normally() {
        let tmp = TempDir::new().unwrap();
        let store = LocalArtifactStore::new(tmp.path());
        let staging = store.staging_dir(&step(), &fp(3)).await.unwrap();
        tokio::fs::write(staging.join("population.csv"), "only")
            .await
            .unwrap();
        store.publish(&step(), &fp(3), &staging, true).await.unwrap();
        assert!(store.fetch(&step(), &fp(3)).await.is_ok());
    }

    #[tokio::test]
    async fn build_locks_of_finished_keys_are_forgotten() {
        let tmp = TempDir::new().unwrap();
        let store = LocalArtifactStore::new(tmp.path());
        for b in 1..=5 {
            let _lock = store.lock(&step(), &fp(b)).await;
        }
        // Each acquisition prunes the keys released before it.
        assert_eq!(store.locks.len(), 1);

        let held = store.lock(&step(), &fp(6)).await;
        let _other = store.lock(&step(), &fp(7)).await;
        assert_eq!(store.locks.len(), 2);
        drop(held);
    }

    #[tokio::test]
    async fn tampered_payload_is_corruption_and_invalidate_removes_it() {
        let tmp = TempDir::new().unwrap();
        let store = LocalArtifactStore::new(tmp.path());
        let artifact = build(&store, &fp(1), "ok").await;
        tokio::fs::write(artifact.location.join("population.csv"), "tampered")
            .await
            .unwrap();

        let err = store.fetch(&step(), &fp(1)).await.unwrap_err();
        assert!(err.is_corruption());
        // Presence checks do not hash.
        assert!(store.exists(&step(), &fp(1)).await.unwrap());

        store.invalidate(&step(), &fp(1)).await.unwrap();
        assert!(!store.exists(&step(), &fp(1)).await.unwrap());
        assert!(store.fetch(&step(), &fp(1)).await.unwrap_err().is_not_found());
        // Invalidating twice is fine.
        store.invalidate(&step(), &fp(1)).await.unwrap();
    }

    #[tokio::test]
    async fn publish_replaces_corrupted_entry() {
        let tmp = TempDir::new().unwrap();
        let store = LocalArtifactStore::new(tmp.path());
        let artifact = build(&store, &fp(1), "ok").await;
        tokio::fs::remove_file(artifact.location.join("population.csv"))
            .await
            .unwrap();

        build(&store, &fp(1), "rebuilt").await;
        let fetched = store.fetch(&step(), &fp(1)).await.unwrap();
        assert_eq!(
            tokio::fs::read_to_string(fetched.location.join("population.csv"))
                .await
                .unwrap(),
            "rebuilt"
        );
    }

    #[tokio::test]
    async fn partial_entry_without_manifest_is_replaced() {
        let tmp = TempDir::new().unwrap();
        let store = LocalArtifactStore::new(tmp.path());
        let entry = store.entry_dir(&step(), &fp(1));
        tokio::fs::create_dir_all(entry.join(PAYLOAD_DIR)).await.unwrap();
        tokio::fs::write(entry.join(PAYLOAD_DIR).join("half.csv"), "x")
            .await
            .unwrap();
        assert!(!store.exists(&step(), &fp(1)).await.unwrap());

        build(&store, &fp(1), "complete").await;
        let fetched = store.fetch(&step(), &fp(1)).await.unwrap();
        assert_eq!(fetched.file_count(), 1);
        assert!(entry.join(MANIFEST_FILE).exists());
    }

    #[tokio::test]
    async fn discard_staging_removes_the_whole_staged_entry() {
        let tmp = TempDir::new().unwrap();
        let store = LocalArtifactStore::new(tmp.path());
        let staging = store.staging_dir(&step(), &fp(1)).await.unwrap();
        tokio::fs::write(staging.join("partial.csv"), "x").await.unwrap();
        store.discard_staging(&staging).await;
        assert!(!staging.exists());
        assert!(!staging.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn concurrent_publishers_of_one_key_agree() {
        let tmp = TempDir::new().unwrap();
        let store = std::sync::Arc::new(LocalArtifactStore::new(tmp.path()));
        let mut handles = Vec::new();
        for i in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let _lock = store.lock(&step(), &fp(1)).await;
                let staging = store.staging_dir(&step(), &fp(1)).await.unwrap();
                tokio::fs::write(staging.join("population.csv"), format!("writer {i}"))
                    .await
                    .unwrap();
                store.publish(&step(), &fp(1), &staging, false).await.unwrap()
            }));
        }
        let mut checksums = Vec::new();
        for handle in handles {
            checksums.push(handle.await.unwrap().content_checksum);
        }
        checksums.dedup();
        assert_eq!(checksums.len(), 1);
    }

    #[tokio::test]
    async fn local_miss_pulls_through_from_mirror() {
        let mirror_dir = TempDir::new().unwrap();
        let upstream_dir = TempDir::new().unwrap();
        let upstream = LocalArtifactStore::new(upstream_dir.path()).with_mirror(
            BoxRemoteMirror::new(DirectoryMirror::new(mirror_dir.path())),
            true,
        );
        build(&upstream, &fp(1), "shared").await;

        let tmp = TempDir::new().unwrap();
        let store = LocalArtifactStore::new(tmp.path()).with_mirror(
            BoxRemoteMirror::new(DirectoryMirror::new(mirror_dir.path())),
            false,
        );
        assert!(store.exists(&step(), &fp(1)).await.unwrap());
        assert!(!has_manifest(&store.entry_dir(&step(), &fp(1))).await);

        let fetched = store.fetch(&step(), &fp(1)).await.unwrap();
        assert_eq!(fetched.location, store.entry_dir(&step(), &fp(1)).join(PAYLOAD_DIR));
        assert!(has_manifest(&store.entry_dir(&step(), &fp(1))).await);
        assert!(store.fetch(&step(), &fp(2)).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn corrupted_mirror_copy_is_not_installed() {
        let mirror_dir = TempDir::new().unwrap();
        let upstream_dir = TempDir::new().unwrap();
        let upstream = LocalArtifactStore::new(upstream_dir.path()).with_mirror(
            BoxRemoteMirror::new(DirectoryMirror::new(mirror_dir.path())),
            true,
        );
        build(&upstream, &fp(1), "shared").await;
        let mirrored = entry_path(mirror_dir.path(), &step(), &fp(1));
        tokio::fs::write(mirrored.join(PAYLOAD_DIR).join("population.csv"), "bad")
            .await
            .unwrap();

        let tmp = TempDir::new().unwrap();
        let store = LocalArtifactStore::new(tmp.path()).with_mirror(
            BoxRemoteMirror::new(DirectoryMirror::new(mirror_dir.path())),
            false,
        );
        assert!(store.fetch(&step(), &fp(1)).await.unwrap_err().is_corruption());
        assert!(!has_manifest(&store.entry_dir(&step(), &fp(1))).await);
    }

    /// Writes `build {n}` where n counts its invocations.
    #[derive(Default)]
    struct CountingAdapter {
        builds: AtomicUsize,
    }

    impl StepAdapter for CountingAdapter {
        fn name(&self) -> &str {
            "counting"
        }

        async fn execute(&self, invocation: &StepInvocation) -> Result<AdapterOutput, StepExecutionError> {
            let n = self.builds.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::fs::write(invocation.dest.join("out.txt"), format!("build {n}"))
                .await
                .map_err(|e| StepExecutionError::Failed(e.to_string()))?;
            Ok(AdapterOutput::default())
        }
    }

    struct NamedDefinitions;

    impl DefinitionSource for NamedDefinitions {
        async fn definition(&self, node: &DagNode) -> Result<Option<Vec<u8>>, ChecksumError> {
            Ok(Some(node.id.to_string().into_bytes()))
        }
    }

    #[tokio::test]
    async fn forced_run_stores_the_rebuilt_output() {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(LocalArtifactStore::new(tmp.path()));
        let graph = DependencyGraph::new(vec![DagNode::new(step(), BTreeSet::new())]).unwrap();
        let fingerprints = ChecksumEngine::default()
            .compute(&graph, &NamedDefinitions, &BTreeSet::from([step()]))
            .await
            .unwrap();
        let fingerprint = fingerprints.get(&step()).unwrap();
        let selection = Selection::all().resolve(&graph).unwrap();
        let (graph, fingerprints) = (Arc::new(graph), Arc::new(fingerprints));

        let adapters = AdapterSet::new()
            .with(ExecutorKind::Dataset, BoxStepAdapter::new(CountingAdapter::default()));
        let scheduler = Scheduler::new(Arc::clone(&store), Arc::new(adapters), EventBus::default());

        for force in [false, false, true] {
            let options = RunOptions {
                workers: 1,
                force,
                ..RunOptions::default()
            };
            let report = scheduler
                .execute(
                    Arc::clone(&graph),
                    Arc::clone(&fingerprints),
                    &selection,
                    &options,
                    CancellationToken::new(),
                )
                .await
                .unwrap();
            assert!(report.is_success());
        }

        // The second run was a cache hit; the forced third run rebuilt.
        let artifact = store.fetch(&step(), &fingerprint).await.unwrap();
        assert_eq!(
            tokio::fs::read_to_string(artifact.location.join("out.txt"))
                .await
                .unwrap(),
            "build 2"
        );
    }
}
