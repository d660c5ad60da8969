//! Application state wiring the engine together.
//!
//! `AppState` pins the core's generic ports to the concrete infra
//! implementations chosen by the project config.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use stepwise_core::adapter::AdapterSet;
use stepwise_core::checksum::{ChecksumEngine, FingerprintTable};
use stepwise_core::event::EventBus;
use stepwise_core::graph::{DependencyGraph, load_graph};
use stepwise_core::scheduler::Scheduler;
use stepwise_infra::adapter::build_adapter_set;
use stepwise_infra::config::{DEFAULT_CONFIG_FILE, load_engine_config};
use stepwise_infra::definition::FsDefinitionSource;
use stepwise_infra::fragment::FsFragmentSource;
use stepwise_infra::mirror::build_mirror;
use stepwise_infra::store::LocalArtifactStore;
use stepwise_types::config::EngineConfig;
use stepwise_types::fingerprint::Fingerprint;
use stepwise_types::identifier::StepIdentifier;

pub struct AppState {
    pub config: EngineConfig,
    pub graph: Arc<DependencyGraph>,
    pub store: Arc<LocalArtifactStore>,
    pub definitions: FsDefinitionSource,
    pub adapters: Arc<AdapterSet>,
}

impl AppState {
    /// Load the config and the graph, and wire store, mirror, and adapters.
    pub async fn init(config_path: Option<&Path>) -> anyhow::Result<Self> {
        let (path, explicit) = match config_path {
            Some(path) => (path.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
        };
        let config = load_engine_config(&path, explicit).await?;
        tracing::debug!(
            dag = %config.dag.display(),
            cache_dir = %config.cache_dir.display(),
            "configuration loaded"
        );

        // Fragment loading is synchronous file I/O.
        let root = config.dag.display().to_string();
        let graph = tokio::task::spawn_blocking(move || load_graph(&FsFragmentSource::new(), &root))
            .await
            .context("graph loader panicked")??;

        let mut store = LocalArtifactStore::new(&config.cache_dir);
        if let Some(mirror) = &config.mirror {
            store = store.with_mirror(build_mirror(mirror), mirror.push);
        }

        Ok(Self {
            definitions: FsDefinitionSource::new(&config.steps_dir, &config.snapshots_dir),
            adapters: Arc::new(build_adapter_set(&config)),
            store: Arc::new(store),
            graph: Arc::new(graph),
            config,
        })
    }

    pub fn workers(&self) -> usize {
        self.config.resolve_workers()
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.config.step_timeout_secs.map(Duration::from_secs)
    }

    /// Parse `raw` and make sure the graph knows it.
    pub fn step(&self, raw: &str) -> anyhow::Result<StepIdentifier> {
        let step = StepIdentifier::parse(raw)?;
        if !self.graph.contains(&step) {
            anyhow::bail!("step {step} is not in the graph");
        }
        Ok(step)
    }

    /// Fingerprints of `subset` and everything upstream of it.
    pub async fn fingerprints(
        &self,
        subset: &BTreeSet<StepIdentifier>,
    ) -> anyhow::Result<FingerprintTable> {
        let table = ChecksumEngine::new(self.workers())
            .compute(&self.graph, &self.definitions, subset)
            .await?;
        Ok(table)
    }

    pub async fn fingerprint_of(&self, step: &StepIdentifier) -> anyhow::Result<Fingerprint> {
        let table = self.fingerprints(&BTreeSet::from([step.clone()])).await?;
        table
            .get(step)
            .with_context(|| format!("no fingerprint computed for {step}"))
    }

    pub fn scheduler(&self, events: EventBus) -> Scheduler<LocalArtifactStore> {
        Scheduler::new(Arc::clone(&self.store), Arc::clone(&self.adapters), events)
    }
}
