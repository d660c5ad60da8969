//! Engine configuration types.
//!
//! `EngineConfig` is the deserialized form of `stepwise.toml`. Every field has
//! a default so an empty file (or no file at all) yields a usable config for a
//! project laid out in the conventional way.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::identifier::Category;

/// Top-level configuration of a Stepwise project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Root fragment file.
    #[serde(default = "default_dag")]
    pub dag: PathBuf,

    /// Root of the step definitions (code) used for fingerprints and commands.
    #[serde(default = "default_steps_dir")]
    pub steps_dir: PathBuf,

    /// Root of raw snapshot files and their content-checksum sidecars.
    #[serde(default = "default_snapshots_dir")]
    pub snapshots_dir: PathBuf,

    /// Local artifact store.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Worker pool size (None = available parallelism).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Per-step timeout in seconds (None = no limit).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_timeout_secs: Option<u64>,

    /// Optional remote mirror of the artifact store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mirror: Option<MirrorConfig>,

    /// External commands that execute non-snapshot steps.
    #[serde(default)]
    pub adapters: AdapterCommands,
}

fn default_dag() -> PathBuf {
    PathBuf::from("dag/main.yml")
}

fn default_steps_dir() -> PathBuf {
    PathBuf::from("steps")
}

fn default_snapshots_dir() -> PathBuf {
    PathBuf::from("snapshots")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from(".stepwise/cache")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dag: default_dag(),
            steps_dir: default_steps_dir(),
            snapshots_dir: default_snapshots_dir(),
            cache_dir: default_cache_dir(),
            workers: None,
            step_timeout_secs: None,
            mirror: None,
            adapters: AdapterCommands::default(),
        }
    }
}

impl EngineConfig {
    /// Make every relative path absolute against `base` (the config file's directory).
    pub fn resolve_paths(mut self, base: &Path) -> Self {
        let resolve = |p: PathBuf| if p.is_absolute() { p } else { base.join(p) };
        self.dag = resolve(self.dag);
        self.steps_dir = resolve(self.steps_dir);
        self.snapshots_dir = resolve(self.snapshots_dir);
        self.cache_dir = resolve(self.cache_dir);
        if let Some(mirror) = self.mirror.as_mut() {
            if mirror.kind == MirrorKind::Directory {
                let path = PathBuf::from(&mirror.location);
                if !path.is_absolute() {
                    mirror.location = base.join(path).display().to_string();
                }
            }
        }
        self
    }

    /// Effective worker count: configured value (at least 1) or the machine's
    /// available parallelism.
    pub fn resolve_workers(&self) -> usize {
        self.workers
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
            })
            .max(1)
    }
}

/// Where the remote copy of the artifact store lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MirrorConfig {
    pub kind: MirrorKind,
    /// Directory path or base URL, depending on `kind`.
    pub location: String,
    /// Upload freshly built artifacts to the mirror.
    #[serde(default)]
    pub push: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MirrorKind {
    Directory,
    Http,
}

/// Commands per category. Raw snapshots use the built-in snapshot adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdapterCommands {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<CommandSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grapher: Option<CommandSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<CommandSpec>,
}

impl AdapterCommands {
    pub fn for_category(&self, category: Category) -> Option<&CommandSpec> {
        match category {
            Category::RawSnapshot => None,
            Category::CuratedDataset => self.data.as_ref(),
            Category::PublishedView => self.grapher.as_ref(),
            Category::ExportedArtifact => self.export.as_ref(),
        }
    }
}

/// An external program invocation: argv plus extra environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandSpec {
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.dag, PathBuf::from("dag/main.yml"));
        assert!(config.mirror.is_none());
        assert!(config.adapters.data.is_none());
    }

    #[test]
    fn full_config_parses() {
        let config: EngineConfig = toml::from_str(
            r#"
dag = "dag/all.yml"
steps_dir = "etl/steps"
cache_dir = "/var/cache/stepwise"
workers = 8
step_timeout_secs = 600

[mirror]
kind = "http"
location = "https://cache.example.org/stepwise"
push = true

[adapters.data]
command = ["python", "-m", "pipeline.run"]
env = { PYTHONUNBUFFERED = "1" }

[adapters.grapher]
command = ["python", "-m", "pipeline.publish"]
"#,
        )
        .unwrap();
        assert_eq!(config.workers, Some(8));
        assert_eq!(config.step_timeout_secs, Some(600));
        let mirror = config.mirror.as_ref().unwrap();
        assert_eq!(mirror.kind, MirrorKind::Http);
        assert!(mirror.push);
        let data = config.adapters.for_category(Category::CuratedDataset).unwrap();
        assert_eq!(data.command, vec!["python", "-m", "pipeline.run"]);
        assert_eq!(data.env.get("PYTHONUNBUFFERED").map(String::as_str), Some("1"));
        assert!(config.adapters.for_category(Category::ExportedArtifact).is_none());
        assert!(config.adapters.for_category(Category::RawSnapshot).is_none());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let result = toml::from_str::<EngineConfig>("wrokers = 3");
        assert!(result.is_err());
    }

    #[test]
    fn resolve_paths_keeps_absolute_and_joins_relative() {
        let config: EngineConfig = toml::from_str(
            r#"
cache_dir = "/abs/cache"
[mirror]
kind = "directory"
location = "mirror"
"#,
        )
        .unwrap();
        let resolved = config.resolve_paths(Path::new("/project"));
        assert_eq!(resolved.dag, PathBuf::from("/project/dag/main.yml"));
        assert_eq!(resolved.steps_dir, PathBuf::from("/project/steps"));
        assert_eq!(resolved.cache_dir, PathBuf::from("/abs/cache"));
        assert_eq!(resolved.mirror.unwrap().location, "/project/mirror");
    }

    #[test]
    fn workers_never_zero() {
        let config = EngineConfig {
            workers: Some(0),
            ..EngineConfig::default()
        };
        assert_eq!(config.resolve_workers(), 1);
        assert!(EngineConfig::default().resolve_workers() >= 1);
    }
}
