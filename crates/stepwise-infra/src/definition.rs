//! Step definitions read from the project tree.
//!
//! Transformation steps are defined by code below `steps_dir`:
//!
//! ```text
//! <steps_dir>/<channel>/<grouping>/<version>/<name>.py      # single file
//! <steps_dir>/<channel>/<grouping>/<version>/<name>.meta.yml
//! <steps_dir>/<channel>/<grouping>/<version>/<name>/...     # package
//! ```
//!
//! Raw snapshots are defined by their `.dvc` sidecar (the recorded content
//! checksum) or, without one, by the snapshot file's own hash.

use std::io;
use std::path::{Path, PathBuf};

use stepwise_core::checksum::{ChecksumError, DefinitionSource};
use stepwise_core::graph::DagNode;
use stepwise_types::identifier::{Category, StepIdentifier};

use crate::crypto::hash::{hash_file, list_files};

/// Extension of the snapshot sidecar carrying the recorded content checksum.
pub const SIDECAR_EXTENSION: &str = "dvc";

#[derive(Debug, Clone)]
pub struct FsDefinitionSource {
    steps_dir: PathBuf,
    snapshots_dir: PathBuf,
}

impl FsDefinitionSource {
    pub fn new(steps_dir: impl Into<PathBuf>, snapshots_dir: impl Into<PathBuf>) -> Self {
        Self {
            steps_dir: steps_dir.into(),
            snapshots_dir: snapshots_dir.into(),
        }
    }

    async fn snapshot_definition(&self, step: &StepIdentifier) -> io::Result<Option<Vec<u8>>> {
        let file = self.snapshots_dir.join(step.relative_path());
        match tokio::fs::read(sidecar_path(&file)).await {
            Ok(bytes) => return Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        match hash_file(&file).await {
            Ok(digest) => Ok(Some(digest.sha256.into_bytes())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn code_definition(&self, step: &StepIdentifier) -> io::Result<Option<Vec<u8>>> {
        let package = self.steps_dir.join(step.relative_path());
        let mut files = self.module_files(&package, step.name()).await?;

        if tokio::fs::metadata(&package).await.is_ok_and(|m| m.is_dir()) {
            for relative in list_files(&package).await? {
                files.push(package.join(relative));
            }
        }
        if files.is_empty() {
            return Ok(None);
        }

        let mut lines = Vec::with_capacity(files.len());
        for path in files {
            let digest = hash_file(&path).await?;
            lines.push(format!("{}\0{}\n", self.display_relative(&path), digest.sha256));
        }
        lines.sort();
        Ok(Some(lines.concat().into_bytes()))
    }

    /// `<name>.*` files next to the package directory.
    async fn module_files(&self, package: &Path, name: &str) -> io::Result<Vec<PathBuf>> {
        let Some(parent) = package.parent() else {
            return Ok(Vec::new());
        };
        let mut entries = match tokio::fs::read_dir(parent).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let prefix = format!("{name}.");
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            if !file_name.to_string_lossy().starts_with(&prefix) {
                continue;
            }
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }
        Ok(files)
    }

    fn display_relative(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.steps_dir).unwrap_or(path);
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// `<file>.dvc` next to a snapshot file.
pub fn sidecar_path(snapshot: &Path) -> PathBuf {
    let mut name = snapshot.as_os_str().to_os_string();
    name.push(".");
    name.push(SIDECAR_EXTENSION);
    PathBuf::from(name)
}

impl DefinitionSource for FsDefinitionSource {
    async fn definition(&self, node: &DagNode) -> Result<Option<Vec<u8>>, ChecksumError> {
        let result = match node.id.category() {
            Category::RawSnapshot => self.snapshot_definition(&node.id).await,
            _ => self.code_definition(&node.id).await,
        };
        result.map_err(|e| ChecksumError::Read {
            step: node.id.clone(),
            detail: e.to_string(),
        })
    }
}
