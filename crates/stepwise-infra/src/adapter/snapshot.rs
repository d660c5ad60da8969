//! Built-in adapter for raw snapshots.
//!
//! A snapshot step has no code: its "build" copies the raw file from the
//! snapshots directory into the artifact, checking it against the recorded
//! content checksum when the sidecar carries one.

use std::path::PathBuf;

use serde::Deserialize;
use stepwise_core::adapter::{AdapterOutput, StepAdapter, StepInvocation};
use stepwise_types::error::StepExecutionError;

use crate::crypto::hash::hash_file;
use crate::definition::sidecar_path;

#[derive(Debug, Clone)]
pub struct SnapshotAdapter {
    snapshots_dir: PathBuf,
}

impl SnapshotAdapter {
    pub fn new(snapshots_dir: impl Into<PathBuf>) -> Self {
        Self {
            snapshots_dir: snapshots_dir.into(),
        }
    }
}

/// The part of a `.dvc` sidecar we understand. Other keys are ignored.
#[derive(Debug, Default, Deserialize)]
struct Sidecar {
    #[serde(default)]
    outs: Vec<SidecarOut>,
}

#[derive(Debug, Deserialize)]
struct SidecarOut {
    path: Option<String>,
    sha256: Option<String>,
    size: Option<u64>,
}

impl Sidecar {
    /// Recorded entry for `file_name`: the one with that path, or the only one.
    fn entry_for(&self, file_name: &str) -> Option<&SidecarOut> {
        self.outs
            .iter()
            .find(|o| o.path.as_deref() == Some(file_name))
            .or(match self.outs.as_slice() {
                [only] => Some(only),
                _ => None,
            })
    }
}

impl StepAdapter for SnapshotAdapter {
    fn name(&self) -> &str {
        "snapshot"
    }

    async fn execute(
        &self,
        invocation: &StepInvocation,
    ) -> Result<AdapterOutput, StepExecutionError> {
        let step = &invocation.step;
        let source = self.snapshots_dir.join(step.relative_path());
        let file_name = step.file_name();
        let target = invocation.dest.join(&file_name);

        if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
            return Err(StepExecutionError::failed(format!(
                "snapshot file not found: {}",
                source.display()
            )));
        }
        tokio::fs::copy(&source, &target).await.map_err(|e| {
            StepExecutionError::failed(format!("cannot copy {}: {e}", source.display()))
        })?;

        let sidecar = match tokio::fs::read_to_string(sidecar_path(&source)).await {
            Ok(raw) => serde_yaml_ng::from_str::<Sidecar>(&raw).unwrap_or_default(),
            Err(_) => Sidecar::default(),
        };
        let Some(recorded) = sidecar.entry_for(&file_name) else {
            return Ok(AdapterOutput::default());
        };

        let digest = hash_file(&target).await.map_err(|e| {
            StepExecutionError::failed(format!("cannot hash {}: {e}", target.display()))
        })?;
        if let Some(size) = recorded.size {
            if size != digest.size {
                return Err(StepExecutionError::failed(format!(
                    "snapshot {file_name} is {} bytes, sidecar records {size}",
                    digest.size
                )));
            }
        }
        if let Some(sha256) = &recorded.sha256 {
            if !sha256.eq_ignore_ascii_case(&digest.sha256) {
                return Err(StepExecutionError::failed(format!(
                    "snapshot {file_name} does not match its recorded sha256"
                )));
            }
        }
        Ok(AdapterOutput {
            detail: Some(format!("verified {file_name}")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hash::sha256_hex;
    use stepwise_types::fingerprint::Fingerprint;
    use stepwise_types::identifier::StepIdentifier;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    const STEP: &str = "snapshot://demo/2020-01-01/population.csv";
    const CONTENT: &str = "country,year,population\nfr,2020,67\n";

    async fn setup(sidecar: Option<String>) -> (TempDir, StepInvocation) {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("snapshots/demo/2020-01-01");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("population.csv"), CONTENT).await.unwrap();
        if let Some(sidecar) = sidecar {
            tokio::fs::write(dir.join("population.csv.dvc"), sidecar)
                .await
                .unwrap();
        }
        let dest = tmp.path().join("dest");
        tokio::fs::create_dir_all(&dest).await.unwrap();
        let invocation = StepInvocation {
            step: StepIdentifier::parse(STEP).unwrap(),
            fingerprint: Fingerprint::from_bytes([1; 32]),
            inputs: Vec::new(),
            dest,
            cancel: CancellationToken::new(),
        };
        (tmp, invocation)
    }

    fn adapter(tmp: &TempDir) -> SnapshotAdapter {
        SnapshotAdapter::new(tmp.path().join("snapshots"))
    }

    #[tokio::test]
    async fn copies_snapshot_without_sidecar() {
        let (tmp, inv) = setup(None).await;
        adapter(&tmp).execute(&inv).await.unwrap();
        let copied = tokio::fs::read_to_string(inv.dest.join("population.csv"))
            .await
            .unwrap();
        assert_eq!(copied, CONTENT);
    }

    #[tokio::test]
    async fn verifies_recorded_checksum() {
        let sidecar = format!(
            "outs:\n- path: population.csv\n  sha256: {}\n  size: {}\n",
            sha256_hex(CONTENT.as_bytes()),
            CONTENT.len()
        );
        let (tmp, inv) = setup(Some(sidecar)).await;
        let out = adapter(&tmp).execute(&inv).await.unwrap();
        assert_eq!(out.detail.as_deref(), Some("verified population.csv"));
    }

    #[tokio::test]
    async fn checksum_mismatch_fails() {
        let sidecar = format!("outs:\n- path: population.csv\n  sha256: {}\n", "0".repeat(64));
        let (tmp, inv) = setup(Some(sidecar)).await;
        let err = adapter(&tmp).execute(&inv).await.unwrap_err();
        assert!(err.to_string().contains("recorded sha256"));
    }

    #[tokio::test]
    async fn size_mismatch_fails() {
        let (tmp, inv) = setup(Some("outs:\n- size: 1\n".to_string())).await;
        let err = adapter(&tmp).execute(&inv).await.unwrap_err();
        assert!(err.to_string().contains("sidecar records 1"));
    }

    #[tokio::test]
    async fn opaque_sidecar_is_not_checked() {
        let (tmp, inv) = setup(Some("md5: 0123456789abcdef\n".to_string())).await;
        let out = adapter(&tmp).execute(&inv).await.unwrap();
        assert!(out.detail.is_none());
    }

    #[tokio::test]
    async fn missing_snapshot_fails() {
        let (tmp, inv) = setup(None).await;
        tokio::fs::remove_file(tmp.path().join("snapshots/demo/2020-01-01/population.csv"))
            .await
            .unwrap();
        let err = adapter(&tmp).execute(&inv).await.unwrap_err();
        assert!(err.to_string().contains("snapshot file not found"));
    }
}
