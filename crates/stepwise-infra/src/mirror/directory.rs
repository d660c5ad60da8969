//! Mirror backed by a directory with the local store's layout, e.g. a
//! network share or a mounted bucket.

use std::path::{Path, PathBuf};

use stepwise_core::store::RemoteMirror;
use stepwise_types::artifact::{Artifact, PAYLOAD_DIR};
use stepwise_types::error::StoreError;
use stepwise_types::fingerprint::Fingerprint;
use stepwise_types::identifier::StepIdentifier;
use uuid::Uuid;

use crate::store::manifest::{copy_tree, entry_path, has_manifest, write_manifest};

const UPLOAD_DIR: &str = ".uploads";

#[derive(Debug, Clone)]
pub struct DirectoryMirror {
    root: PathBuf,
}

impl DirectoryMirror {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

fn mirror_error(path: &Path, e: std::io::Error) -> StoreError {
    StoreError::Mirror(format!("{}: {e}", path.display()))
}

impl RemoteMirror for DirectoryMirror {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    async fn contains(
        &self,
        step: &StepIdentifier,
        fingerprint: &Fingerprint,
    ) -> Result<bool, StoreError> {
        Ok(has_manifest(&entry_path(&self.root, step, fingerprint)).await)
    }

    async fn pull(
        &self,
        step: &StepIdentifier,
        fingerprint: &Fingerprint,
        dest: &Path,
    ) -> Result<bool, StoreError> {
        let entry = entry_path(&self.root, step, fingerprint);
        if !has_manifest(&entry).await {
            return Ok(false);
        }
        copy_tree(&entry, dest)
            .await
            .map_err(|e| mirror_error(&entry, e))?;
        Ok(true)
    }

    async fn push(&self, artifact: &Artifact) -> Result<(), StoreError> {
        let entry = entry_path(&self.root, &artifact.step, &artifact.fingerprint);
        if has_manifest(&entry).await {
            return Ok(());
        }

        // Same publish protocol as the local store: build aside, rename in.
        let upload = self.root.join(UPLOAD_DIR).join(Uuid::now_v7().to_string());
        copy_tree(&artifact.location, &upload.join(PAYLOAD_DIR))
            .await
            .map_err(|e| mirror_error(&upload, e))?;
        write_manifest(&upload, artifact).await?;

        if let Some(parent) = entry.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| mirror_error(parent, e))?;
        }
        if let Err(e) = tokio::fs::rename(&upload, &entry).await {
            let _ = tokio::fs::remove_dir_all(&upload).await;
            if !has_manifest(&entry).await {
                return Err(mirror_error(&entry, e));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::manifest::{build_manifest, validate_entry};
    use tempfile::TempDir;

    fn step() -> StepIdentifier {
        StepIdentifier::parse("export://explorers/demo/2020-01-01/population").unwrap()
    }

    async fn local_artifact(tmp: &TempDir) -> Artifact {
        let entry = tmp.path().join("local");
        tokio::fs::create_dir_all(entry.join(PAYLOAD_DIR)).await.unwrap();
        tokio::fs::write(entry.join(PAYLOAD_DIR).join("data.json"), "[1,2,3]")
            .await
            .unwrap();
        build_manifest(&step(), &Fingerprint::from_bytes([4; 32]), &entry)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn push_then_pull() {
        let tmp = TempDir::new().unwrap();
        let mirror = DirectoryMirror::new(tmp.path().join("mirror"));
        let artifact = local_artifact(&tmp).await;
        let fp = artifact.fingerprint;

        assert!(!mirror.contains(&step(), &fp).await.unwrap());
        mirror.push(&artifact).await.unwrap();
        assert!(mirror.contains(&step(), &fp).await.unwrap());
        // Pushing again is a no-op.
        mirror.push(&artifact).await.unwrap();

        let dest = tmp.path().join("pulled");
        assert!(mirror.pull(&step(), &fp, &dest).await.unwrap());
        let pulled = validate_entry(&dest, &step(), &fp).await.unwrap();
        assert_eq!(pulled.content_checksum, artifact.content_checksum);
    }

    #[tokio::test]
    async fn pull_of_absent_entry_reports_false() {
        let tmp = TempDir::new().unwrap();
        let mirror = DirectoryMirror::new(tmp.path());
        let dest = tmp.path().join("dest");
        let pulled = mirror
            .pull(&step(), &Fingerprint::from_bytes([0; 32]), &dest)
            .await
            .unwrap();
        assert!(!pulled);
        assert!(!dest.exists());
    }
}
