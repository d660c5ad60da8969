//! Entry layout, manifest I/O, and payload validation.
//!
//! Shared by the local store and the directory mirror, which use the same
//! layout:
//!
//! ```text
//! <root>/<scheme>/<relative_path>/<fingerprint-hex>/
//!   artifact.json
//!   payload/...
//! ```

use std::path::{Path, PathBuf};

use chrono::Utc;
use stepwise_types::artifact::{Artifact, MANIFEST_FILE, PAYLOAD_DIR};
use stepwise_types::error::StoreError;
use stepwise_types::fingerprint::Fingerprint;
use stepwise_types::identifier::StepIdentifier;

use crate::crypto::hash::{content_checksum, hash_file, hash_tree, list_files};

/// Directory of the entry for `(step, fingerprint)` below `root`.
pub fn entry_path(root: &Path, step: &StepIdentifier, fingerprint: &Fingerprint) -> PathBuf {
    root.join(step.category().scheme())
        .join(step.relative_path())
        .join(fingerprint.to_hex())
}

/// `/`-separated form of `entry_path` relative to the store root, for URLs.
pub fn entry_key(step: &StepIdentifier, fingerprint: &Fingerprint) -> String {
    let mut parts = vec![step.category().scheme().to_string()];
    parts.extend(
        step.relative_path()
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned()),
    );
    parts.push(fingerprint.to_hex());
    parts.join("/")
}

/// Whether `entry` has a manifest. No hashing.
pub async fn has_manifest(entry: &Path) -> bool {
    tokio::fs::metadata(entry.join(MANIFEST_FILE))
        .await
        .is_ok_and(|m| m.is_file())
}

/// Hash the payload below `entry` and describe it.
pub async fn build_manifest(
    step: &StepIdentifier,
    fingerprint: &Fingerprint,
    entry: &Path,
) -> Result<Artifact, StoreError> {
    let payload = entry.join(PAYLOAD_DIR);
    let files = hash_tree(&payload)
        .await
        .map_err(|e| StoreError::io(&payload, e))?;
    Ok(Artifact {
        step: step.clone(),
        fingerprint: *fingerprint,
        size_bytes: files.iter().map(|f| f.size).sum(),
        content_checksum: content_checksum(&files),
        files,
        created_at: Utc::now(),
        location: payload,
    })
}

/// Write `artifact.json` into `entry` via a temp file and rename.
pub async fn write_manifest(entry: &Path, artifact: &Artifact) -> Result<(), StoreError> {
    let path = entry.join(MANIFEST_FILE);
    let tmp = entry.join(format!("{MANIFEST_FILE}.tmp"));
    let json = serde_json::to_vec_pretty(artifact).map_err(|e| StoreError::Manifest {
        path: path.clone(),
        detail: e.to_string(),
    })?;
    tokio::fs::write(&tmp, json)
        .await
        .map_err(|e| StoreError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, &path)
        .await
        .map_err(|e| StoreError::io(&path, e))
}

/// Load the manifest of `entry` and check the payload against it.
///
/// A missing manifest is `NotFound`; anything that does not match
/// (unreadable manifest, wrong key, missing, extra, or altered files) is
/// `Corruption`.
pub async fn validate_entry(
    entry: &Path,
    step: &StepIdentifier,
    fingerprint: &Fingerprint,
) -> Result<Artifact, StoreError> {
    let corrupt = |detail: String| StoreError::Corruption {
        step: step.clone(),
        fingerprint: *fingerprint,
        detail,
    };

    let manifest_path = entry.join(MANIFEST_FILE);
    let raw = match tokio::fs::read(&manifest_path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::NotFound {
                step: step.clone(),
                fingerprint: *fingerprint,
            });
        }
        Err(e) => return Err(StoreError::io(&manifest_path, e)),
    };
    let mut artifact: Artifact = serde_json::from_slice(&raw)
        .map_err(|e| corrupt(format!("unreadable manifest: {e}")))?;

    if artifact.step != *step {
        return Err(corrupt(format!("manifest names step {}", artifact.step)));
    }
    if artifact.fingerprint != *fingerprint {
        return Err(corrupt(format!(
            "manifest fingerprint is {}",
            artifact.fingerprint.short()
        )));
    }

    let payload = entry.join(PAYLOAD_DIR);
    let present = match list_files(&payload).await {
        Ok(files) => files,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(StoreError::io(&payload, e)),
    };
    let mut expected: Vec<&str> = artifact.files.iter().map(|f| f.path.as_str()).collect();
    expected.sort_unstable();
    if let Some(extra) = present.iter().find(|p| expected.binary_search(&p.as_str()).is_err()) {
        return Err(corrupt(format!("unexpected file {extra}")));
    }

    for file in &artifact.files {
        let path = payload.join(&file.path);
        let digest = match hash_file(&path).await {
            Ok(digest) => digest,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(corrupt(format!("missing file {}", file.path)));
            }
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        if digest.size != file.size {
            return Err(corrupt(format!(
                "size mismatch for {}: recorded {}, found {}",
                file.path, file.size, digest.size
            )));
        }
        if digest.sha256 != file.sha256 {
            return Err(corrupt(format!("checksum mismatch for {}", file.path)));
        }
    }

    if content_checksum(&artifact.files) != artifact.content_checksum {
        return Err(corrupt("content checksum mismatch".to_string()));
    }

    artifact.location = payload;
    Ok(artifact)
}

/// Copy a directory tree. `dest` is created.
pub async fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dest).await?;
    for relative in list_files(src).await? {
        let target = dest.join(&relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(src.join(&relative), &target).await?;
    }
    Ok(())
}
