//! Artifacts: the persisted output of a successfully executed step.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;
use crate::identifier::StepIdentifier;

/// Name of the manifest file written next to every stored payload.
pub const MANIFEST_FILE: &str = "artifact.json";

/// Name of the payload directory inside a stored artifact entry.
pub const PAYLOAD_DIR: &str = "payload";

/// One file of an artifact payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactFile {
    /// Path relative to the payload root, `/`-separated.
    pub path: String,
    pub size: u64,
    /// Lowercase hex SHA-256 of the file contents.
    pub sha256: String,
}

/// A stored step output, addressed by (step, fingerprint).
///
/// Artifacts are never mutated. A changed definition produces a new
/// fingerprint and therefore a new artifact next to the old one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub step: StepIdentifier,
    /// The fingerprint the artifact was built from.
    pub fingerprint: Fingerprint,
    /// Payload files, sorted by path.
    pub files: Vec<ArtifactFile>,
    pub size_bytes: u64,
    /// SHA-256 over the sorted `(path, sha256)` list.
    pub content_checksum: String,
    pub created_at: DateTime<Utc>,
    /// Where the payload lives on this machine. Not part of the manifest.
    #[serde(skip)]
    pub location: PathBuf,
}

impl Artifact {
    pub fn file_count(&self) -> usize {
        self.files.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_is_not_serialized() {
        let artifact = Artifact {
            step: StepIdentifier::parse("data://garden/demo/2020-01-01/x").unwrap(),
            fingerprint: Fingerprint::from_bytes([1; 32]),
            files: vec![ArtifactFile {
                path: "x.csv".to_string(),
                size: 3,
                sha256: "ab".repeat(32),
            }],
            size_bytes: 3,
            content_checksum: "cd".repeat(32),
            created_at: Utc::now(),
            location: PathBuf::from("/tmp/somewhere"),
        };
        let json = serde_json::to_string(&artifact).unwrap();
        assert!(!json.contains("/tmp/somewhere"));

        let back: Artifact = serde_json::from_str(&json).unwrap();
        assert_eq!(back.location, PathBuf::new());
        assert_eq!(back.step, artifact.step);
        assert_eq!(back.file_count(), 1);
    }
}
