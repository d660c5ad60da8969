//! SHA-256 content hashing for artifact payloads and step definitions.
//!
//! Digests are lowercase hex. Files are streamed in fixed-size chunks so large
//! datasets never have to fit in memory.

use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use stepwise_types::artifact::ArtifactFile;
use tokio::io::AsyncReadExt;

const CHUNK: usize = 64 * 1024;

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Size and digest of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub size: u64,
    pub sha256: String,
}

pub async fn hash_file(path: &Path) -> io::Result<FileDigest> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHUNK];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok(FileDigest {
        size,
        sha256: format!("{:x}", hasher.finalize()),
    })
}

/// Every regular file below `root`, as sorted `/`-separated relative paths.
pub async fn list_files(root: &Path) -> io::Result<Vec<String>> {
    let mut files = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let metadata = tokio::fs::metadata(&path).await?;
            if metadata.is_dir() {
                pending.push(path);
            } else if metadata.is_file() {
                if let Ok(relative) = path.strip_prefix(root) {
                    let parts: Vec<String> = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    files.push(parts.join("/"));
                }
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Hash every file below `root`, sorted by path.
pub async fn hash_tree(root: &Path) -> io::Result<Vec<ArtifactFile>> {
    let mut out = Vec::new();
    for relative in list_files(root).await? {
        let digest = hash_file(&root.join(&relative)).await?;
        out.push(ArtifactFile {
            path: relative,
            size: digest.size,
            sha256: digest.sha256,
        });
    }
    Ok(out)
}

/// Checksum of a whole payload: SHA-256 over `path NUL sha256 LF` per file,
/// in the given (sorted) order.
pub fn content_checksum(files: &[ArtifactFile]) -> String {
    let mut hasher = Sha256::new();
    for file in files {
        hasher.update(file.path.as_bytes());
        hasher.update([0u8]);
        hasher.update(file.sha256.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}
