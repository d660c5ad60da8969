//! Mirror over plain HTTP.
//!
//! Entries live under `{base}/{scheme}/{relative_path}/{fingerprint}/` with the
//! same `artifact.json` + `payload/` layout as on disk. Reads are `HEAD`/`GET`,
//! uploads are `PUT` (payload files first, manifest last, so a reader never
//! sees a manifest whose files are missing).

use std::path::{Component, Path};

use futures_util::StreamExt;
use reqwest::StatusCode;
use stepwise_core::store::RemoteMirror;
use stepwise_types::artifact::{Artifact, MANIFEST_FILE, PAYLOAD_DIR};
use stepwise_types::error::StoreError;
use stepwise_types::fingerprint::Fingerprint;
use stepwise_types::identifier::StepIdentifier;
use tokio::io::AsyncWriteExt;

use crate::store::manifest::entry_key;

#[derive(Debug, Clone)]
pub struct HttpMirror {
    client: reqwest::Client,
    base_url: String,
}

impl HttpMirror {
    pub fn new(base_url: &str) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, step: &StepIdentifier, fingerprint: &Fingerprint, file: &str) -> String {
        format!("{}/{}/{file}", self.base_url, entry_key(step, fingerprint))
    }

    fn payload_url(&self, step: &StepIdentifier, fingerprint: &Fingerprint, path: &str) -> String {
        self.url(step, fingerprint, &format!("{PAYLOAD_DIR}/{path}"))
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, StoreError> {
        request
            .send()
            .await
            .map_err(|e| StoreError::Mirror(format!("HTTP request failed: {e}")))
    }

    async fn put(&self, url: &str, body: Vec<u8>) -> Result<(), StoreError> {
        let response = self.send(self.client.put(url).body(body)).await?;
        check(response).await.map(|_| ())
    }
}

/// Turn a non-success response into a mirror error.
async fn check(response: reqwest::Response) -> Result<reqwest::Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let url = response.url().to_string();
    let body = response.text().await.unwrap_or_default();
    Err(StoreError::Mirror(format!("HTTP {status} for {url}: {body}")))
}

/// Reject a pulled manifest that describes another key or names files
/// outside the payload directory.
fn check_manifest(
    step: &StepIdentifier,
    fingerprint: &Fingerprint,
    artifact: &Artifact,
) -> Result<(), StoreError> {
    if artifact.step != *step || artifact.fingerprint != *fingerprint {
        return Err(StoreError::Mirror(format!(
            "manifest describes {} at {}, expected {step} at {}",
            artifact.step,
            artifact.fingerprint.short(),
            fingerprint.short()
        )));
    }
    for file in &artifact.files {
        let path = Path::new(&file.path);
        let relative = path.components().next().is_some()
            && path.components().all(|c| matches!(c, Component::Normal(_)));
        if !relative {
            return Err(StoreError::Mirror(format!(
                "manifest for {step} names an unsafe payload path {:?}",
                file.path
            )));
        }
    }
    Ok(())
}

fn local_io(path: &Path, e: std::io::Error) -> StoreError {
    StoreError::io(path, e)
}

impl RemoteMirror for HttpMirror {
    fn describe(&self) -> String {
        self.base_url.clone()
    }

    async fn contains(
        &self,
        step: &StepIdentifier,
        fingerprint: &Fingerprint,
    ) -> Result<bool, StoreError> {
        let url = self.url(step, fingerprint, MANIFEST_FILE);
        let response = self.send(self.client.head(&url)).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        check(response).await.map(|_| true)
    }

    async fn pull(
        &self,
        step: &StepIdentifier,
        fingerprint: &Fingerprint,
        dest: &Path,
    ) -> Result<bool, StoreError> {
        let response = self
            .send(self.client.get(self.url(step, fingerprint, MANIFEST_FILE)))
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let manifest = check(response)
            .await?
            .bytes()
            .await
            .map_err(|e| StoreError::Mirror(format!("manifest read failed: {e}")))?;
        let artifact: Artifact = serde_json::from_slice(&manifest)
            .map_err(|e| StoreError::Mirror(format!("unreadable manifest: {e}")))?;
        check_manifest(step, fingerprint, &artifact)?;

        let payload = dest.join(PAYLOAD_DIR);
        tokio::fs::create_dir_all(&payload)
            .await
            .map_err(|e| local_io(&payload, e))?;

        for file in &artifact.files {
            let target = payload.join(&file.path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| local_io(parent, e))?;
            }
            let response = self
                .send(self.client.get(self.payload_url(step, fingerprint, &file.path)))
                .await?;
            let mut body = check(response).await?.bytes_stream();
            let mut out = tokio::fs::File::create(&target)
                .await
                .map_err(|e| local_io(&target, e))?;
            while let Some(chunk) = body.next().await {
                let chunk =
                    chunk.map_err(|e| StoreError::Mirror(format!("body read failed: {e}")))?;
                out.write_all(&chunk)
                    .await
                    .map_err(|e| local_io(&target, e))?;
            }
            out.flush().await.map_err(|e| local_io(&target, e))?;
        }

        // Written last, keeping the original bytes so validation sees what
        // the mirror holds.
        let manifest_path = dest.join(MANIFEST_FILE);
        tokio::fs::write(&manifest_path, &manifest)
            .await
            .map_err(|e| local_io(&manifest_path, e))?;
        Ok(true)
    }

    async fn push(&self, artifact: &Artifact) -> Result<(), StoreError> {
        for file in &artifact.files {
            let path = artifact.location.join(&file.path);
            let body = tokio::fs::read(&path).await.map_err(|e| local_io(&path, e))?;
            self.put(
                &self.payload_url(&artifact.step, &artifact.fingerprint, &file.path),
                body,
            )
            .await?;
        }
        let manifest = serde_json::to_vec_pretty(artifact)
            .map_err(|e| StoreError::Mirror(format!("manifest encode failed: {e}")))?;
        self.put(
            &self.url(&artifact.step, &artifact.fingerprint, MANIFEST_FILE),
            manifest,
        )
        .await
    }
}
