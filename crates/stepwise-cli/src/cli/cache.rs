//! `stepwise cache verify`.

use std::process::ExitCode;

use console::style;
use stepwise_core::store::ArtifactStore;
use stepwise_types::error::StoreError;

use super::output::{check_mark, format_bytes, print_json};
use crate::state::AppState;

pub async fn verify(state: &AppState, raw: &str, json: bool) -> anyhow::Result<ExitCode> {
    let step = state.step(raw)?;
    let fingerprint = state.fingerprint_of(&step).await?;

    match state.store.fetch(&step, &fingerprint).await {
        Ok(artifact) => {
            if json {
                print_json(&serde_json::json!({ "status": "valid", "artifact": artifact }))?;
            } else {
                println!(
                    "  {} {step} is cached and valid ({} files, {})",
                    check_mark(true),
                    artifact.file_count(),
                    format_bytes(artifact.size_bytes)
                );
                println!("    {}", style(artifact.location.display()).dim());
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(StoreError::NotFound { .. }) => {
            if json {
                print_json(&serde_json::json!({
                    "status": "not-cached",
                    "step": step,
                    "fingerprint": fingerprint,
                }))?;
            } else {
                println!(
                    "  {} {step} has no artifact for fingerprint {}",
                    style("-").yellow(),
                    fingerprint.short()
                );
            }
            Ok(ExitCode::from(1))
        }
        Err(StoreError::Corruption { detail, .. }) => {
            if json {
                print_json(&serde_json::json!({
                    "status": "corrupted",
                    "step": step,
                    "fingerprint": fingerprint,
                    "detail": detail,
                }))?;
            } else {
                println!("  {} {step} is corrupted: {detail}", check_mark(false));
            }
            Ok(ExitCode::from(1))
        }
        Err(e) => Err(e.into()),
    }
}
