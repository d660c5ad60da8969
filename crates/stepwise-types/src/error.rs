use std::path::PathBuf;

use thiserror::Error;

use crate::fingerprint::Fingerprint;
use crate::identifier::{Category, StepIdentifier};

/// Errors from artifact store operations (used by the store port in
/// stepwise-core and its implementations in stepwise-infra).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no artifact for {step} at fingerprint {}", fingerprint.short())]
    NotFound {
        step: StepIdentifier,
        fingerprint: Fingerprint,
    },

    #[error("corrupted artifact for {step} at fingerprint {}: {detail}", fingerprint.short())]
    Corruption {
        step: StepIdentifier,
        fingerprint: Fingerprint,
        detail: String,
    },

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid artifact manifest at {}: {detail}", path.display())]
    Manifest { path: PathBuf, detail: String },

    #[error("remote mirror error: {0}")]
    Mirror(String),
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, StoreError::Corruption { .. })
    }
}

/// A step that did not produce its artifact. Recorded per node; never aborts
/// the run.
#[derive(Debug, Error)]
pub enum StepExecutionError {
    /// The adapter reported a failure.
    #[error("{0}")]
    Failed(String),

    #[error("no adapter configured for category '{0}'")]
    NoAdapter(Category),

    #[error("dependency {step} has no usable artifact: {reason}")]
    MissingInput { step: StepIdentifier, reason: String },

    #[error("step timed out after {0}s")]
    Timeout(u64),

    #[error("interrupted by cancellation")]
    Cancelled,

    #[error("could not store output: {0}")]
    Store(#[from] StoreError),
}

impl StepExecutionError {
    pub fn failed(reason: impl Into<String>) -> Self {
        StepExecutionError::Failed(reason.into())
    }
}
