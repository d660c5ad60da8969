//! Run progress events published by the scheduler.

use serde::{Deserialize, Serialize};

use crate::fingerprint::Fingerprint;
use crate::identifier::StepIdentifier;
use crate::run::SkipReason;

/// Progress of a build run, one event per node state change.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        nodes: usize,
        workers: usize,
    },
    NodeCacheHit {
        step: StepIdentifier,
        fingerprint: Fingerprint,
    },
    NodeStarted {
        step: StepIdentifier,
        fingerprint: Fingerprint,
    },
    NodeSucceeded {
        step: StepIdentifier,
        fingerprint: Fingerprint,
        duration_ms: u64,
    },
    NodeFailed {
        step: StepIdentifier,
        error: String,
    },
    NodeSkipped {
        step: StepIdentifier,
        reason: SkipReason,
    },
    RunFinished {
        cache_hits: usize,
        succeeded: usize,
        failed: usize,
        skipped: usize,
        duration_ms: u64,
    },
}

impl RunEvent {
    /// The step this event concerns, if it is a per-node event.
    pub fn step(&self) -> Option<&StepIdentifier> {
        match self {
            RunEvent::NodeCacheHit { step, .. }
            | RunEvent::NodeStarted { step, .. }
            | RunEvent::NodeSucceeded { step, .. }
            | RunEvent::NodeFailed { step, .. }
            | RunEvent::NodeSkipped { step, .. } => Some(step),
            RunEvent::RunStarted { .. } | RunEvent::RunFinished { .. } => None,
        }
    }
}
