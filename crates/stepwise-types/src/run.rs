//! Per-run node status.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identifier::StepIdentifier;

/// Status of one node within a single run.
///
/// ```text
/// pending -> queued -> (cache-hit | running -> (succeeded | failed))
/// pending -> skipped
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeStatus {
    Pending,
    /// Dispatched to a worker; cache lookup in progress.
    Queued,
    CacheHit,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::CacheHit | NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Skipped
        )
    }

    /// Whether dependents of a node in this status may proceed.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, NodeStatus::CacheHit | NodeStatus::Succeeded)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Queued => "queued",
            NodeStatus::CacheHit => "cache-hit",
            NodeStatus::Running => "running",
            NodeStatus::Succeeded => "succeeded",
            NodeStatus::Failed => "failed",
            NodeStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a node was skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "step", rename_all = "snake_case")]
pub enum SkipReason {
    /// A (possibly indirect) dependency failed.
    UpstreamFailed(StepIdentifier),
    /// The run was cancelled before the node started.
    Cancelled,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::UpstreamFailed(step) => write!(f, "upstream step {step} failed"),
            SkipReason::Cancelled => f.write_str("run cancelled"),
        }
    }
}
