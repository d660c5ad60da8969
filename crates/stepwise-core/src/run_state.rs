//! Per-run node status table.
//!
//! Shared between the dispatcher and worker tasks. Every status change is a
//! compare-and-set under the entry's shard lock, so two tasks can never both
//! move a node out of the same state (no double dispatch, no double finish).

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use stepwise_types::identifier::StepIdentifier;
use stepwise_types::run::NodeStatus;

#[derive(Debug, Default)]
pub struct RunState {
    statuses: DashMap<StepIdentifier, NodeStatus>,
    running: AtomicUsize,
    peak_running: AtomicUsize,
}

impl RunState {
    /// Every node starts `pending`.
    pub fn new(nodes: impl IntoIterator<Item = StepIdentifier>) -> Self {
        Self {
            statuses: nodes.into_iter().map(|id| (id, NodeStatus::Pending)).collect(),
            running: AtomicUsize::new(0),
            peak_running: AtomicUsize::new(0),
        }
    }

    pub fn status(&self, id: &StepIdentifier) -> Option<NodeStatus> {
        self.statuses.get(id).map(|s| *s)
    }

    /// Move `id` from `from` to `to`. Returns `false` (and changes nothing)
    /// if the node is unknown or not currently in `from`.
    pub fn transition(&self, id: &StepIdentifier, from: NodeStatus, to: NodeStatus) -> bool {
        let Some(mut entry) = self.statuses.get_mut(id) else {
            return false;
        };
        if *entry != from {
            return false;
        }
        *entry = to;

        if to == NodeStatus::Running {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_running.fetch_max(now, Ordering::SeqCst);
        } else if from == NodeStatus::Running {
            self.running.fetch_sub(1, Ordering::SeqCst);
        }
        true
    }

    /// Highest number of simultaneously `running` nodes seen in this run.
    pub fn peak_running(&self) -> usize {
        self.peak_running.load(Ordering::SeqCst)
    }

    pub fn all_terminal(&self) -> bool {
        self.statuses.iter().all(|e| e.value().is_terminal())
    }

    /// Nodes currently in `status`, identifier-sorted.
    pub fn in_status(&self, status: NodeStatus) -> Vec<StepIdentifier> {
        let mut ids: Vec<_> = self
            .statuses
            .iter()
            .filter(|e| *e.value() == status)
            .map(|e| e.key().clone())
            .collect();
        ids.sort();
        ids
    }
}
