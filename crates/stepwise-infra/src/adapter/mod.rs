//! Step adapters and the config-driven adapter set.
//!
//! - `snapshot` -- built-in copy-and-verify for raw snapshots
//! - `command` -- external command per category

pub mod command;
pub mod snapshot;

use stepwise_core::adapter::{AdapterSet, BoxStepAdapter};
use stepwise_core::graph::ExecutorKind;
use stepwise_types::config::EngineConfig;
use stepwise_types::identifier::Category;

pub use command::CommandAdapter;
pub use snapshot::SnapshotAdapter;

/// Snapshot adapter plus one command adapter per configured category.
/// Categories without a command stay empty and fail their nodes.
pub fn build_adapter_set(config: &EngineConfig) -> AdapterSet {
    let mut set = AdapterSet::new().with(
        ExecutorKind::Snapshot,
        BoxStepAdapter::new(SnapshotAdapter::new(&config.snapshots_dir)),
    );
    for category in Category::ALL {
        if let Some(spec) = config.adapters.for_category(category) {
            let adapter = CommandAdapter::new(category.scheme(), spec.clone(), &config.steps_dir);
            set = set.with(ExecutorKind::from(category), BoxStepAdapter::new(adapter));
        }
    }
    set
}
