//! Broadcast bus for run progress events.
//!
//! Built on `tokio::sync::broadcast`: the scheduler publishes one `RunEvent`
//! per node state change and any number of subscribers (progress bars, JSON
//! loggers, tests) receive them. Publishing with no subscriber is a no-op.

use stepwise_types::event::RunEvent;
use tokio::sync::broadcast;

/// Default channel capacity. Slow subscribers lag rather than block the run.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Multi-consumer bus for `RunEvent`s. Cloning shares the sender.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: RunEvent) {
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}
