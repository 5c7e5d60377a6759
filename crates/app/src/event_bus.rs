//! In-process event bus backed by a tokio broadcast channel.

use std::future::Future;

use tokio::sync::broadcast;

use rascal_domain::error::RascalError;
use rascal_domain::event::RascEvent;

use crate::ports::EventPublisher;

/// In-process bus carrying the scheduler's outward [`RascEvent`]s.
///
/// Publishing succeeds even when there are no active subscribers
/// (the event is simply dropped).
pub struct InProcessEventBus {
    sender: broadcast::Sender<RascEvent>,
}

impl InProcessEventBus {
    /// Create a new event bus with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to events published *after* this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RascEvent> {
        self.sender.subscribe()
    }
}

impl EventPublisher for InProcessEventBus {
    fn publish(&self, event: RascEvent) -> impl Future<Output = Result<(), RascalError>> + Send {
        // fails only without receivers
        let _ = self.sender.send(event);
        async { Ok(()) }
    }
}
