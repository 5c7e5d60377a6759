//! Event bus port — outward publication of progress events.

use std::future::Future;

use rascal_domain::error::RascalError;
use rascal_domain::event::RascEvent;

/// Publishes progress events to interested subscribers.
pub trait EventPublisher {
    /// Publish an event to all current subscribers.
    fn publish(&self, event: RascEvent) -> impl Future<Output = Result<(), RascalError>> + Send;
}

impl<T: EventPublisher + Send + Sync> EventPublisher for std::sync::Arc<T> {
    fn publish(&self, event: RascEvent) -> impl Future<Output = Result<(), RascalError>> + Send {
        (**self).publish(event)
    }
}
