//! Notification port — partial failure reports.

use std::future::Future;

use rascal_domain::error::RascalError;
use rascal_domain::event::FailureNotification;

/// Receives a report each time an action resolves with failed devices.
pub trait NotificationSink {
    fn notify(&self, notification: FailureNotification) -> impl Future<Output = Result<(), RascalError>> + Send;
}

impl<T: NotificationSink + Send + Sync> NotificationSink for std::sync::Arc<T> {
    fn notify(&self, notification: FailureNotification) -> impl Future<Output = Result<(), RascalError>> + Send {
        (**self).notify(notification)
    }
}
