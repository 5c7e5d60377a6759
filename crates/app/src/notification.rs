//! Notification sink that reports failures through `tracing`.

use std::future::Future;

use rascal_domain::error::RascalError;
use rascal_domain::event::FailureNotification;
use rascal_domain::id::EntityId;

use crate::ports::NotificationSink;

/// Writes every failure report as a structured `warn` record.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotificationSink;

impl NotificationSink for LogNotificationSink {
    fn notify(&self, notification: FailureNotification) -> impl Future<Output = Result<(), RascalError>> + Send {
        let failed: Vec<&str> = notification.failed.iter().map(EntityId::as_str).collect();
        let successful: Vec<&str> = notification.successful.iter().map(EntityId::as_str).collect();
        tracing::warn!(
            action_id = %notification.action_id,
            action = %notification.action,
            failed = ?failed,
            successful = ?successful,
            "action finished with failed devices"
        );
        async { Ok(()) }
    }
}

#[cfg(test)]
mod tests {
    use rascal_domain::id::ActionId;

    use super::*;

    #[tokio::test]
    async fn should_accept_notification_when_logging() {
        let sink = LogNotificationSink;

        let result = sink
            .notify(FailureNotification {
                action: "light.turn_on(light.a)".to_string(),
                action_id: ActionId::new("r.0").unwrap(),
                successful: Vec::new(),
                failed: vec![EntityId::new("light.a").unwrap()],
            })
            .await;

        assert!(result.is_ok());
    }
}
