use serde::Serialize;
use tracing::info;

/// Local notification raised when a conversation feed grows.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Notification {
    pub conversation_id: String,
    pub message_count: usize,
    pub preview: String,
}

/// Destination for local notifications.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, _notification: &Notification) {}
}

/// Discards notifications; used when no client is listening and in tests.
#[derive(Clone, Default)]
pub struct NullSink;

impl NotificationSink for NullSink {}

/// Writes notifications to the log.
#[derive(Clone, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, notification: &Notification) {
        info!(
            conversation = %notification.conversation_id,
            count = notification.message_count,
            "new message: {}",
            notification.preview
        );
    }
}
