//! In-app delivery over a broadcast channel.
//!
//! Every live subscriber (an open app session, or the daemon's log sink)
//! receives each notification. Dispatching with nobody listening is a failed
//! delivery.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use snowline_common::error::AppError;
use snowline_common::types::{NotificationEvent, NotificationKind};

use crate::push::notification_title;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InAppNotification {
    pub notification_id: Uuid,
    pub area: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&NotificationEvent> for InAppNotification {
    fn from(event: &NotificationEvent) -> Self {
        Self {
            notification_id: event.id,
            area: event.area.clone(),
            kind: event.kind,
            title: notification_title(event.kind).to_string(),
            message: event.message.clone(),
            timestamp: event.timestamp,
        }
    }
}

pub struct InAppDispatcher {
    tx: broadcast::Sender<InAppNotification>,
    dispatched: AtomicU64,
}

impl InAppDispatcher {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            dispatched: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InAppNotification> {
        self.tx.subscribe()
    }

    pub fn dispatch(&self, event: &NotificationEvent) -> Result<usize, AppError> {
        let receivers = self
            .tx
            .send(InAppNotification::from(event))
            .map_err(|_| AppError::Delivery("no in-app subscribers".to_string()))?;

        self.dispatched.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(event_id = %event.id, receivers, "In-app notification dispatched");
        Ok(receivers)
    }

    pub fn dispatched_count(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for InAppDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_event() -> NotificationEvent {
        NotificationEvent::new("Vallila", NotificationKind::Start, "9", "Snow removal started in Vallila", Utc::now())
    }

    #[tokio::test]
    async fn test_dispatch_reaches_subscribers() {
        let dispatcher = InAppDispatcher::new();
        let mut rx = dispatcher.subscribe();

        let event = make_event();
        assert_eq!(dispatcher.dispatch(&event).unwrap(), 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.notification_id, event.id);
        assert_eq!(received.title, "Snow removal started");
        assert_eq!(dispatcher.dispatched_count(), 1);
    }

    #[test]
    fn test_no_subscribers_is_failure() {
        let dispatcher = InAppDispatcher::new();
        let err = dispatcher.dispatch(&make_event()).unwrap_err();
        assert!(matches!(err, AppError::Delivery(_)));
        assert_eq!(dispatcher.dispatched_count(), 0);
    }
}
