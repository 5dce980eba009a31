use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of road-clearing occurrence a notification describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Start,
    End,
}

impl std::fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationKind::Start => write!(f, "start"),
            NotificationKind::End => write!(f, "end"),
        }
    }
}

/// Delivery channel for a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryChannel {
    #[serde(rename = "push")]
    Push,
    #[serde(rename = "in-app")]
    InApp,
}

impl std::fmt::Display for DeliveryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryChannel::Push => write!(f, "push"),
            DeliveryChannel::InApp => write!(f, "in-app"),
        }
    }
}

/// Relative urgency used when ordering and evicting queued notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    /// Higher rank sorts first.
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 2,
            Priority::Normal => 1,
            Priority::Low => 0,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// A domain notification event produced from a change record.
///
/// `id` is unique per instance; `(source_record_id, kind)` identifies the
/// logical occurrence and is what deduplication keys on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationEvent {
    pub id: Uuid,
    pub area: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub timestamp: DateTime<Utc>,
    pub source_record_id: String,
    pub message: String,
}

impl NotificationEvent {
    pub fn new(
        area: impl Into<String>,
        kind: NotificationKind,
        source_record_id: impl Into<String>,
        message: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            area: area.into(),
            kind,
            timestamp,
            source_record_id: source_record_id.into(),
            message: message.into(),
        }
    }

    /// Logical identity: two events with the same key describe the same occurrence.
    pub fn logical_key(&self) -> (&str, NotificationKind) {
        (self.source_record_id.as_str(), self.kind)
    }

    /// Grouping key used by the throttle controller.
    pub fn group_key(&self) -> GroupKey {
        GroupKey {
            area: self.area.clone(),
            kind: self.kind,
        }
    }
}

/// `(area, type)` grouping key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub area: String,
    pub kind: NotificationKind,
}

impl std::fmt::Display for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.area, self.kind)
    }
}

/// A resident's notification preferences.
///
/// Serialized with the persisted schema:
/// `{subscriptions, enablePush, enableInApp, lastUpdated}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriberPreferences {
    #[serde(rename = "subscriptions")]
    pub subscribed_areas: BTreeSet<String>,
    #[serde(rename = "enablePush")]
    pub push_enabled: bool,
    #[serde(rename = "enableInApp")]
    pub in_app_enabled: bool,
    #[serde(rename = "lastUpdated")]
    pub last_updated: DateTime<Utc>,
}

impl SubscriberPreferences {
    pub fn new<I, S>(areas: I, push_enabled: bool, in_app_enabled: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            subscribed_areas: areas.into_iter().map(Into::into).collect(),
            push_enabled,
            in_app_enabled,
            last_updated: Utc::now(),
        }
    }

    pub fn follows(&self, area: &str) -> bool {
        self.subscribed_areas.contains(area)
    }

    pub fn any_channel_enabled(&self) -> bool {
        self.push_enabled || self.in_app_enabled
    }
}

/// Outcome of one delivery attempt on one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryResult {
    pub success: bool,
    pub notification_id: Uuid,
    pub channel: DeliveryChannel,
    pub error: Option<String>,
    pub delivered_at: DateTime<Utc>,
}

impl DeliveryResult {
    pub fn delivered(notification_id: Uuid, channel: DeliveryChannel) -> Self {
        Self {
            success: true,
            notification_id,
            channel,
            error: None,
            delivered_at: Utc::now(),
        }
    }

    pub fn failed(notification_id: Uuid, channel: DeliveryChannel, error: impl Into<String>) -> Self {
        Self {
            success: false,
            notification_id,
            channel,
            error: Some(error.into()),
            delivered_at: Utc::now(),
        }
    }
}

/// Action button attached to a push notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushAction {
    pub action: String,
    pub title: String,
}

/// Payload handed to the push delivery mechanism.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushPayload {
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub badge: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<PushAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// A delivered notification as recorded in the history store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryItem {
    pub id: Uuid,
    pub area: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub message: String,
    pub read: bool,
    pub timestamp: DateTime<Utc>,
}

/// Input for a new history record.
#[derive(Debug, Clone, PartialEq)]
pub struct NewHistoryItem {
    pub area: String,
    pub kind: NotificationKind,
    pub message: String,
    pub read: bool,
}

/// Kind of row change reported by the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeType::Insert => write!(f, "INSERT"),
            ChangeType::Update => write!(f, "UPDATE"),
            ChangeType::Delete => write!(f, "DELETE"),
        }
    }
}

/// A raw change record as published by the change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    #[serde(rename = "eventType")]
    pub event_type: ChangeType,
    #[serde(default)]
    pub new: Option<serde_json::Value>,
    #[serde(default)]
    pub old: Option<serde_json::Value>,
    pub table: String,
    pub schema: String,
}

/// Connection status reported by the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionStatus::Subscribed => write!(f, "SUBSCRIBED"),
            ConnectionStatus::ChannelError => write!(f, "CHANNEL_ERROR"),
            ConnectionStatus::TimedOut => write!(f, "TIMED_OUT"),
            ConnectionStatus::Closed => write!(f, "CLOSED"),
        }
    }
}
