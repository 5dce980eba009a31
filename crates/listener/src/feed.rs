//! Change feed sources.
//!
//! A source turns a table subscription into a stream of [`FeedMessage`]s:
//! change records interleaved with connection status updates. The Redis
//! implementation listens on the pub/sub channel `{prefix}:{schema}:{table}`
//! where the backing store publishes one JSON change record per message.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use snowline_common::error::AppError;
use snowline_common::types::{ChangeRecord, ConnectionStatus};

/// Buffer between the feed task and its consumer.
const FEED_BUFFER: usize = 256;

/// Default time allowed for the subscription to be acknowledged.
pub const DEFAULT_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    Change(ChangeRecord),
    Status {
        status: ConnectionStatus,
        detail: Option<String>,
    },
}

impl FeedMessage {
    pub fn status(status: ConnectionStatus) -> Self {
        Self::Status {
            status,
            detail: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableFilter {
    pub schema: String,
    pub table: String,
}

#[async_trait]
pub trait ChangeFeedSource: Send + Sync {
    /// Start a subscription. Status updates, including the initial
    /// `SUBSCRIBED`, arrive on the returned receiver.
    async fn subscribe(&self, filter: &TableFilter) -> Result<mpsc::Receiver<FeedMessage>, AppError>;

    /// Stop the current subscription, if any.
    async fn unsubscribe(&self);
}

/// Change feed over Redis pub/sub.
pub struct RedisChangeFeed {
    client: redis::Client,
    channel_prefix: String,
    subscribe_timeout: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RedisChangeFeed {
    pub fn new(client: redis::Client, channel_prefix: impl Into<String>) -> Self {
        Self {
            client,
            channel_prefix: channel_prefix.into(),
            subscribe_timeout: DEFAULT_SUBSCRIBE_TIMEOUT,
            task: Mutex::new(None),
        }
    }

    pub fn with_subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.subscribe_timeout = timeout;
        self
    }

    pub fn channel_for(&self, filter: &TableFilter) -> String {
        format!("{}:{}:{}", self.channel_prefix, filter.schema, filter.table)
    }
}

#[async_trait]
impl ChangeFeedSource for RedisChangeFeed {
    async fn subscribe(&self, filter: &TableFilter) -> Result<mpsc::Receiver<FeedMessage>, AppError> {
        let channel = self.channel_for(filter);
        let (tx, rx) = mpsc::channel(FEED_BUFFER);

        let task = tokio::spawn(run_subscription(
            self.client.clone(),
            channel,
            self.subscribe_timeout,
            tx,
        ));
        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }

        Ok(rx)
    }

    async fn unsubscribe(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            tracing::debug!("Change feed subscription stopped");
        }
    }
}

impl Drop for RedisChangeFeed {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

async fn run_subscription(
    client: redis::Client,
    channel: String,
    subscribe_timeout: Duration,
    tx: mpsc::Sender<FeedMessage>,
) {
    let connect = async {
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(&channel).await?;
        Ok::<_, redis::RedisError>(pubsub)
    };

    let mut pubsub = match tokio::time::timeout(subscribe_timeout, connect).await {
        Ok(Ok(pubsub)) => pubsub,
        Ok(Err(e)) => {
            let _ = tx
                .send(FeedMessage::Status {
                    status: ConnectionStatus::ChannelError,
                    detail: Some(e.to_string()),
                })
                .await;
            return;
        }
        Err(_) => {
            let _ = tx
                .send(FeedMessage::Status {
                    status: ConnectionStatus::TimedOut,
                    detail: Some(format!(
                        "subscription not acknowledged within {}ms",
                        subscribe_timeout.as_millis()
                    )),
                })
                .await;
            return;
        }
    };

    tracing::info!(channel = %channel, "Subscribed to change feed");
    if tx.send(FeedMessage::status(ConnectionStatus::Subscribed)).await.is_err() {
        return;
    }

    let mut messages = pubsub.on_message();
    while let Some(msg) = messages.next().await {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(channel = %channel, error = %e, "Dropping non-text change feed message");
                continue;
            }
        };

        let Some(record) = parse_change_payload(&payload) else {
            continue;
        };
        if tx.send(FeedMessage::Change(record)).await.is_err() {
            // Consumer went away.
            return;
        }
    }

    let _ = tx
        .send(FeedMessage::Status {
            status: ConnectionStatus::ChannelError,
            detail: Some("change feed stream ended".to_string()),
        })
        .await;
}

/// Parse one published change record; unparseable payloads are logged and dropped.
pub fn parse_change_payload(payload: &str) -> Option<ChangeRecord> {
    match serde_json::from_str::<ChangeRecord>(payload) {
        Ok(record) => Some(record),
        Err(e) => {
            tracing::warn!(error = %e, "Dropping malformed change feed message");
            None
        }
    }
}
