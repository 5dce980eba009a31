//! Realtime change listener.
//!
//! Owns one change feed subscription and its lifecycle:
//! `disconnected → connecting → connected`, back to `disconnected` on
//! `CHANNEL_ERROR`, `TIMED_OUT` or `CLOSED`. Errors and timeouts schedule a
//! reconnect after `min(reconnect_delay * 2^attempts, max_reconnect_delay)`
//! while attempts remain. The attempt counter resets when the feed reports
//! `SUBSCRIBED` and on manual reconnect.
//!
//! Translated events are fanned out synchronously to registered handlers. A
//! handler that fails or panics is logged and does not affect the others.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use snowline_common::error::AppError;
use snowline_common::timer::ScheduledTask;
use snowline_common::types::{ConnectionStatus, NotificationEvent};

use crate::feed::{ChangeFeedSource, FeedMessage, TableFilter};
use crate::translate::translate_change;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ListenerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenerState::Disconnected => write!(f, "disconnected"),
            ListenerState::Connecting => write!(f, "connecting"),
            ListenerState::Connected => write!(f, "connected"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListenerConfig {
    pub schema: String,
    pub table: String,
    pub auto_reconnect: bool,
    pub reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub max_reconnect_delay: Duration,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            schema: "public".to_string(),
            table: "reports".to_string(),
            auto_reconnect: true,
            reconnect_delay: Duration::from_millis(1000),
            max_reconnect_attempts: 5,
            max_reconnect_delay: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListenerOverrides {
    pub schema: Option<String>,
    pub table: Option<String>,
    pub auto_reconnect: Option<bool>,
    pub reconnect_delay_ms: Option<u64>,
    pub max_reconnect_attempts: Option<u32>,
}

impl ListenerConfig {
    pub fn with_overrides(mut self, overrides: &ListenerOverrides) -> Self {
        if let Some(v) = &overrides.schema {
            self.schema = v.clone();
        }
        if let Some(v) = &overrides.table {
            self.table = v.clone();
        }
        if let Some(v) = overrides.auto_reconnect {
            self.auto_reconnect = v;
        }
        if let Some(v) = overrides.reconnect_delay_ms {
            self.reconnect_delay = Duration::from_millis(v);
        }
        if let Some(v) = overrides.max_reconnect_attempts {
            self.max_reconnect_attempts = v;
        }
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.schema.is_empty() || self.table.is_empty() {
            return Err(AppError::Config("listener schema and table must be set".to_string()));
        }
        if self.reconnect_delay.is_zero() {
            return Err(AppError::Config("reconnect_delay must be positive".to_string()));
        }
        Ok(())
    }

    /// Delay before reconnect attempt number `attempts` (0-indexed).
    pub fn reconnect_delay_for(&self, attempts: u32) -> Duration {
        let factor = 2u32.checked_pow(attempts).unwrap_or(u32::MAX);
        self.reconnect_delay
            .checked_mul(factor)
            .unwrap_or(self.max_reconnect_delay)
            .min(self.max_reconnect_delay)
    }
}

pub type EventHandler = Arc<dyn Fn(&NotificationEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct ListenerInner {
    config: ListenerConfig,
    source: Arc<dyn ChangeFeedSource>,
    state: Mutex<ListenerState>,
    reconnect_attempts: AtomicU32,
    /// Set by `disconnect`; suppresses automatic reconnects.
    stopped: AtomicBool,
    handlers: Mutex<Vec<(HandlerId, EventHandler)>>,
    next_handler_id: AtomicU64,
    reader: Mutex<Option<JoinHandle<()>>>,
    reconnect_timer: Mutex<ScheduledTask>,
}

impl ListenerInner {
    fn set_state(&self, state: ListenerState) {
        let mut current = self.state.lock();
        if *current != state {
            tracing::debug!(from = %*current, to = %state, "Listener state changed");
            *current = state;
        }
    }

    fn filter(&self) -> TableFilter {
        TableFilter {
            schema: self.config.schema.clone(),
            table: self.config.table.clone(),
        }
    }

    fn dispatch(&self, event: &NotificationEvent) {
        let handlers: Vec<(HandlerId, EventHandler)> = self.handlers.lock().clone();
        tracing::debug!(
            event_id = %event.id,
            area = %event.area,
            kind = %event.kind,
            handlers = handlers.len(),
            "Dispatching notification event"
        );

        for (id, handler) in handlers {
            match std::panic::catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(handler = id.0, event_id = %event.id, error = %e, "Event handler failed");
                }
                Err(_) => {
                    tracing::error!(handler = id.0, event_id = %event.id, "Event handler panicked");
                }
            }
        }
    }
}

/// Subscribe to the feed and start reading it. Boxed because reconnect
/// timers call back into it.
fn connect_inner(inner: Arc<ListenerInner>) -> BoxFuture<'static, Result<(), AppError>> {
    async move {
        if let Some(previous) = inner.reader.lock().take() {
            previous.abort();
        }
        inner.set_state(ListenerState::Connecting);

        let filter = inner.filter();
        match inner.source.subscribe(&filter).await {
            Ok(rx) => {
                if inner.stopped.load(Ordering::Acquire) {
                    inner.source.unsubscribe().await;
                    inner.set_state(ListenerState::Disconnected);
                    return Ok(());
                }
                let reader = tokio::spawn(read_feed(Arc::clone(&inner), rx));
                *inner.reader.lock() = Some(reader);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    schema = %filter.schema,
                    table = %filter.table,
                    error = %e,
                    "Change feed subscription failed"
                );
                inner.set_state(ListenerState::Disconnected);
                schedule_reconnect(&inner);
                Err(e)
            }
        }
    }
    .boxed()
}

fn schedule_reconnect(inner: &Arc<ListenerInner>) {
    if !inner.config.auto_reconnect || inner.stopped.load(Ordering::Acquire) {
        return;
    }

    let attempts = inner.reconnect_attempts.load(Ordering::Acquire);
    if attempts >= inner.config.max_reconnect_attempts {
        tracing::error!(
            attempts,
            max_attempts = inner.config.max_reconnect_attempts,
            "Giving up on change feed reconnection"
        );
        return;
    }

    let delay = inner.config.reconnect_delay_for(attempts);
    inner.reconnect_attempts.fetch_add(1, Ordering::AcqRel);
    tracing::info!(
        attempt = attempts + 1,
        delay_ms = delay.as_millis() as u64,
        "Scheduling change feed reconnect"
    );

    let target = Arc::clone(inner);
    inner.reconnect_timer.lock().schedule(delay, move |generation| async move {
        // Running now; a later cancel must not abort this connect.
        if !target.reconnect_timer.lock().release(generation) {
            return;
        }
        if target.stopped.load(Ordering::Acquire) {
            return;
        }
        let _ = connect_inner(target).await;
    });
}

async fn read_feed(inner: Arc<ListenerInner>, mut rx: mpsc::Receiver<FeedMessage>) {
    while let Some(message) = rx.recv().await {
        match message {
            FeedMessage::Change(record) => {
                if let Some(event) = translate_change(&record) {
                    inner.dispatch(&event);
                }
            }
            FeedMessage::Status { status, detail } => match status {
                ConnectionStatus::Subscribed => {
                    inner.set_state(ListenerState::Connected);
                    inner.reconnect_attempts.store(0, Ordering::Release);
                    tracing::info!(
                        schema = %inner.config.schema,
                        table = %inner.config.table,
                        "Realtime listener connected"
                    );
                }
                ConnectionStatus::ChannelError | ConnectionStatus::TimedOut => {
                    inner.set_state(ListenerState::Disconnected);
                    tracing::warn!(
                        status = %status,
                        detail = detail.as_deref().unwrap_or_default(),
                        "Change feed connection lost"
                    );
                    schedule_reconnect(&inner);
                    return;
                }
                ConnectionStatus::Closed => {
                    inner.set_state(ListenerState::Disconnected);
                    tracing::info!("Change feed closed");
                    return;
                }
            },
        }
    }

    if !inner.stopped.load(Ordering::Acquire) {
        inner.set_state(ListenerState::Disconnected);
        tracing::warn!("Change feed ended without a status update");
        schedule_reconnect(&inner);
    }
}

/// Listener handle. Clones share the same subscription and handlers.
#[derive(Clone)]
pub struct RealtimeListener {
    inner: Arc<ListenerInner>,
}

impl RealtimeListener {
    pub fn new(source: Arc<dyn ChangeFeedSource>, config: ListenerConfig) -> Result<Self, AppError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ListenerInner {
                config,
                source,
                state: Mutex::new(ListenerState::Disconnected),
                reconnect_attempts: AtomicU32::new(0),
                stopped: AtomicBool::new(false),
                handlers: Mutex::new(Vec::new()),
                next_handler_id: AtomicU64::new(1),
                reader: Mutex::new(None),
                reconnect_timer: Mutex::new(ScheduledTask::new()),
            }),
        })
    }

    /// Subscribe to the change feed. A failed subscription is returned and,
    /// with auto-reconnect on, retried in the background.
    pub async fn connect(&self) -> Result<(), AppError> {
        self.inner.stopped.store(false, Ordering::Release);
        connect_inner(Arc::clone(&self.inner)).await
    }

    /// Tear down the subscription and stop reconnecting.
    pub async fn disconnect(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.inner.reconnect_timer.lock().cancel();
        if let Some(reader) = self.inner.reader.lock().take() {
            reader.abort();
        }
        self.inner.source.unsubscribe().await;
        self.inner.set_state(ListenerState::Disconnected);
        tracing::info!("Realtime listener disconnected");
    }

    /// Manual reconnect: resets the attempt counter and resubscribes now.
    pub async fn reconnect(&self) -> Result<(), AppError> {
        self.inner.reconnect_timer.lock().cancel();
        self.inner.reconnect_attempts.store(0, Ordering::Release);
        if let Some(reader) = self.inner.reader.lock().take() {
            reader.abort();
        }
        self.inner.source.unsubscribe().await;
        tracing::info!("Manual change feed reconnect");
        self.connect().await
    }

    pub fn add_event_handler<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&NotificationEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = HandlerId(self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed));
        self.inner.handlers.lock().push((id, Arc::new(handler)));
        id
    }

    pub fn remove_event_handler(&self, id: HandlerId) -> bool {
        let mut handlers = self.inner.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    pub fn handler_count(&self) -> usize {
        self.inner.handlers.lock().len()
    }

    pub fn state(&self) -> ListenerState {
        *self.inner.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ListenerState::Connected
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.reconnect_attempts.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::time::Instant;

    use snowline_common::types::{ChangeRecord, ChangeType};

    /// Feed whose subscriptions replay scripted messages. Without a script a
    /// subscription reports `CHANNEL_ERROR` immediately.
    #[derive(Default)]
    struct ScriptedFeed {
        scripts: Mutex<VecDeque<Vec<FeedMessage>>>,
        subscribed_at: Mutex<Vec<Instant>>,
        live: Mutex<Option<mpsc::Sender<FeedMessage>>>,
        unsubscribes: AtomicU32,
    }

    impl ScriptedFeed {
        fn with_scripts(scripts: Vec<Vec<FeedMessage>>) -> Arc<Self> {
            let feed = Self::default();
            *feed.scripts.lock() = scripts.into();
            Arc::new(feed)
        }

        async fn publish(&self, record: ChangeRecord) {
            let tx = self.live.lock().clone().unwrap();
            tx.send(FeedMessage::Change(record)).await.unwrap();
        }

        fn subscribe_times(&self) -> Vec<Instant> {
            self.subscribed_at.lock().clone()
        }
    }

    #[async_trait]
    impl ChangeFeedSource for ScriptedFeed {
        async fn subscribe(&self, _filter: &TableFilter) -> Result<mpsc::Receiver<FeedMessage>, AppError> {
            self.subscribed_at.lock().push(Instant::now());
            let script = self
                .scripts
                .lock()
                .pop_front()
                .unwrap_or_else(|| vec![FeedMessage::status(ConnectionStatus::ChannelError)]);

            let (tx, rx) = mpsc::channel(16);
            for message in script {
                tx.send(message).await.unwrap();
            }
            *self.live.lock() = Some(tx);
            Ok(rx)
        }

        async fn unsubscribe(&self) {
            self.unsubscribes.fetch_add(1, Ordering::SeqCst);
            self.live.lock().take();
        }
    }

    fn make_listener(feed: Arc<ScriptedFeed>) -> RealtimeListener {
        RealtimeListener::new(feed, ListenerConfig::default()).unwrap()
    }

    fn subscribed() -> Vec<FeedMessage> {
        vec![FeedMessage::status(ConnectionStatus::Subscribed)]
    }

    fn insert_record(id: u32, area: &str) -> ChangeRecord {
        ChangeRecord {
            event_type: ChangeType::Insert,
            new: Some(json!({"id": id, "area": area, "start_time": "2024-01-15T06:00:00Z"})),
            old: None,
            table: "reports".into(),
            schema: "public".into(),
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[test]
    fn test_reconnect_delay_doubles_and_caps() {
        let config = ListenerConfig::default();
        assert_eq!(config.reconnect_delay_for(0), Duration::from_millis(1000));
        assert_eq!(config.reconnect_delay_for(1), Duration::from_millis(2000));
        assert_eq!(config.reconnect_delay_for(2), Duration::from_millis(4000));
        assert_eq!(config.reconnect_delay_for(5), Duration::from_secs(30));
        assert_eq!(config.reconnect_delay_for(40), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_errors_reconnect_with_backoff() {
        let feed = ScriptedFeed::with_scripts(Vec::new());
        let listener = make_listener(feed.clone());

        listener.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(7500)).await;

        let times = feed.subscribe_times();
        assert_eq!(times.len(), 4);
        let gaps: Vec<u128> = times.windows(2).map(|w| (w[1] - w[0]).as_millis()).collect();
        assert_eq!(gaps, vec![1000, 2000, 4000]);
        // The fourth failure already scheduled the next attempt.
        assert_eq!(listener.reconnect_attempts(), 4);
        assert_eq!(listener.state(), ListenerState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let feed = ScriptedFeed::with_scripts(Vec::new());
        let config = ListenerConfig {
            max_reconnect_attempts: 2,
            ..Default::default()
        };
        let listener = RealtimeListener::new(feed.clone(), config).unwrap();

        listener.connect().await.unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(feed.subscribe_times().len(), 3);
        assert_eq!(listener.state(), ListenerState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribed_resets_attempts() {
        let feed = ScriptedFeed::with_scripts(vec![
            vec![FeedMessage::status(ConnectionStatus::TimedOut)],
            subscribed(),
        ]);
        let listener = make_listener(feed.clone());

        listener.connect().await.unwrap();
        settle().await;
        assert_eq!(listener.reconnect_attempts(), 1);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(listener.is_connected());
        assert_eq!(listener.reconnect_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_does_not_reconnect() {
        let feed = ScriptedFeed::with_scripts(vec![vec![
            FeedMessage::status(ConnectionStatus::Subscribed),
            FeedMessage::status(ConnectionStatus::Closed),
        ]]);
        let listener = make_listener(feed.clone());

        listener.connect().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(feed.subscribe_times().len(), 1);
        assert_eq!(listener.state(), ListenerState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_stops_pending_reconnect() {
        let feed = ScriptedFeed::with_scripts(Vec::new());
        let listener = make_listener(feed.clone());

        listener.connect().await.unwrap();
        settle().await;
        listener.disconnect().await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(feed.subscribe_times().len(), 1);
        assert_eq!(feed.unsubscribes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_reconnect_resets_attempts() {
        let feed = ScriptedFeed::with_scripts(vec![
            vec![FeedMessage::status(ConnectionStatus::ChannelError)],
            vec![FeedMessage::status(ConnectionStatus::ChannelError)],
            subscribed(),
        ]);
        let listener = make_listener(feed.clone());

        listener.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(listener.reconnect_attempts(), 2);

        listener.reconnect().await.unwrap();
        settle().await;
        assert!(listener.is_connected());
        assert_eq!(listener.reconnect_attempts(), 0);

        // The pending automatic reconnect was cancelled.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(feed.subscribe_times().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_handlers_are_isolated() {
        let feed = ScriptedFeed::with_scripts(vec![subscribed()]);
        let listener = make_listener(feed.clone());
        let seen = Arc::new(Mutex::new(Vec::new()));

        listener.add_event_handler(|_| anyhow::bail!("handler failure"));
        listener.add_event_handler(|_| panic!("handler panic"));
        let sink = seen.clone();
        let counting = listener.add_event_handler(move |event| {
            sink.lock().push(event.area.clone());
            Ok(())
        });

        listener.connect().await.unwrap();
        feed.publish(insert_record(1, "Kallio")).await;
        settle().await;
        assert_eq!(*seen.lock(), vec!["Kallio".to_string()]);

        assert!(listener.remove_event_handler(counting));
        assert!(!listener.remove_event_handler(counting));
        feed.publish(insert_record(2, "Vallila")).await;
        settle().await;
        assert_eq!(seen.lock().len(), 1);
        assert_eq!(listener.handler_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_events_not_dispatched() {
        let feed = ScriptedFeed::with_scripts(vec![subscribed()]);
        let listener = make_listener(feed.clone());
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        listener.add_event_handler(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        listener.connect().await.unwrap();
        feed.publish(ChangeRecord {
            event_type: ChangeType::Delete,
            new: None,
            old: Some(json!({"id": 1, "area": "Kallio"})),
            table: "reports".into(),
            schema: "public".into(),
        })
        .await;
        settle().await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
