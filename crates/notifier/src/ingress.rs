//! Ingress stage between the listener and the pipeline.
//!
//! Listener handlers are synchronous, so events are pushed onto a bounded
//! channel and a single consumer task queues them on the pipeline in arrival
//! order. In throttle, batch or debounce mode the events first pass through
//! a [`NotificationThrottler`] whose flushes feed the same channel.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use snowline_common::config::IngressMode;
use snowline_common::error::AppError;
use snowline_common::types::{NotificationEvent, NotificationKind, Priority};
use snowline_engine::throttle::{FlushKind, NotificationThrottler, ThrottleConfig, ThrottledNotification};

use crate::pipeline::NotificationPipeline;

const INGRESS_BUFFER: usize = 1024;

pub fn priority_for(kind: NotificationKind) -> Priority {
    match kind {
        NotificationKind::Start => Priority::High,
        NotificationKind::End => Priority::Normal,
    }
}

pub struct Ingress {
    mode: IngressMode,
    ready: mpsc::Sender<NotificationEvent>,
    throttler: Option<NotificationThrottler>,
}

impl Ingress {
    /// Build the stage and spawn its consumer task.
    pub fn start(
        mode: IngressMode,
        throttle: ThrottleConfig,
        pipeline: NotificationPipeline,
    ) -> Result<(Self, JoinHandle<()>), AppError> {
        let (ready, rx) = mpsc::channel(INGRESS_BUFFER);

        let throttler = match mode {
            IngressMode::Direct => None,
            _ => {
                let sink = ready.clone();
                let on_flush = Arc::new(move |kind: FlushKind, items: Vec<ThrottledNotification>| {
                    tracing::debug!(kind = ?kind, count = items.len(), "Ingress flush");
                    for item in items {
                        if let Err(e) = sink.try_send(item.event) {
                            tracing::warn!(error = %e, "Ingress channel full, dropping flushed event");
                        }
                    }
                });
                Some(NotificationThrottler::new(throttle, on_flush)?)
            }
        };

        let consumer = tokio::spawn(consume(rx, pipeline));
        tracing::info!(mode = ?mode, "Ingress stage started");

        Ok((
            Self {
                mode,
                ready,
                throttler,
            },
            consumer,
        ))
    }

    pub fn mode(&self) -> IngressMode {
        self.mode
    }

    /// Hand one listener event to the stage. Never blocks.
    pub fn submit(&self, event: NotificationEvent) -> anyhow::Result<()> {
        let Some(throttler) = &self.throttler else {
            self.ready
                .try_send(event)
                .map_err(|e| anyhow::anyhow!("ingress channel unavailable: {}", e))?;
            return Ok(());
        };

        let priority = priority_for(event.kind);
        let item = ThrottledNotification::new(event, priority);
        match self.mode {
            IngressMode::Throttle => throttler.throttle_notification(item),
            IngressMode::Batch => throttler.batch_notification(item),
            IngressMode::Debounce | IngressMode::Direct => throttler.debounce_notification(item),
        }
        Ok(())
    }

    /// Drop anything held by the throttler. Returns the number discarded.
    pub fn shutdown(&self) -> usize {
        self.throttler.as_ref().map_or(0, NotificationThrottler::dispose)
    }
}

async fn consume(mut rx: mpsc::Receiver<NotificationEvent>, pipeline: NotificationPipeline) {
    while let Some(event) = rx.recv().await {
        let event_id = event.id;
        match pipeline.queue_notification(event).await {
            Ok(outcome) => tracing::debug!(event_id = %event_id, outcome = ?outcome, "Event ingested"),
            Err(e) => tracing::warn!(event_id = %event_id, error = %e, "Failed to queue notification"),
        }
    }
    tracing::debug!("Ingress consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;

    use snowline_common::history::HistoryStore;
    use snowline_common::preferences::PreferencesStore;
    use snowline_common::store::MemoryStore;
    use snowline_common::types::SubscriberPreferences;
    use snowline_engine::recovery::ErrorRecovery;
    use snowline_engine::retry::RetryEngine;

    use crate::in_app::InAppDispatcher;
    use crate::pipeline::{PipelineConfig, PipelineDeps};
    use crate::push::UnsupportedPush;

    async fn make_pipeline() -> NotificationPipeline {
        let kv = Arc::new(MemoryStore::new());
        let deps = PipelineDeps {
            preferences: PreferencesStore::new(kv.clone(), "prefs"),
            history: HistoryStore::new(kv, "history"),
            push: Arc::new(UnsupportedPush),
            in_app: Arc::new(InAppDispatcher::new()),
            retry: Arc::new(RetryEngine::new()),
            recovery: Arc::new(ErrorRecovery::new()),
        };
        deps.preferences
            .save_preferences(&SubscriberPreferences::new(["Kallio", "Vallila"], false, true))
            .await
            .unwrap();
        let config = PipelineConfig {
            debounce_delay: Duration::from_secs(60),
            ..Default::default()
        };
        NotificationPipeline::new(config, deps).unwrap()
    }

    fn make_event(area: &str, kind: NotificationKind, record: &str) -> NotificationEvent {
        NotificationEvent::new(area, kind, record, "m", Utc::now())
    }

    #[test]
    fn test_start_events_outrank_end_events() {
        assert_eq!(priority_for(NotificationKind::Start), Priority::High);
        assert_eq!(priority_for(NotificationKind::End), Priority::Normal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_mode_queues_each_event() {
        let pipeline = make_pipeline().await;
        let (ingress, _consumer) =
            Ingress::start(IngressMode::Direct, ThrottleConfig::default(), pipeline.clone()).unwrap();

        ingress.submit(make_event("Kallio", NotificationKind::Start, "1")).unwrap();
        ingress.submit(make_event("Vallila", NotificationKind::Start, "2")).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(pipeline.pending_count(), 2);
        assert_eq!(ingress.shutdown(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_mode_coalesces_before_queueing() {
        let pipeline = make_pipeline().await;
        let (ingress, _consumer) =
            Ingress::start(IngressMode::Throttle, ThrottleConfig::default(), pipeline.clone()).unwrap();

        ingress.submit(make_event("Kallio", NotificationKind::Start, "1")).unwrap();
        ingress.submit(make_event("Kallio", NotificationKind::Start, "2")).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pipeline.pending_count(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(pipeline.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_discards_held_events() {
        let pipeline = make_pipeline().await;
        let (ingress, _consumer) =
            Ingress::start(IngressMode::Debounce, ThrottleConfig::default(), pipeline.clone()).unwrap();

        ingress.submit(make_event("Kallio", NotificationKind::End, "3")).unwrap();
        assert_eq!(ingress.shutdown(), 1);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(pipeline.pending_count(), 0);
    }
}
