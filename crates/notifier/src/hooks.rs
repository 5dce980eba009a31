//! Recovery hooks backed by the daemon's real collaborators.

use std::sync::Arc;

use async_trait::async_trait;

use snowline_common::history::HistoryStore;
use snowline_common::preferences::PreferencesStore;
use snowline_engine::recovery::RecoveryHooks;
use snowline_engine::retry::RetryEngine;
use snowline_listener::listener::RealtimeListener;

use crate::pipeline::WeakPipeline;
use crate::push::PushSender;

pub struct PipelineRecoveryHooks {
    pipeline: WeakPipeline,
    retry: Arc<RetryEngine>,
    push: Arc<dyn PushSender>,
    preferences: PreferencesStore,
    history: HistoryStore,
    listener: Option<RealtimeListener>,
}

impl PipelineRecoveryHooks {
    pub fn new(
        pipeline: WeakPipeline,
        retry: Arc<RetryEngine>,
        push: Arc<dyn PushSender>,
        preferences: PreferencesStore,
        history: HistoryStore,
    ) -> Self {
        Self {
            pipeline,
            retry,
            push,
            preferences,
            history,
            listener: None,
        }
    }

    pub fn with_listener(mut self, listener: RealtimeListener) -> Self {
        self.listener = Some(listener);
        self
    }
}

#[async_trait]
impl RecoveryHooks for PipelineRecoveryHooks {
    async fn retry_failed(&self) -> anyhow::Result<bool> {
        let report = self.retry.process_queue().await;
        if report.skipped {
            // A run is already in flight; it covers this request.
            return Ok(true);
        }
        Ok(report.attempted == 0 || report.succeeded > 0)
    }

    async fn reconnect(&self) -> anyhow::Result<bool> {
        let Some(listener) = &self.listener else {
            return Ok(false);
        };
        // Connection is confirmed asynchronously by the feed's SUBSCRIBED status.
        listener.reconnect().await?;
        Ok(true)
    }

    async fn use_in_app_only(&self) -> anyhow::Result<bool> {
        let Some(pipeline) = self.pipeline.upgrade() else {
            return Ok(false);
        };
        pipeline.set_push_disabled(true);
        Ok(true)
    }

    async fn check_permission(&self) -> anyhow::Result<bool> {
        if !self.push.is_supported() {
            return Ok(false);
        }
        let granted = self.push.refresh_permission().await?;
        if granted {
            if let Some(pipeline) = self.pipeline.upgrade() {
                pipeline.set_push_disabled(false);
            }
        }
        Ok(granted)
    }

    async fn reset_preferences(&self) -> anyhow::Result<bool> {
        self.preferences.clear().await?;
        tracing::warn!("Stored notification preferences were reset");
        Ok(true)
    }

    async fn clear_history(&self) -> anyhow::Result<bool> {
        self.history.clear().await?;
        tracing::warn!("Notification history cleared");
        Ok(true)
    }
}
