//! Notification pipeline: filters and deduplicates events, then delivers them in batches.
//!
//! Events enter through `queue_notification`, which filters against the
//! subscriber's preferences, drops duplicates of anything still pending and
//! restarts a debounce timer. When the timer fires, `process_batch` drains up
//! to `batch_size` events and delivers them in parallel under a hard timeout.
//!
//! Delivery of one event tries push first (through the retry engine) and
//! falls back to in-app only when push was skipped or failed. Any successful
//! channel records a history entry. When every attempted channel fails, the
//! error is classified and the whole delivery is handed to the retry engine's
//! failure queue at high priority.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use snowline_common::error::AppError;
use snowline_common::history::HistoryStore;
use snowline_common::preferences::PreferencesStore;
use snowline_common::timer::ScheduledTask;
use snowline_common::types::{
    DeliveryChannel, DeliveryResult, NewHistoryItem, NotificationEvent, SubscriberPreferences,
};
use snowline_engine::recovery::{ErrorRecovery, RecoveryHooks, recovery_options};
use snowline_engine::retry::{PRIORITY_HIGH, RetryConfig, RetryEngine, RetryOverrides};

use crate::in_app::InAppDispatcher;
use crate::push::{PushSender, build_push_payload};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PipelineConfig {
    /// Maximum events delivered per batch.
    pub batch_size: usize,
    /// Quiet period after the last queued event before a batch runs.
    pub debounce_delay: Duration,
    /// Pause before each event's delivery starts.
    pub delivery_delay: Duration,
    /// Hard limit on one batch; results arriving later are disregarded.
    pub delivery_timeout: Duration,
    /// Delay before the next batch when events remain pending.
    pub follow_up_delay: Duration,
    /// Retry schedule for one push send.
    pub push_retry: RetryConfig,
    /// Retry schedule for a whole delivery on the failure queue.
    pub requeue_retry: RetryConfig,
    pub requeue_priority: u32,
    pub push_icon: Option<String>,
    /// Attempt the top recovery option before escalating a failed delivery.
    pub auto_recover: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            debounce_delay: Duration::from_millis(300),
            delivery_delay: Duration::ZERO,
            delivery_timeout: Duration::from_secs(30),
            follow_up_delay: Duration::from_millis(100),
            push_retry: RetryConfig {
                max_retries: 2,
                base_delay: Duration::from_millis(1000),
                max_delay: Duration::from_millis(5000),
                backoff_multiplier: 2.0,
                jitter_factor: 0.1,
            },
            requeue_retry: RetryConfig {
                max_retries: 5,
                base_delay: Duration::from_secs(30),
                max_delay: Duration::from_secs(300),
                backoff_multiplier: 2.0,
                jitter_factor: 0.2,
            },
            requeue_priority: PRIORITY_HIGH,
            push_icon: None,
            auto_recover: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineOverrides {
    pub batch_size: Option<usize>,
    pub debounce_delay_ms: Option<u64>,
    pub delivery_delay_ms: Option<u64>,
    pub delivery_timeout_ms: Option<u64>,
    pub push_retry: Option<RetryOverrides>,
    pub requeue_retry: Option<RetryOverrides>,
    pub push_icon: Option<String>,
    pub auto_recover: Option<bool>,
}

impl PipelineConfig {
    pub fn with_overrides(mut self, overrides: &PipelineOverrides) -> Self {
        if let Some(v) = overrides.batch_size {
            self.batch_size = v;
        }
        if let Some(v) = overrides.debounce_delay_ms {
            self.debounce_delay = Duration::from_millis(v);
        }
        if let Some(v) = overrides.delivery_delay_ms {
            self.delivery_delay = Duration::from_millis(v);
        }
        if let Some(v) = overrides.delivery_timeout_ms {
            self.delivery_timeout = Duration::from_millis(v);
        }
        if let Some(o) = &overrides.push_retry {
            self.push_retry = self.push_retry.with_overrides(o);
        }
        if let Some(o) = &overrides.requeue_retry {
            self.requeue_retry = self.requeue_retry.with_overrides(o);
        }
        if let Some(v) = &overrides.push_icon {
            self.push_icon = Some(v.clone());
        }
        if let Some(v) = overrides.auto_recover {
            self.auto_recover = v;
        }
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.batch_size == 0 {
            return Err(AppError::Config("pipeline batch_size must be at least 1".to_string()));
        }
        if self.delivery_timeout.is_zero() {
            return Err(AppError::Config("delivery_timeout must be positive".to_string()));
        }
        self.push_retry.validate()?;
        self.requeue_retry.validate()
    }
}

/// What `queue_notification` did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    Queued,
    NoPreferences,
    AreaNotFollowed,
    ChannelsDisabled,
    Duplicate,
}

/// Running totals. Delivery counters include deliveries that completed after
/// their batch timed out, since the notification still reached the channel.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    pub received: u64,
    pub filtered: u64,
    pub duplicates: u64,
    pub batches: u64,
    pub timed_out_batches: u64,
    pub delivered_push: u64,
    pub delivered_in_app: u64,
    /// Events for which every attempted channel failed.
    pub failed: u64,
    /// Events with no channel left to try.
    pub undeliverable: u64,
    pub escalated: u64,
    pub pending: usize,
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// Another batch was already running.
    pub skipped: bool,
    pub attempted: usize,
    /// The batch hit `delivery_timeout`; `results` holds what finished in time.
    pub timed_out: bool,
    pub results: Vec<DeliveryResult>,
}

/// Collaborators the pipeline delivers through.
#[derive(Clone)]
pub struct PipelineDeps {
    pub preferences: PreferencesStore,
    pub history: HistoryStore,
    pub push: Arc<dyn PushSender>,
    pub in_app: Arc<InAppDispatcher>,
    pub retry: Arc<RetryEngine>,
    pub recovery: Arc<ErrorRecovery>,
}

struct PipelineInner {
    config: PipelineConfig,
    deps: PipelineDeps,
    hooks: Mutex<Option<Arc<dyn RecoveryHooks>>>,
    pending: Mutex<VecDeque<NotificationEvent>>,
    processing: AtomicBool,
    /// Set by the "use in-app only" recovery option.
    push_disabled: AtomicBool,
    shut_down: AtomicBool,
    debounce: Mutex<ScheduledTask>,
    follow_up: Mutex<ScheduledTask>,
    stats: Mutex<PipelineStats>,
}

#[derive(Clone)]
pub struct NotificationPipeline {
    inner: Arc<PipelineInner>,
}

/// Non-owning pipeline handle for callbacks the pipeline itself holds.
#[derive(Clone)]
pub struct WeakPipeline {
    inner: Weak<PipelineInner>,
}

impl WeakPipeline {
    pub fn upgrade(&self) -> Option<NotificationPipeline> {
        self.inner.upgrade().map(|inner| NotificationPipeline { inner })
    }
}

impl NotificationPipeline {
    pub fn new(config: PipelineConfig, deps: PipelineDeps) -> Result<Self, AppError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(PipelineInner {
                config,
                deps,
                hooks: Mutex::new(None),
                pending: Mutex::new(VecDeque::new()),
                processing: AtomicBool::new(false),
                push_disabled: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                debounce: Mutex::new(ScheduledTask::new()),
                follow_up: Mutex::new(ScheduledTask::new()),
                stats: Mutex::new(PipelineStats::default()),
            }),
        })
    }

    pub fn downgrade(&self) -> WeakPipeline {
        WeakPipeline {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Hooks used for automatic recovery of failed deliveries.
    pub fn set_recovery_hooks(&self, hooks: Arc<dyn RecoveryHooks>) {
        *self.inner.hooks.lock() = Some(hooks);
    }

    pub fn set_push_disabled(&self, disabled: bool) {
        self.inner.push_disabled.store(disabled, Ordering::Release);
        tracing::info!(disabled, "Push delivery switch changed");
    }

    pub fn is_push_disabled(&self) -> bool {
        self.inner.push_disabled.load(Ordering::Acquire)
    }

    /// Filter, deduplicate and enqueue one event. Delivery happens later in a batch.
    pub async fn queue_notification(&self, event: NotificationEvent) -> Result<QueueOutcome, AppError> {
        let inner = &self.inner;
        if inner.shut_down.load(Ordering::Acquire) {
            return Err(AppError::Internal("pipeline is shut down".to_string()));
        }
        inner.stats.lock().received += 1;

        let preferences = match inner.deps.preferences.get_preferences().await {
            Ok(p) => p,
            Err(e) => {
                inner.deps.recovery.log_error(
                    &e,
                    Some(&serde_json::json!({ "stage": "queue", "eventId": event.id })),
                );
                return Err(e);
            }
        };

        let outcome = match preferences {
            None => QueueOutcome::NoPreferences,
            Some(p) if !p.follows(&event.area) => QueueOutcome::AreaNotFollowed,
            Some(p) if !p.any_channel_enabled() => QueueOutcome::ChannelsDisabled,
            Some(_) => QueueOutcome::Queued,
        };
        if outcome != QueueOutcome::Queued {
            inner.stats.lock().filtered += 1;
            tracing::debug!(event_id = %event.id, area = %event.area, outcome = ?outcome, "Notification filtered");
            return Ok(outcome);
        }

        {
            let mut pending = inner.pending.lock();
            let duplicate = pending
                .iter()
                .any(|p| p.id == event.id || p.logical_key() == event.logical_key());
            if duplicate {
                drop(pending);
                inner.stats.lock().duplicates += 1;
                tracing::debug!(
                    event_id = %event.id,
                    report_id = %event.source_record_id,
                    kind = %event.kind,
                    "Duplicate notification dropped"
                );
                return Ok(QueueOutcome::Duplicate);
            }
            tracing::debug!(event_id = %event.id, area = %event.area, kind = %event.kind, "Notification queued");
            pending.push_back(event);
        }

        schedule_batch(inner, &inner.debounce, inner.config.debounce_delay);
        Ok(QueueOutcome::Queued)
    }

    /// Deliver up to `batch_size` pending events. Concurrent calls are no-ops.
    pub async fn process_batch(&self) -> BatchReport {
        process_batch_inner(Arc::clone(&self.inner)).await
    }

    /// Deliver one event immediately, bypassing the queue.
    pub async fn deliver(&self, event: &NotificationEvent) -> Result<Vec<DeliveryResult>, AppError> {
        let Some(preferences) = self.inner.deps.preferences.get_preferences().await? else {
            return Ok(Vec::new());
        };
        Ok(deliver_event(Arc::clone(&self.inner), event.clone(), preferences, true).await)
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn stats(&self) -> PipelineStats {
        let mut stats = self.inner.stats.lock().clone();
        stats.pending = self.pending_count();
        stats
    }

    /// Stop accepting events and cancel scheduled batches. Returns the number
    /// of events left undelivered.
    pub fn shutdown(&self) -> usize {
        self.inner.shut_down.store(true, Ordering::Release);
        self.inner.debounce.lock().cancel();
        self.inner.follow_up.lock().cancel();
        let dropped = self.inner.pending.lock().len();
        tracing::info!(undelivered = dropped, "Notification pipeline stopped");
        dropped
    }
}

fn schedule_batch(inner: &Arc<PipelineInner>, slot: &Mutex<ScheduledTask>, delay: Duration) {
    let weak = Arc::downgrade(inner);
    slot.lock().schedule(delay, move |_| async move {
        if let Some(inner) = weak.upgrade() {
            // Detached so a later reschedule cannot abort a running batch.
            tokio::spawn(process_batch_inner(inner));
        }
    });
}

async fn process_batch_inner(inner: Arc<PipelineInner>) -> BatchReport {
    if inner.processing.swap(true, Ordering::AcqRel) {
        tracing::debug!("Batch already in progress");
        return BatchReport {
            skipped: true,
            ..Default::default()
        };
    }
    let _guard = ProcessingGuard(&inner.processing);

    let batch: Vec<NotificationEvent> = {
        let mut pending = inner.pending.lock();
        let take = inner.config.batch_size.min(pending.len());
        pending.drain(..take).collect()
    };
    if batch.is_empty() {
        return BatchReport::default();
    }
    inner.stats.lock().batches += 1;

    let mut report = BatchReport {
        attempted: batch.len(),
        ..Default::default()
    };

    let preferences = match inner.deps.preferences.get_preferences().await {
        Ok(Some(p)) => p,
        Ok(None) => {
            tracing::warn!(dropped = batch.len(), "Preferences removed, dropping batch");
            inner.stats.lock().filtered += batch.len() as u64;
            return report;
        }
        Err(e) => {
            inner.deps.recovery.log_error(&e, Some(&serde_json::json!({ "stage": "batch" })));
            for event in batch {
                escalate(&inner, event);
            }
            return report;
        }
    };

    tracing::debug!(size = batch.len(), "Processing notification batch");

    let collected = Arc::new(Mutex::new(Vec::new()));
    let deliveries: Vec<_> = batch
        .into_iter()
        .map(|event| {
            let inner = Arc::clone(&inner);
            let preferences = preferences.clone();
            let collected = Arc::clone(&collected);
            tokio::spawn(async move {
                if !inner.config.delivery_delay.is_zero() {
                    tokio::time::sleep(inner.config.delivery_delay).await;
                }
                let results = deliver_event(inner, event, preferences, true).await;
                collected.lock().extend(results);
            })
        })
        .collect();

    match tokio::time::timeout(inner.config.delivery_timeout, join_all(deliveries)).await {
        Ok(joined) => {
            for e in joined.into_iter().filter_map(Result::err) {
                tracing::error!(error = %e, panicked = e.is_panic(), "Delivery task did not complete");
            }
        }
        Err(_) => {
            report.timed_out = true;
            inner.stats.lock().timed_out_batches += 1;
            tracing::warn!(
                timeout_ms = inner.config.delivery_timeout.as_millis() as u64,
                attempted = report.attempted,
                "Batch delivery timed out, late results disregarded"
            );
        }
    }
    report.results = std::mem::take(&mut *collected.lock());

    let remaining = inner.pending.lock().len();
    if remaining > 0 && !inner.shut_down.load(Ordering::Acquire) {
        tracing::debug!(remaining, "Scheduling follow-up batch");
        schedule_batch(&inner, &inner.follow_up, inner.config.follow_up_delay);
    }

    report
}

/// Deliver one event: push with retries, then in-app if push did not succeed.
///
/// Boxed because failed deliveries are re-queued as closures that call back
/// into this function.
fn deliver_event(
    inner: Arc<PipelineInner>,
    event: NotificationEvent,
    preferences: SubscriberPreferences,
    escalate_on_failure: bool,
) -> BoxFuture<'static, Vec<DeliveryResult>> {
    async move {
        let mut results = Vec::with_capacity(2);
        let mut last_error: Option<anyhow::Error> = None;

        let push = &inner.deps.push;
        let push_enabled = preferences.push_enabled
            && !inner.push_disabled.load(Ordering::Acquire)
            && push.is_supported()
            && push.is_permission_granted().await;

        if push_enabled {
            let payload = build_push_payload(&event, inner.config.push_icon.as_deref());
            let operation_id = format!("push:{}", event.id);
            let outcome = inner
                .deps
                .retry
                .execute_with_retry(
                    || {
                        let push = Arc::clone(push);
                        let payload = payload.clone();
                        async move {
                            match push.send_notification(&payload).await {
                                Ok(true) => Ok(()),
                                Ok(false) => Err(anyhow::anyhow!("Push delivery was not accepted")),
                                Err(e) => Err(e),
                            }
                        }
                    },
                    &inner.config.push_retry,
                    Some(&operation_id),
                )
                .await;

            match outcome.result {
                Ok(()) => {
                    results.push(DeliveryResult::delivered(event.id, DeliveryChannel::Push));
                    inner.stats.lock().delivered_push += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        event_id = %event.id,
                        attempts = outcome.attempts,
                        error = %e,
                        "Push delivery failed, falling back to in-app"
                    );
                    results.push(DeliveryResult::failed(event.id, DeliveryChannel::Push, e.to_string()));
                    last_error = Some(e);
                }
            }
        }

        let push_succeeded = results.iter().any(|r| r.success);
        if !push_succeeded && preferences.in_app_enabled {
            match inner.deps.in_app.dispatch(&event) {
                Ok(_) => {
                    results.push(DeliveryResult::delivered(event.id, DeliveryChannel::InApp));
                    inner.stats.lock().delivered_in_app += 1;
                }
                Err(e) => {
                    results.push(DeliveryResult::failed(event.id, DeliveryChannel::InApp, e.to_string()));
                    // Push is the primary channel; its failure is the one classified.
                    if last_error.is_none() {
                        last_error = Some(e.into());
                    }
                }
            }
        }

        if results.iter().any(|r| r.success) {
            record_history(&inner, &event).await;
            return results;
        }

        let Some(error) = last_error else {
            inner.stats.lock().undeliverable += 1;
            tracing::warn!(event_id = %event.id, area = %event.area, "No delivery channel available");
            return results;
        };

        inner.stats.lock().failed += 1;
        let context = serde_json::json!({
            "eventId": event.id,
            "area": event.area,
            "type": event.kind,
        });
        let classification = inner.deps.recovery.log_error(&error, Some(&context));

        if escalate_on_failure {
            if inner.config.auto_recover && classification.recoverable {
                let hooks = inner.hooks.lock().clone();
                if let Some(hooks) = hooks {
                    if let Some(option) = recovery_options(&error, &hooks).into_iter().next() {
                        tracing::info!(event_id = %event.id, option = option.label, "Attempting automatic recovery");
                        inner.deps.recovery.attempt_recovery(&error, &option.action).await;
                    }
                }
            }
            escalate(&inner, event);
        }

        results
    }
    .boxed()
}

async fn record_history(inner: &PipelineInner, event: &NotificationEvent) {
    let item = NewHistoryItem {
        area: event.area.clone(),
        kind: event.kind,
        message: event.message.clone(),
        read: false,
    };
    if let Err(e) = inner.deps.history.add_history_item(item).await {
        inner.deps.recovery.log_error(
            &e,
            Some(&serde_json::json!({ "stage": "history", "eventId": event.id })),
        );
    }
}

/// Hand a failed delivery to the standing failure queue.
fn escalate(inner: &Arc<PipelineInner>, event: NotificationEvent) {
    let weak = Arc::downgrade(inner);
    let operation_id = format!("delivery:{}", event.id);
    let event_id = event.id;

    inner.deps.retry.queue_failed_operation(
        move || {
            let weak = weak.clone();
            let event = event.clone();
            async move {
                let Some(inner) = weak.upgrade() else {
                    anyhow::bail!("pipeline shut down");
                };
                let Some(preferences) = inner.deps.preferences.get_preferences().await? else {
                    anyhow::bail!("no subscriber preferences");
                };
                if !preferences.follows(&event.area) {
                    tracing::debug!(event_id = %event.id, "Area no longer followed, dropping queued delivery");
                    return Ok(());
                }

                let results = deliver_event(inner, event, preferences, false).await;
                if results.iter().any(|r| r.success) {
                    return Ok(());
                }
                let reason = results
                    .iter()
                    .rev()
                    .find_map(|r| r.error.clone())
                    .unwrap_or_else(|| "no delivery channel available".to_string());
                Err(anyhow::anyhow!(reason))
            }
        },
        inner.config.requeue_retry.clone(),
        inner.config.requeue_priority,
        Some(operation_id),
    );

    inner.stats.lock().escalated += 1;
    tracing::warn!(event_id = %event_id, "Delivery failed on all channels, queued for retry");
}

struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}
