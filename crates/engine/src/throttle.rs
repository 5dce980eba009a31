//! Throttle, batch and debounce strategies for bursty notification streams.
//!
//! Items are grouped by `(area, type)`. The three strategies keep separate
//! buffers and timers:
//!
//! - **Throttle**: a bounded queue with one entry per group (last write wins).
//!   Each new item resets its group's timer; when any timer fires the whole
//!   queue is flushed in priority order and the other timers are dropped.
//! - **Batch**: items accumulate until `batch_size` (flushed synchronously) or
//!   until `batch_timeout` elapses after the first buffered item.
//! - **Debounce**: one pending item per group; only the last item seen within
//!   `debounce_delay` of quiet is emitted.
//!
//! Flushed items go to the handler passed at construction. The handler is
//! always called without internal locks held.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use snowline_common::error::AppError;
use snowline_common::timer::{KeyedTimers, ScheduledTask};
use snowline_common::types::{GroupKey, NotificationEvent, Priority};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThrottleConfig {
    pub throttle_delay: Duration,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub debounce_delay: Duration,
    pub max_queue_size: usize,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            throttle_delay: Duration::from_millis(1000),
            batch_size: 5,
            batch_timeout: Duration::from_millis(2000),
            debounce_delay: Duration::from_millis(500),
            max_queue_size: 50,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ThrottleOverrides {
    pub throttle_delay_ms: Option<u64>,
    pub batch_size: Option<usize>,
    pub batch_timeout_ms: Option<u64>,
    pub debounce_delay_ms: Option<u64>,
    pub max_queue_size: Option<usize>,
}

impl ThrottleConfig {
    pub fn with_overrides(mut self, overrides: &ThrottleOverrides) -> Self {
        if let Some(v) = overrides.throttle_delay_ms {
            self.throttle_delay = Duration::from_millis(v);
        }
        if let Some(v) = overrides.batch_size {
            self.batch_size = v;
        }
        if let Some(v) = overrides.batch_timeout_ms {
            self.batch_timeout = Duration::from_millis(v);
        }
        if let Some(v) = overrides.debounce_delay_ms {
            self.debounce_delay = Duration::from_millis(v);
        }
        if let Some(v) = overrides.max_queue_size {
            self.max_queue_size = v;
        }
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.batch_size == 0 {
            return Err(AppError::Config("batch_size must be at least 1".to_string()));
        }
        if self.max_queue_size == 0 {
            return Err(AppError::Config("max_queue_size must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// A notification waiting in one of the controller's buffers.
#[derive(Debug, Clone, PartialEq)]
pub struct ThrottledNotification {
    pub event: NotificationEvent,
    pub priority: Priority,
    pub queued_at: DateTime<Utc>,
}

impl ThrottledNotification {
    pub fn new(event: NotificationEvent, priority: Priority) -> Self {
        Self {
            event,
            priority,
            queued_at: Utc::now(),
        }
    }

    fn in_group(&self, key: &GroupKey) -> bool {
        self.event.kind == key.kind && self.event.area == key.area
    }
}

/// Which strategy produced a flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushKind {
    Throttle,
    Batch,
    Debounce,
}

pub type FlushHandler = Arc<dyn Fn(FlushKind, Vec<ThrottledNotification>) + Send + Sync>;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ThrottleStats {
    pub received: u64,
    /// Throttled items that replaced a queued item of the same group.
    pub coalesced: u64,
    /// Debounced items that replaced a pending item of the same group.
    pub superseded: u64,
    pub dropped_count: u64,
    pub flushes: u64,
    pub queued: usize,
    pub batched: usize,
    pub debouncing: usize,
}

/// Order high > normal > low; within a priority, newest first.
pub fn prioritize_notifications(mut items: Vec<ThrottledNotification>) -> Vec<ThrottledNotification> {
    items.sort_by(|a, b| {
        b.priority
            .rank()
            .cmp(&a.priority.rank())
            .then_with(|| b.event.timestamp.cmp(&a.event.timestamp))
    });
    items
}

#[derive(Default)]
struct ThrottleState {
    queue: VecDeque<ThrottledNotification>,
    throttle_timers: KeyedTimers<GroupKey>,
    batch: Vec<ThrottledNotification>,
    batch_timer: ScheduledTask,
    debounce_pending: HashMap<GroupKey, ThrottledNotification>,
    debounce_timers: KeyedTimers<GroupKey>,
    stats: ThrottleStats,
}

impl ThrottleState {
    /// Make room for one item: the oldest low-priority entry goes first,
    /// otherwise the oldest entry.
    fn evict_one(&mut self) -> Option<ThrottledNotification> {
        let position = self
            .queue
            .iter()
            .position(|q| q.priority == Priority::Low)
            .unwrap_or(0);
        let evicted = self.queue.remove(position)?;
        self.stats.dropped_count += 1;
        Some(evicted)
    }
}

struct ThrottleInner {
    config: ThrottleConfig,
    on_flush: FlushHandler,
    state: Mutex<ThrottleState>,
}

impl ThrottleInner {
    fn flush_throttle(&self, fired: &GroupKey, generation: u64) {
        let items: Vec<ThrottledNotification> = {
            let mut state = self.state.lock();
            // Superseded while waiting for the lock; the replacement timer flushes.
            if !state.throttle_timers.release(fired, generation) {
                return;
            }
            state.throttle_timers.cancel_all();
            if state.queue.is_empty() {
                return;
            }
            state.stats.flushes += 1;
            state.queue.drain(..).collect()
        };

        let items = prioritize_notifications(items);
        tracing::debug!(group = %fired, count = items.len(), "Throttle window elapsed, flushing");
        (self.on_flush)(FlushKind::Throttle, items);
    }

    fn flush_batch(&self, generation: u64) {
        let items = {
            let mut state = self.state.lock();
            if !state.batch_timer.release(generation) || state.batch.is_empty() {
                return;
            }
            state.stats.flushes += 1;
            std::mem::take(&mut state.batch)
        };

        tracing::debug!(count = items.len(), "Batch timeout elapsed, flushing");
        (self.on_flush)(FlushKind::Batch, items);
    }

    fn flush_debounce(&self, key: &GroupKey, generation: u64) {
        let item = {
            let mut state = self.state.lock();
            if !state.debounce_timers.release(key, generation) {
                return;
            }
            let Some(item) = state.debounce_pending.remove(key) else {
                return;
            };
            state.stats.flushes += 1;
            item
        };

        tracing::debug!(group = %key, "Debounce period elapsed");
        (self.on_flush)(FlushKind::Debounce, vec![item]);
    }
}

/// Burst controller. Dropping the last clone cancels all pending timers.
#[derive(Clone)]
pub struct NotificationThrottler {
    inner: Arc<ThrottleInner>,
}

impl NotificationThrottler {
    pub fn new(config: ThrottleConfig, on_flush: FlushHandler) -> Result<Self, AppError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(ThrottleInner {
                config,
                on_flush,
                state: Mutex::new(ThrottleState::default()),
            }),
        })
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.inner.config
    }

    pub fn throttle_notification(&self, item: ThrottledNotification) {
        let key = item.event.group_key();
        let mut state = self.inner.state.lock();
        state.stats.received += 1;

        if let Some(slot) = state.queue.iter_mut().find(|q| q.in_group(&key)) {
            *slot = item;
            state.stats.coalesced += 1;
        } else {
            if state.queue.len() >= self.inner.config.max_queue_size {
                if let Some(evicted) = state.evict_one() {
                    tracing::warn!(
                        group = %evicted.event.group_key(),
                        priority = %evicted.priority,
                        dropped = state.stats.dropped_count,
                        "Throttle queue full, dropped notification"
                    );
                }
            }
            state.queue.push_back(item);
        }

        let weak = Arc::downgrade(&self.inner);
        let fired = key.clone();
        state.throttle_timers.schedule(key, self.inner.config.throttle_delay, move |generation| async move {
            if let Some(inner) = Weak::upgrade(&weak) {
                inner.flush_throttle(&fired, generation);
            }
        });
    }

    pub fn batch_notification(&self, item: ThrottledNotification) {
        let ready = {
            let mut state = self.inner.state.lock();
            state.stats.received += 1;
            state.batch.push(item);

            if state.batch.len() >= self.inner.config.batch_size {
                state.batch_timer.cancel();
                state.stats.flushes += 1;
                Some(std::mem::take(&mut state.batch))
            } else {
                if !state.batch_timer.is_pending() {
                    let weak = Arc::downgrade(&self.inner);
                    state.batch_timer.schedule(self.inner.config.batch_timeout, move |generation| async move {
                        if let Some(inner) = Weak::upgrade(&weak) {
                            inner.flush_batch(generation);
                        }
                    });
                }
                None
            }
        };

        if let Some(items) = ready {
            tracing::debug!(count = items.len(), "Batch full, flushing");
            (self.inner.on_flush)(FlushKind::Batch, items);
        }
    }

    pub fn debounce_notification(&self, item: ThrottledNotification) {
        let key = item.event.group_key();
        let mut state = self.inner.state.lock();
        state.stats.received += 1;
        if state.debounce_pending.insert(key.clone(), item).is_some() {
            state.stats.superseded += 1;
        }

        let weak = Arc::downgrade(&self.inner);
        let fired = key.clone();
        state.debounce_timers.schedule(key, self.inner.config.debounce_delay, move |generation| async move {
            if let Some(inner) = Weak::upgrade(&weak) {
                inner.flush_debounce(&fired, generation);
            }
        });
    }

    /// Cancel every timer and discard buffered items. Returns how many were discarded.
    pub fn dispose(&self) -> usize {
        let mut state = self.inner.state.lock();
        state.throttle_timers.cancel_all();
        state.debounce_timers.cancel_all();
        state.batch_timer.cancel();

        let discarded = state.queue.len() + state.batch.len() + state.debounce_pending.len();
        state.queue.clear();
        state.batch.clear();
        state.debounce_pending.clear();

        if discarded > 0 {
            tracing::info!(discarded, "Throttler disposed with buffered notifications");
        }
        discarded
    }

    pub fn stats(&self) -> ThrottleStats {
        let state = self.inner.state.lock();
        ThrottleStats {
            queued: state.queue.len(),
            batched: state.batch.len(),
            debouncing: state.debounce_pending.len(),
            ..state.stats.clone()
        }
    }
}
