//! Retry engine: exponential backoff with jitter, plus a standing failure queue.
//!
//! `execute_with_retry` runs an operation up to `max_retries + 1` times in a
//! single call, sleeping between attempts. The failure queue is different: it
//! holds operations that already failed and attempts each at most once per
//! `process_queue` call, so the queue itself is the retry loop and is driven by
//! periodic external scheduling (see `run_queue_processor`).
//!
//! Queue entries are kept sorted by ascending priority (lower = more urgent),
//! ties in insertion order.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use snowline_common::error::AppError;

/// Default number of queued operations attempted concurrently.
const DEFAULT_BATCH_WIDTH: usize = 5;

/// Shortest interval `run_queue_processor` will tick at.
const MIN_PROCESS_INTERVAL: Duration = Duration::from_millis(100);

/// Priority used for escalated deliveries.
pub const PRIORITY_HIGH: u32 = 1;
pub const PRIORITY_NORMAL: u32 = 5;
pub const PRIORITY_LOW: u32 = 10;

/// Backoff parameters for one operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryConfig {
    /// Additional attempts after the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Jitter band as a fraction of the delay, in `[0, 1]`.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(30_000),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

/// Partial `RetryConfig`; unset fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RetryOverrides {
    pub max_retries: Option<u32>,
    pub base_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub jitter_factor: Option<f64>,
}

impl RetryConfig {
    pub fn with_overrides(mut self, overrides: &RetryOverrides) -> Self {
        if let Some(v) = overrides.max_retries {
            self.max_retries = v;
        }
        if let Some(v) = overrides.base_delay_ms {
            self.base_delay = Duration::from_millis(v);
        }
        if let Some(v) = overrides.max_delay_ms {
            self.max_delay = Duration::from_millis(v);
        }
        if let Some(v) = overrides.backoff_multiplier {
            self.backoff_multiplier = v;
        }
        if let Some(v) = overrides.jitter_factor {
            self.jitter_factor = v;
        }
        self
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(AppError::Config(format!(
                "jitter_factor must be within [0, 1], got {}",
                self.jitter_factor
            )));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(AppError::Config(format!(
                "backoff_multiplier must be >= 1, got {}",
                self.backoff_multiplier
            )));
        }
        if self.base_delay > self.max_delay {
            return Err(AppError::Config(
                "base_delay must not exceed max_delay".to_string(),
            ));
        }
        Ok(())
    }

    /// Un-jittered delay after attempt `attempt` (0-indexed):
    /// `clamp(base * multiplier^attempt, 0, max)`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let max_ms = self.max_delay.as_secs_f64() * 1000.0;
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw_ms = self.base_delay.as_secs_f64() * 1000.0 * self.backoff_multiplier.powi(exp);
        let capped = if raw_ms.is_finite() {
            raw_ms.clamp(0.0, max_ms)
        } else {
            max_ms
        };
        Duration::from_secs_f64(capped / 1000.0)
    }

    /// Backoff delay with `±jitter_factor` randomization, floored at zero.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.backoff_delay(attempt).as_secs_f64();
        if self.jitter_factor <= 0.0 || delay == 0.0 {
            return Duration::from_secs_f64(delay);
        }
        let spread: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
        let jittered = delay + delay * self.jitter_factor * spread;
        Duration::from_secs_f64(jittered.max(0.0))
    }
}

/// Outcome of `execute_with_retry`. Failure is returned, never raised.
#[derive(Debug)]
pub struct RetryResult<T> {
    pub result: anyhow::Result<T>,
    pub attempts: u32,
    pub total_duration: Duration,
}

impl<T> RetryResult<T> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn error_message(&self) -> Option<String> {
        self.result.as_ref().err().map(|e| e.to_string())
    }
}

/// Failure bookkeeping for a queued operation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FailureTracker {
    pub failure_count: u32,
    pub first_failure_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub failure_reasons: Vec<String>,
    #[serde(skip)]
    pub next_retry_at: Option<Instant>,
}

impl FailureTracker {
    fn record(&mut self, reason: String) {
        let now = Utc::now();
        self.failure_count += 1;
        self.first_failure_at.get_or_insert(now);
        self.last_failure_at = Some(now);
        self.failure_reasons.push(reason);
    }

    fn is_ready(&self, now: Instant) -> bool {
        self.next_retry_at.is_none_or(|at| at <= now)
    }
}

pub type QueuedOperation = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct QueueItem {
    id: String,
    operation: QueuedOperation,
    config: RetryConfig,
    tracker: FailureTracker,
    created_at: DateTime<Utc>,
    priority: u32,
}

/// Read-only view of a queued operation.
#[derive(Debug, Clone, Serialize)]
pub struct QueuedItemInfo {
    pub id: String,
    pub priority: u32,
    pub created_at: DateTime<Utc>,
    pub tracker: FailureTracker,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryStats {
    /// `execute_with_retry` calls.
    pub executions: u64,
    /// Operations ever placed on the failure queue.
    pub queued_total: u64,
    /// Queued operations that eventually succeeded.
    pub succeeded: u64,
    /// Queued operations dropped after exhausting their retries.
    pub failed: u64,
    /// Operations currently queued.
    pub pending: usize,
}

/// Summary of one `process_queue` run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueRunReport {
    /// True when another run was already in progress and this call did nothing.
    pub skipped: bool,
    pub attempted: usize,
    pub succeeded: usize,
    pub rescheduled: usize,
    pub exhausted: usize,
}

enum ItemOutcome {
    Succeeded,
    Rescheduled,
    Exhausted,
    Gone,
}

/// Retry engine shared by the pipeline and recovery hooks.
pub struct RetryEngine {
    queue: Mutex<Vec<QueueItem>>,
    processing: AtomicBool,
    stats: Mutex<RetryStats>,
    batch_width: usize,
}

impl RetryEngine {
    pub fn new() -> Self {
        Self::with_batch_width(DEFAULT_BATCH_WIDTH)
    }

    pub fn with_batch_width(batch_width: usize) -> Self {
        Self {
            queue: Mutex::new(Vec::new()),
            processing: AtomicBool::new(false),
            stats: Mutex::new(RetryStats::default()),
            batch_width: batch_width.max(1),
        }
    }

    /// Run `operation` until it succeeds or `config.max_retries` extra attempts
    /// have failed. Attempts are strictly sequential.
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        mut operation: F,
        config: &RetryConfig,
        id: Option<&str>,
    ) -> RetryResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        self.stats.lock().executions += 1;

        let id = id.unwrap_or("anonymous");
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            let outcome = operation().await;
            attempt += 1;

            match outcome {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(operation_id = id, attempts = attempt, "Operation succeeded after retry");
                    }
                    return RetryResult {
                        result: Ok(value),
                        attempts: attempt,
                        total_duration: started.elapsed(),
                    };
                }
                Err(e) if attempt > config.max_retries => {
                    tracing::warn!(
                        operation_id = id,
                        attempts = attempt,
                        error = %e,
                        "Operation failed after exhausting retries"
                    );
                    return RetryResult {
                        result: Err(e),
                        attempts: attempt,
                        total_duration: started.elapsed(),
                    };
                }
                Err(e) => {
                    let delay = config.jittered_delay(attempt - 1);
                    tracing::debug!(
                        operation_id = id,
                        attempt,
                        max_retries = config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Put an operation on the standing failure queue. It is not run now.
    ///
    /// Returns the item id. Queuing an id that is already present is a no-op.
    pub fn queue_failed_operation<F, Fut>(
        &self,
        operation: F,
        config: RetryConfig,
        priority: u32,
        id: Option<String>,
    ) -> String
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = id.unwrap_or_else(|| format!("op-{}", Uuid::new_v4()));
        let operation: QueuedOperation = Arc::new(move || operation().boxed());

        let mut queue = self.queue.lock();
        if queue.iter().any(|item| item.id == id) {
            tracing::debug!(operation_id = %id, "Operation already queued");
            return id;
        }

        let position = queue
            .iter()
            .position(|item| item.priority > priority)
            .unwrap_or(queue.len());
        queue.insert(
            position,
            QueueItem {
                id: id.clone(),
                operation,
                config,
                tracker: FailureTracker::default(),
                created_at: Utc::now(),
                priority,
            },
        );
        let pending = queue.len();
        drop(queue);

        let mut stats = self.stats.lock();
        stats.queued_total += 1;
        stats.pending = pending;

        tracing::info!(operation_id = %id, priority, pending, "Operation queued for retry");
        id
    }

    /// Attempt every ready queued operation once, `batch_width` at a time.
    ///
    /// A call made while another run is in progress returns immediately with
    /// `skipped = true`.
    pub async fn process_queue(&self) -> QueueRunReport {
        if self.processing.swap(true, Ordering::AcqRel) {
            tracing::debug!("Failure queue already being processed");
            return QueueRunReport {
                skipped: true,
                ..Default::default()
            };
        }
        let _guard = ProcessingGuard(&self.processing);

        let now = Instant::now();
        let ready: Vec<(String, QueuedOperation)> = self
            .queue
            .lock()
            .iter()
            .filter(|item| item.tracker.is_ready(now))
            .map(|item| (item.id.clone(), Arc::clone(&item.operation)))
            .collect();

        let mut report = QueueRunReport::default();
        if ready.is_empty() {
            return report;
        }

        tracing::debug!(ready = ready.len(), "Processing failure queue");

        for chunk in ready.chunks(self.batch_width) {
            let outcomes = join_all(chunk.iter().map(|(id, operation)| async move {
                let outcome = match AssertUnwindSafe(operation()).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow::anyhow!("queued operation panicked")),
                };
                self.record_outcome(id, outcome)
            }))
            .await;

            for outcome in outcomes {
                match outcome {
                    ItemOutcome::Succeeded => report.succeeded += 1,
                    ItemOutcome::Rescheduled => report.rescheduled += 1,
                    ItemOutcome::Exhausted => report.exhausted += 1,
                    ItemOutcome::Gone => continue,
                }
                report.attempted += 1;
            }
        }

        report
    }

    fn record_outcome(&self, id: &str, outcome: anyhow::Result<()>) -> ItemOutcome {
        let mut queue = self.queue.lock();
        let Some(index) = queue.iter().position(|item| item.id == id) else {
            return ItemOutcome::Gone;
        };

        let result = match outcome {
            Ok(()) => {
                let item = queue.remove(index);
                tracing::info!(
                    operation_id = %item.id,
                    failures = item.tracker.failure_count,
                    "Queued operation succeeded"
                );
                self.stats.lock().succeeded += 1;
                ItemOutcome::Succeeded
            }
            Err(e) => {
                let item = &mut queue[index];
                item.tracker.record(e.to_string());

                if item.tracker.failure_count >= item.config.max_retries {
                    let item = queue.remove(index);
                    tracing::error!(
                        operation_id = %item.id,
                        failures = item.tracker.failure_count,
                        reasons = ?item.tracker.failure_reasons,
                        "Queued operation exhausted its retries"
                    );
                    self.stats.lock().failed += 1;
                    ItemOutcome::Exhausted
                } else {
                    let delay = item.config.jittered_delay(item.tracker.failure_count);
                    item.tracker.next_retry_at = Some(Instant::now() + delay);
                    tracing::warn!(
                        operation_id = %item.id,
                        failures = item.tracker.failure_count,
                        max_retries = item.config.max_retries,
                        next_retry_ms = delay.as_millis() as u64,
                        error = %e,
                        "Queued operation failed, rescheduled"
                    );
                    ItemOutcome::Rescheduled
                }
            }
        };

        self.stats.lock().pending = queue.len();
        result
    }

    /// Drive `process_queue` forever on a fixed interval.
    pub async fn run_queue_processor(self: Arc<Self>, every: Duration) {
        if every < MIN_PROCESS_INTERVAL {
            tracing::warn!(
                requested_ms = every.as_millis() as u64,
                min_ms = MIN_PROCESS_INTERVAL.as_millis() as u64,
                "Queue processor interval too short, using minimum"
            );
        }
        let every = every.max(MIN_PROCESS_INTERVAL);
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(interval_ms = every.as_millis() as u64, "Failure queue processor started");
        loop {
            ticker.tick().await;
            let report = self.process_queue().await;
            if report.attempted > 0 {
                tracing::info!(
                    attempted = report.attempted,
                    succeeded = report.succeeded,
                    rescheduled = report.rescheduled,
                    exhausted = report.exhausted,
                    "Failure queue pass complete"
                );
            }
        }
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut queue = self.queue.lock();
        let before = queue.len();
        queue.retain(|item| item.id != id);
        let removed = queue.len() != before;
        self.stats.lock().pending = queue.len();
        removed
    }

    /// Drop every queued operation. Returns how many were dropped.
    pub fn clear_queue(&self) -> usize {
        let mut queue = self.queue.lock();
        let dropped = queue.len();
        queue.clear();
        self.stats.lock().pending = 0;
        dropped
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Queue contents in processing order.
    pub fn queue_snapshot(&self) -> Vec<QueuedItemInfo> {
        self.queue
            .lock()
            .iter()
            .map(|item| QueuedItemInfo {
                id: item.id.clone(),
                priority: item.priority,
                created_at: item.created_at,
                tracker: item.tracker.clone(),
            })
            .collect()
    }

    pub fn stats(&self) -> RetryStats {
        self.stats.lock().clone()
    }
}

impl Default for RetryEngine {
    fn default() -> Self {
        Self::new()
    }
}

struct ProcessingGuard<'a>(&'a AtomicBool);

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn test_backoff_delay_grows_and_caps() {
        let config = fast_config(5);
        assert_eq!(config.backoff_delay(0), Duration::from_millis(100));
        assert_eq!(config.backoff_delay(1), Duration::from_millis(200));
        assert_eq!(config.backoff_delay(3), Duration::from_millis(800));
        assert_eq!(config.backoff_delay(4), Duration::from_millis(1000));
        assert_eq!(config.backoff_delay(500), Duration::from_millis(1000));
    }

    #[test]
    fn test_jittered_delay_stays_in_band() {
        let config = RetryConfig {
            jitter_factor: 0.5,
            ..fast_config(5)
        };
        for attempt in 0..6 {
            let base = config.backoff_delay(attempt).as_secs_f64();
            for _ in 0..50 {
                let d = config.jittered_delay(attempt).as_secs_f64();
                assert!(d >= base * 0.5 - 1e-9, "delay {} below band", d);
                assert!(d <= base * 1.5 + 1e-9, "delay {} above band", d);
            }
        }
    }

    #[test]
    fn test_overrides_and_validation() {
        let config = RetryConfig::default().with_overrides(&RetryOverrides {
            max_retries: Some(7),
            jitter_factor: Some(0.3),
            ..Default::default()
        });
        assert_eq!(config.max_retries, 7);
        assert!((config.jitter_factor - 0.3).abs() < f64::EPSILON);
        assert_eq!(config.base_delay, Duration::from_millis(1000));
        assert!(config.validate().is_ok());

        let bad = config.with_overrides(&RetryOverrides {
            jitter_factor: Some(1.5),
            ..Default::default()
        });
        assert!(bad.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_invoked_max_retries_plus_one() {
        let engine = RetryEngine::new();
        let config = RetryConfig {
            jitter_factor: 0.25,
            ..fast_config(3)
        };
        let calls = Arc::new(Mutex::new(Vec::new()));

        let c = calls.clone();
        let result: RetryResult<()> = engine
            .execute_with_retry(
                || {
                    c.lock().push(Instant::now());
                    async { Err(anyhow::anyhow!("Failed to fetch")) }
                },
                &config,
                Some("always-fails"),
            )
            .await;

        assert!(!result.is_success());
        assert_eq!(result.attempts, 4);
        assert_eq!(result.error_message().as_deref(), Some("Failed to fetch"));

        let calls = calls.lock();
        assert_eq!(calls.len(), 4);
        for (k, pair) in calls.windows(2).enumerate() {
            let gap = pair[1] - pair[0];
            let upper = config.backoff_delay(k as u32).mul_f64(1.0 + config.jitter_factor);
            assert!(gap <= upper + Duration::from_millis(1), "gap {:?} > {:?}", gap, upper);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_transient_failures() {
        let engine = RetryEngine::new();
        let attempts = Arc::new(AtomicU32::new(0));

        let a = attempts.clone();
        let result = engine
            .execute_with_retry(
                move || {
                    let a = a.clone();
                    async move {
                        if a.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err(anyhow::anyhow!("timeout"))
                        } else {
                            Ok(42)
                        }
                    }
                },
                &fast_config(5),
                None,
            )
            .await;

        assert_eq!(result.attempts, 3);
        assert_eq!(result.result.unwrap(), 42);
        assert_eq!(engine.stats().executions, 1);
    }

    #[tokio::test]
    async fn test_zero_retries_runs_once() {
        let engine = RetryEngine::new();
        let result: RetryResult<()> = engine
            .execute_with_retry(|| async { Err(anyhow::anyhow!("nope")) }, &fast_config(0), None)
            .await;
        assert_eq!(result.attempts, 1);
    }

    #[test]
    fn test_queue_sorted_by_priority_with_stable_ties() {
        let engine = RetryEngine::new();
        for (id, priority) in [("a", 5), ("b", 1), ("c", 10), ("d", 5), ("e", 1), ("f", 0)] {
            engine.queue_failed_operation(
                || async { Ok(()) },
                fast_config(3),
                priority,
                Some(id.to_string()),
            );
        }

        let snapshot = engine.queue_snapshot();
        let priorities: Vec<u32> = snapshot.iter().map(|i| i.priority).collect();
        assert!(priorities.windows(2).all(|w| w[0] <= w[1]));

        let ids: Vec<&str> = snapshot.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["f", "b", "e", "a", "d", "c"]);
    }

    #[test]
    fn test_queue_duplicate_id_is_ignored() {
        let engine = RetryEngine::new();
        let first = engine.queue_failed_operation(|| async { Ok(()) }, fast_config(3), 1, Some("x".into()));
        let second = engine.queue_failed_operation(|| async { Ok(()) }, fast_config(3), 1, Some("x".into()));
        assert_eq!(first, second);
        assert_eq!(engine.queue_len(), 1);
    }

    #[tokio::test]
    async fn test_process_queue_removes_successes() {
        let engine = RetryEngine::new();
        engine.queue_failed_operation(|| async { Ok(()) }, fast_config(3), 1, None);
        engine.queue_failed_operation(|| async { Ok(()) }, fast_config(3), 2, None);

        let report = engine.process_queue().await;
        assert_eq!(report.attempted, 2);
        assert_eq!(report.succeeded, 2);
        assert_eq!(engine.queue_len(), 0);
        assert_eq!(engine.stats().succeeded, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_processor_survives_zero_interval() {
        let engine = Arc::new(RetryEngine::new());
        engine.queue_failed_operation(|| async { Ok(()) }, fast_config(3), 1, None);

        let processor = tokio::spawn(engine.clone().run_queue_processor(Duration::ZERO));
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert!(!processor.is_finished());
        assert_eq!(engine.queue_len(), 0);
        processor.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_process_queue_attempts_once_per_call_until_exhausted() {
        let engine = RetryEngine::new();
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        engine.queue_failed_operation(
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow::anyhow!("storage quota exceeded")) }
            },
            fast_config(3),
            PRIORITY_HIGH,
            Some("flaky".into()),
        );

        let report = engine.process_queue().await;
        assert_eq!(report.rescheduled, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Not ready yet: next_retry_at lies in the future.
        let report = engine.process_queue().await;
        assert_eq!(report.attempted, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let info = &engine.queue_snapshot()[0];
        assert_eq!(info.tracker.failure_count, 1);
        assert!(info.tracker.next_retry_at.is_some());

        tokio::time::sleep(Duration::from_secs(5)).await;
        engine.process_queue().await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        let report = engine.process_queue().await;

        assert_eq!(report.exhausted, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(engine.queue_len(), 0);
        assert_eq!(engine.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_reentrant_process_queue_is_noop() {
        let engine = Arc::new(RetryEngine::new());
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let release_rx = Arc::new(Mutex::new(Some(release_rx)));

        engine.queue_failed_operation(
            move || {
                let rx = release_rx.lock().take();
                async move {
                    if let Some(rx) = rx {
                        let _ = rx.await;
                    }
                    Ok(())
                }
            },
            fast_config(3),
            1,
            None,
        );

        let running = tokio::spawn({
            let engine = engine.clone();
            async move { engine.process_queue().await }
        });
        while !engine.is_processing() {
            tokio::task::yield_now().await;
        }

        let nested = engine.process_queue().await;
        assert!(nested.skipped);

        release_tx.send(()).unwrap();
        let first = running.await.unwrap();
        assert_eq!(first.succeeded, 1);
        assert!(!engine.is_processing());
    }

    fn explode() -> anyhow::Result<()> {
        panic!("boom")
    }

    #[tokio::test]
    async fn test_panicking_operation_counts_as_failure() {
        let engine = RetryEngine::new();
        engine.queue_failed_operation(
            || async { explode() },
            fast_config(1),
            1,
            Some("panics".into()),
        );

        let report = engine.process_queue().await;
        assert_eq!(report.exhausted, 1);
        assert!(!engine.is_processing());
    }

    #[tokio::test]
    async fn test_bounded_fan_out() {
        let engine = RetryEngine::with_batch_width(2);
        let in_flight = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        for _ in 0..6 {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            engine.queue_failed_operation(
                move || {
                    let in_flight = in_flight.clone();
                    let peak = peak.clone();
                    async move {
                        let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    }
                },
                fast_config(3),
                PRIORITY_NORMAL,
                None,
            );
        }

        let report = engine.process_queue().await;
        assert_eq!(report.succeeded, 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }
}
