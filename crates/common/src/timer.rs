//! Cancel-and-reschedule timers.
//!
//! Scheduling onto an occupied slot aborts the previous task first, so there
//! is never more than one pending timer per slot (or per key).
//!
//! Every scheduled task is handed a generation number. A task that has already
//! woken up cannot be aborted, so it passes its generation to `release` and
//! only proceeds when it is still the slot's current task.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;

use tokio::task::JoinHandle;

/// A single replaceable delayed task.
#[derive(Debug, Default)]
pub struct ScheduledTask {
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl ScheduledTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run the task built by `make_task` after `delay`, cancelling whatever was
    /// scheduled before. The task receives its generation number.
    pub fn schedule<T, F>(&mut self, delay: Duration, make_task: T) -> u64
    where
        T: FnOnce(u64) -> F,
        F: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        self.generation += 1;
        self.handle = Some(spawn_delayed(delay, make_task(self.generation)));
        self.generation
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Drop the handle without aborting; used by a task that is already running.
    ///
    /// Returns false, leaving the slot untouched, when `generation` has been
    /// replaced or cancelled since the task was scheduled.
    pub fn release(&mut self, generation: u64) -> bool {
        if generation != self.generation || self.handle.is_none() {
            return false;
        }
        self.handle = None;
        true
    }

    pub fn is_pending(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// One replaceable delayed task per key.
#[derive(Debug)]
pub struct KeyedTimers<K> {
    tasks: HashMap<K, (u64, JoinHandle<()>)>,
    next_generation: u64,
}

impl<K: Eq + Hash> KeyedTimers<K> {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Schedule the task built by `make_task` for `key`, replacing any timer
    /// already pending for it. The task receives its generation number.
    pub fn schedule<T, F>(&mut self, key: K, delay: Duration, make_task: T) -> u64
    where
        T: FnOnce(u64) -> F,
        F: Future<Output = ()> + Send + 'static,
    {
        self.next_generation += 1;
        let generation = self.next_generation;
        let handle = spawn_delayed(delay, make_task(generation));
        if let Some((_, previous)) = self.tasks.insert(key, (generation, handle)) {
            previous.abort();
        }
        generation
    }

    pub fn cancel(&mut self, key: &K) -> bool {
        match self.tasks.remove(key) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Forget a key's handle without aborting it, if `generation` is still the
    /// key's current timer. Returns false when it was replaced or cancelled.
    pub fn release(&mut self, key: &K, generation: u64) -> bool {
        match self.tasks.get(key) {
            Some((current, _)) if *current == generation => {
                self.tasks.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, (_, handle)) in self.tasks.drain() {
            handle.abort();
        }
    }

    /// Number of timers that have not fired yet.
    pub fn pending(&self) -> usize {
        self.tasks.values().filter(|(_, h)| !h.is_finished()).count()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.tasks.contains_key(key)
    }
}

impl<K: Eq + Hash> Default for KeyedTimers<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Drop for KeyedTimers<K> {
    fn drop(&mut self) {
        for (_, (_, handle)) in self.tasks.drain() {
            handle.abort();
        }
    }
}

fn spawn_delayed<F>(delay: Duration, task: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        task.await;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_reschedule_replaces_pending_task() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut slot = ScheduledTask::new();

        for _ in 0..3 {
            let fired = fired.clone();
            slot.schedule(Duration::from_millis(100), move |_| async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(slot.is_pending());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!slot.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_prevents_fire() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut slot = ScheduledTask::new();
        let f = fired.clone();
        slot.schedule(Duration::from_millis(10), move |_| async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        slot.cancel();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keyed_timers_are_independent() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut timers = KeyedTimers::new();

        for key in ["a", "b", "a"] {
            let f = fired.clone();
            timers.schedule(key, Duration::from_millis(100), move |_| async move {
                f.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(timers.pending(), 2);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(timers.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keyed_cancel() {
        let fired = Arc::new(AtomicU32::new(0));
        let mut timers = KeyedTimers::new();
        let f = fired.clone();
        timers.schedule(1u8, Duration::from_millis(10), move |_| async move {
            f.fetch_add(1, Ordering::SeqCst);
        });

        assert!(timers.cancel(&1));
        assert!(!timers.cancel(&1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_cannot_release_replacement() {
        let mut timers = KeyedTimers::new();
        let first = timers.schedule("area:start", Duration::from_millis(100), |_| async {});
        let second = timers.schedule("area:start", Duration::from_millis(100), |_| async {});
        assert_ne!(first, second);

        // A task that woke up before being replaced must not drop the new handle.
        assert!(!timers.release(&"area:start", first));
        assert!(timers.contains(&"area:start"));
        assert!(timers.release(&"area:start", second));
        assert!(!timers.contains(&"area:start"));

        let mut slot = ScheduledTask::new();
        let old = slot.schedule(Duration::from_millis(100), |_| async {});
        let current = slot.schedule(Duration::from_millis(100), |_| async {});
        assert!(!slot.release(old));
        assert!(slot.is_pending());
        assert!(slot.release(current));
        assert!(!slot.is_pending());
    }
}
