//! Delivered-notification history, newest first, capped at the most recent entries.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::AppError;
use crate::store::KeyValueStore;
use crate::types::{HistoryItem, NewHistoryItem};

/// Maximum number of history entries kept.
pub const HISTORY_LIMIT: usize = 50;

#[derive(Clone)]
pub struct HistoryStore {
    store: Arc<dyn KeyValueStore>,
    key: String,
    limit: usize,
    /// Serializes read-modify-write cycles.
    write_lock: Arc<Mutex<()>>,
}

impl HistoryStore {
    pub fn new(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            limit: HISTORY_LIMIT,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    /// All entries, newest first.
    pub async fn list(&self) -> Result<Vec<HistoryItem>, AppError> {
        match self.store.get(&self.key).await? {
            Some(raw) => serde_json::from_str(&raw).map_err(|e| {
                AppError::Storage(format!("invalid stored history under '{}': {}", self.key, e))
            }),
            None => Ok(Vec::new()),
        }
    }

    /// Prepend a new entry and drop the oldest ones past the limit.
    pub async fn add_history_item(&self, item: NewHistoryItem) -> Result<HistoryItem, AppError> {
        let _guard = self.write_lock.lock().await;

        let entry = HistoryItem {
            id: Uuid::new_v4(),
            area: item.area,
            kind: item.kind,
            message: item.message,
            read: item.read,
            timestamp: Utc::now(),
        };

        let mut items = self.list().await?;
        items.insert(0, entry.clone());
        items.truncate(self.limit);
        self.persist(&items).await?;

        Ok(entry)
    }

    pub async fn unread_count(&self) -> Result<usize, AppError> {
        Ok(self.list().await?.iter().filter(|i| !i.read).count())
    }

    pub async fn mark_all_read(&self) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        let mut items = self.list().await?;
        for item in &mut items {
            item.read = true;
        }
        self.persist(&items).await
    }

    pub async fn clear(&self) -> Result<(), AppError> {
        let _guard = self.write_lock.lock().await;
        self.store.remove(&self.key).await
    }

    async fn persist(&self, items: &[HistoryItem]) -> Result<(), AppError> {
        let raw = serde_json::to_string(items)?;
        self.store.set(&self.key, &raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::NotificationKind;

    fn make_history() -> HistoryStore {
        HistoryStore::new(Arc::new(MemoryStore::new()), "history")
    }

    fn make_item(n: usize) -> NewHistoryItem {
        NewHistoryItem {
            area: "Kallio".to_string(),
            kind: NotificationKind::Start,
            message: format!("message {}", n),
            read: false,
        }
    }

    #[tokio::test]
    async fn test_newest_first() {
        let history = make_history();
        history.add_history_item(make_item(1)).await.unwrap();
        history.add_history_item(make_item(2)).await.unwrap();

        let items = history.list().await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].message, "message 2");
        assert_eq!(items[1].message, "message 1");
    }

    #[tokio::test]
    async fn test_capped_at_fifty_oldest_evicted() {
        let history = make_history();
        for n in 0..51 {
            history.add_history_item(make_item(n)).await.unwrap();
        }

        let items = history.list().await.unwrap();
        assert_eq!(items.len(), 50);
        assert_eq!(items[0].message, "message 50");
        assert_eq!(items[49].message, "message 1");
        assert!(items.iter().all(|i| i.message != "message 0"));
    }

    #[tokio::test]
    async fn test_mark_all_read() {
        let history = make_history();
        history.add_history_item(make_item(1)).await.unwrap();
        history.add_history_item(make_item(2)).await.unwrap();
        assert_eq!(history.unread_count().await.unwrap(), 2);

        history.mark_all_read().await.unwrap();
        assert_eq!(history.unread_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_adds_are_not_lost() {
        let history = make_history();
        let mut handles = Vec::new();
        for n in 0..10 {
            let h = history.clone();
            handles.push(tokio::spawn(async move { h.add_history_item(make_item(n)).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(history.list().await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_clear() {
        let history = make_history();
        history.add_history_item(make_item(1)).await.unwrap();
        history.clear().await.unwrap();
        assert!(history.list().await.unwrap().is_empty());
    }
}
