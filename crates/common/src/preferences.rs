//! Subscriber preferences persisted as one flat record under a fixed key.

use std::sync::Arc;

use chrono::Utc;

use crate::error::AppError;
use crate::store::KeyValueStore;
use crate::types::SubscriberPreferences;

#[derive(Clone)]
pub struct PreferencesStore {
    store: Arc<dyn KeyValueStore>,
    key: String,
}

impl PreferencesStore {
    pub fn new(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
        }
    }

    /// Load the stored preferences. `None` when nothing was ever saved.
    ///
    /// A record that no longer parses is bad local state and is reported as
    /// a configuration error so it can be fixed by a reset.
    pub async fn get_preferences(&self) -> Result<Option<SubscriberPreferences>, AppError> {
        let Some(raw) = self.store.get(&self.key).await? else {
            return Ok(None);
        };

        serde_json::from_str(&raw).map(Some).map_err(|e| {
            AppError::Config(format!("invalid stored preferences under '{}': {}", self.key, e))
        })
    }

    /// Persist preferences, stamping `last_updated`.
    pub async fn save_preferences(
        &self,
        preferences: &SubscriberPreferences,
    ) -> Result<SubscriberPreferences, AppError> {
        let mut stamped = preferences.clone();
        stamped.last_updated = Utc::now();

        let raw = serde_json::to_string(&stamped)?;
        self.store.set(&self.key, &raw).await?;

        tracing::debug!(
            areas = stamped.subscribed_areas.len(),
            push = stamped.push_enabled,
            in_app = stamped.in_app_enabled,
            "Preferences saved"
        );
        Ok(stamped)
    }

    pub async fn clear(&self) -> Result<(), AppError> {
        self.store.remove(&self.key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn make_store() -> (Arc<MemoryStore>, PreferencesStore) {
        let kv = Arc::new(MemoryStore::new());
        let prefs = PreferencesStore::new(kv.clone(), "prefs");
        (kv, prefs)
    }

    #[tokio::test]
    async fn test_missing_preferences_is_none() {
        let (_, prefs) = make_store();
        assert!(prefs.get_preferences().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (_, prefs) = make_store();
        let saved = prefs
            .save_preferences(&SubscriberPreferences::new(["Kallio", "Vallila"], true, true))
            .await
            .unwrap();

        let loaded = prefs.get_preferences().await.unwrap().unwrap();
        assert_eq!(loaded, saved);
        assert!(loaded.follows("Vallila"));
        assert!(!loaded.follows("Pasila"));
    }

    #[tokio::test]
    async fn test_reads_persisted_schema() {
        let (kv, prefs) = make_store();
        kv.set(
            "prefs",
            r#"{"subscriptions":["Kamppi"],"enablePush":false,"enableInApp":true,"lastUpdated":"2024-02-01T08:00:00Z"}"#,
        )
        .await
        .unwrap();

        let loaded = prefs.get_preferences().await.unwrap().unwrap();
        assert!(loaded.follows("Kamppi"));
        assert!(!loaded.push_enabled);
        assert!(loaded.in_app_enabled);
    }

    #[tokio::test]
    async fn test_corrupt_record_is_config_error() {
        let (kv, prefs) = make_store();
        kv.set("prefs", "{not json").await.unwrap();

        let err = prefs.get_preferences().await.unwrap_err();
        assert!(matches!(err, AppError::Config(_)));

        prefs.clear().await.unwrap();
        assert!(prefs.get_preferences().await.unwrap().is_none());
    }
}
