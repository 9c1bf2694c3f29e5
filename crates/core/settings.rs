//! Typed access to persisted settings.

use std::collections::BTreeMap;

use crate::backoff::{BackoffPolicy, DEFAULT_RETRY_BASE};
use crate::error::{QueueError, Result};
use crate::job::DEFAULT_MAX_RETRIES;
use crate::store::ConfigStore;

/// Exponential base for retry delays.
pub const RETRY_BASE: &str = "retry_base";
/// Retry ceiling for submissions that do not carry one.
pub const DEFAULT_MAX_RETRIES_KEY: &str = "default_max_retries";
/// Unix time in nanoseconds of the last `worker stop` request. Strictly increasing.
pub const STOP_REQUESTED_AT: &str = "worker.stop_requested_at";

/// Settings facade over a [`ConfigStore`].
///
/// Known keys are validated before they are written; a rejected value leaves
/// the stored one untouched. Missing keys read as their built-in default.
#[derive(Debug, Clone)]
pub struct Settings<C> {
    store: C,
}

impl<C: ConfigStore> Settings<C> {
    pub fn new(store: C) -> Self {
        Self { store }
    }

    /// Built-in defaults for the known keys.
    pub fn defaults() -> BTreeMap<String, String> {
        BTreeMap::from([
            (RETRY_BASE.to_string(), DEFAULT_RETRY_BASE.to_string()),
            (
                DEFAULT_MAX_RETRIES_KEY.to_string(),
                DEFAULT_MAX_RETRIES.to_string(),
            ),
        ])
    }

    /// Effective value of a setting: the stored value, else the default.
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.store.get_setting(key).await? {
            Some(value) => Ok(Some(value)),
            None => Ok(Self::defaults().remove(key)),
        }
    }

    /// Validate and store a setting.
    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        let key = key.trim().to_lowercase();
        let value = value.trim();
        validate(&key, value)?;
        self.store.set_setting(&key, value).await?;
        tracing::info!(key = %key, value = %value, "Setting updated");
        Ok(())
    }

    /// Defaults overlaid with every stored setting.
    pub async fn list(&self) -> Result<BTreeMap<String, String>> {
        let mut all = Self::defaults();
        all.extend(self.store.list_settings().await?);
        Ok(all)
    }

    /// Backoff policy built from `retry_base`.
    ///
    /// A stored value that no longer parses is logged and replaced by the
    /// default so that a failing job can still be rescheduled.
    pub async fn backoff(&self) -> Result<BackoffPolicy> {
        match self.store.get_setting(RETRY_BASE).await? {
            None => Ok(BackoffPolicy::default()),
            Some(raw) => match BackoffPolicy::parse(&raw) {
                Ok(policy) => Ok(policy),
                Err(e) => {
                    tracing::warn!(value = %raw, error = %e, "Ignoring stored retry_base");
                    Ok(BackoffPolicy::default())
                }
            },
        }
    }

    /// Retry ceiling for submissions without `max_retries`.
    pub async fn default_max_retries(&self) -> Result<u32> {
        match self.store.get_setting(DEFAULT_MAX_RETRIES_KEY).await? {
            None => Ok(DEFAULT_MAX_RETRIES),
            Some(raw) => match parse_max_retries(&raw) {
                Ok(n) => Ok(n),
                Err(e) => {
                    tracing::warn!(value = %raw, error = %e, "Ignoring stored default_max_retries");
                    Ok(DEFAULT_MAX_RETRIES)
                }
            },
        }
    }

    /// Ask every running worker pool sharing this store to drain and stop.
    ///
    /// Returns the new marker, which always differs from the previous one.
    pub async fn request_stop(&self) -> Result<i64> {
        let previous = self.stop_requested_at().await?.unwrap_or(0);
        let marker = unix_now_nanos().max(previous.saturating_add(1));
        self.store
            .set_setting(STOP_REQUESTED_AT, &marker.to_string())
            .await?;
        Ok(marker)
    }

    /// Time of the most recent stop request, if any.
    pub async fn stop_requested_at(&self) -> Result<Option<i64>> {
        Ok(self
            .store
            .get_setting(STOP_REQUESTED_AT)
            .await?
            .and_then(|raw| raw.parse().ok()))
    }
}

fn unix_now_nanos() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}

fn validate(key: &str, value: &str) -> Result<()> {
    if key.is_empty() {
        return Err(QueueError::InvalidConfig {
            key: key.to_string(),
            reason: "key must not be empty".to_string(),
        });
    }
    match key {
        RETRY_BASE => BackoffPolicy::parse(value).map(|_| ()),
        DEFAULT_MAX_RETRIES_KEY => parse_max_retries(value).map(|_| ()),
        STOP_REQUESTED_AT => value.parse::<i64>().map(|_| ()).map_err(|_| {
            QueueError::InvalidConfig {
                key: key.to_string(),
                reason: "must be a unix timestamp".to_string(),
            }
        }),
        _ => Ok(()),
    }
}

fn parse_max_retries(value: &str) -> Result<u32> {
    value
        .trim()
        .parse::<u32>()
        .map_err(|_| QueueError::InvalidConfig {
            key: DEFAULT_MAX_RETRIES_KEY.to_string(),
            reason: "must be an integer >= 0".to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct MapStore(Arc<Mutex<BTreeMap<String, String>>>);

    #[async_trait]
    impl ConfigStore for MapStore {
        async fn get_setting(&self, key: &str) -> Result<Option<String>> {
            Ok(self.0.lock().unwrap().get(key).cloned())
        }

        async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
            self.0
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
            Ok(())
        }

        async fn list_settings(&self) -> Result<BTreeMap<String, String>> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    #[tokio::test]
    async fn test_defaults_when_missing() {
        let settings = Settings::new(MapStore::default());
        assert_eq!(settings.backoff().await.unwrap().base(), DEFAULT_RETRY_BASE);
        assert_eq!(
            settings.default_max_retries().await.unwrap(),
            DEFAULT_MAX_RETRIES
        );
        assert_eq!(settings.get(RETRY_BASE).await.unwrap().as_deref(), Some("2"));
        assert_eq!(settings.get("unknown").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_retry_base() {
        let settings = Settings::new(MapStore::default());
        settings.set("retry_base", "3").await.unwrap();
        assert_eq!(settings.backoff().await.unwrap().base(), 3);
    }

    #[tokio::test]
    async fn test_invalid_retry_base_keeps_previous() {
        let store = MapStore::default();
        let settings = Settings::new(store.clone());
        settings.set("retry_base", "5").await.unwrap();

        for bad in ["0", "-2", "abc", ""] {
            let err = settings.set("retry_base", bad).await.unwrap_err();
            assert!(matches!(err, QueueError::InvalidConfig { .. }));
        }
        assert_eq!(store.get_setting("retry_base").await.unwrap().as_deref(), Some("5"));
    }

    #[tokio::test]
    async fn test_invalid_max_retries_rejected() {
        let settings = Settings::new(MapStore::default());
        let err = settings.set("default_max_retries", "-1").await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidConfig { .. }));
        settings.set("default_max_retries", "0").await.unwrap();
        assert_eq!(settings.default_max_retries().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_key_is_normalized() {
        let store = MapStore::default();
        let settings = Settings::new(store.clone());
        settings.set("RETRY_BASE", "4").await.unwrap();
        assert_eq!(store.get_setting("retry_base").await.unwrap().as_deref(), Some("4"));
    }

    #[tokio::test]
    async fn test_unknown_keys_stored_verbatim() {
        let settings = Settings::new(MapStore::default());
        settings.set("poll_note", "anything goes").await.unwrap();
        let all = settings.list().await.unwrap();
        assert_eq!(all.get("poll_note").map(String::as_str), Some("anything goes"));
        assert_eq!(all.get(RETRY_BASE).map(String::as_str), Some("2"));
    }

    #[tokio::test]
    async fn test_corrupt_stored_value_falls_back() {
        let store = MapStore::default();
        store.set_setting(RETRY_BASE, "nope").await.unwrap();
        let settings = Settings::new(store);
        assert_eq!(settings.backoff().await.unwrap().base(), DEFAULT_RETRY_BASE);
    }

    #[tokio::test]
    async fn test_stop_request() {
        let settings = Settings::new(MapStore::default());
        assert_eq!(settings.stop_requested_at().await.unwrap(), None);
        let marker = settings.request_stop().await.unwrap();
        assert_eq!(settings.stop_requested_at().await.unwrap(), Some(marker));
    }

    #[tokio::test]
    async fn test_back_to_back_stop_requests_differ() {
        let settings = Settings::new(MapStore::default());
        let first = settings.request_stop().await.unwrap();
        let second = settings.request_stop().await.unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn test_stop_marker_increases_past_clock_skew() {
        let store = MapStore::default();
        let ahead = unix_now_nanos() + 3_600_000_000_000;
        store
            .set_setting(STOP_REQUESTED_AT, &ahead.to_string())
            .await
            .unwrap();

        let settings = Settings::new(store);
        assert_eq!(settings.request_stop().await.unwrap(), ahead + 1);
    }
}
