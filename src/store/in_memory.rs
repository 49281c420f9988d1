//! In-memory key-value backend.
//!
//! This module provides an implementation of the KeyValueBackend trait that keeps
//! every key's version history in a DashMap. It is used to run the scheduler
//! without a remote service, and optionally simulates latency and enforces a
//! [`WindowBudget`] the way a throttling backend would.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use serde_json::Value;

use crate::request::operation::RequestCategory;

use super::{
    backend::{
        KeyValueBackend, ListKeysOptions, ListVersionsOptions, SortedEntry, SortedRange,
        StoreError, StoreResult, Transform, VersionInfo,
    },
    budget::WindowBudget,
};

#[derive(Debug, Clone)]
struct StoredVersion {
    version: String,
    value: Option<Value>,
    created_at: DateTime<Utc>,
    removed: bool,
}

impl StoredVersion {
    fn live_value(&self) -> Option<&Value> {
        if self.removed {
            None
        } else {
            self.value.as_ref()
        }
    }

    fn info(&self) -> VersionInfo {
        VersionInfo {
            version: self.version.clone(),
            created_at: self.created_at,
            deleted: self.removed || self.value.is_none(),
        }
    }
}

/// In-memory backend with per-key version history.
///
/// # Thread Safety
///
/// DashMap provides fine-grained locking per key, so concurrent executions of
/// different keys do not contend. Updates hold the key's shard lock while the
/// transform runs, which makes them atomic per key.
#[derive(Clone)]
pub struct InMemoryBackend {
    name: String,
    records: Arc<DashMap<String, Vec<StoredVersion>>>,
    versions: Arc<AtomicU64>,
    latency: Option<Duration>,
    meter: Option<Arc<WindowBudget>>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new("in-memory")
    }
}

impl InMemoryBackend {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            records: Arc::new(DashMap::new()),
            versions: Arc::new(AtomicU64::new(0)),
            latency: None,
            meter: None,
        }
    }

    /// Delays every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Charges every call against `budget` and rejects calls once it is exhausted.
    pub fn metered(mut self, budget: Arc<WindowBudget>) -> Self {
        self.meter = Some(budget);
        self
    }

    pub fn key_count(&self) -> usize {
        self.records.len()
    }

    async fn admit(&self, category: RequestCategory) -> StoreResult<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        match &self.meter {
            Some(meter) if !meter.try_consume(category) => {
                Err(StoreError::Throttled(category.to_string()))
            }
            _ => Ok(()),
        }
    }

    fn next_version(&self, value: Option<Value>, removed: bool) -> StoredVersion {
        let n = self.versions.fetch_add(1, Ordering::Relaxed) + 1;
        StoredVersion {
            version: format!("v{}", n),
            value,
            created_at: Utc::now(),
            removed,
        }
    }

    fn current(&self, key: &str) -> Option<Value> {
        self.records
            .get(key)
            .and_then(|history| history.last().and_then(|v| v.live_value().cloned()))
    }

    fn write(&self, key: &str, value: Option<Value>) {
        let version = self.next_version(value, false);
        self.records
            .entry(key.to_string())
            .or_default()
            .push(version);
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    value.as_i64()
}

#[async_trait]
impl KeyValueBackend for InMemoryBackend {
    fn name(&self) -> String {
        self.name.clone()
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Value>> {
        self.admit(RequestCategory::Get).await?;
        Ok(self.current(key))
    }

    async fn set(&self, key: &str, value: Value) -> StoreResult<()> {
        self.admit(RequestCategory::Set).await?;
        self.write(key, Some(value));
        Ok(())
    }

    async fn update(&self, key: &str, transform: Transform) -> StoreResult<Option<Value>> {
        self.admit(RequestCategory::Update).await?;
        match self.records.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let history = occupied.get_mut();
                let current = history.last().and_then(|v| v.live_value().cloned());
                let Some(updated) = transform(current) else {
                    return Ok(None);
                };
                history.push(self.next_version(Some(updated.clone()), false));
                Ok(Some(updated))
            }
            // 変換が書き込みを見送ったキーは作らない
            Entry::Vacant(vacant) => {
                let Some(updated) = transform(None) else {
                    return Ok(None);
                };
                vacant.insert(vec![self.next_version(Some(updated.clone()), false)]);
                Ok(Some(updated))
            }
        }
    }

    async fn increment(&self, key: &str, delta: i64) -> StoreResult<i64> {
        self.admit(RequestCategory::Increment).await?;
        let mut history = self.records.entry(key.to_string()).or_default();
        let current = match history.last().and_then(|v| v.live_value()) {
            None => 0,
            Some(value) => as_integer(value).ok_or_else(|| {
                StoreError::Validation(format!("Value of {} is not an integer", key))
            })?,
        };
        let sum = current
            .checked_add(delta)
            .ok_or_else(|| StoreError::Validation(format!("Increment of {} overflows", key)))?;
        history.push(self.next_version(Some(Value::from(sum)), false));
        Ok(sum)
    }

    async fn remove(&self, key: &str) -> StoreResult<Option<Value>> {
        self.admit(RequestCategory::Remove).await?;
        let Some(mut history) = self.records.get_mut(key) else {
            return Ok(None);
        };
        let previous = history.last().and_then(|v| v.live_value().cloned());
        if previous.is_some() {
            history.push(self.next_version(None, false));
        }
        Ok(previous)
    }

    async fn list_keys(&self, options: &ListKeysOptions) -> StoreResult<Vec<String>> {
        self.admit(RequestCategory::ListKeys).await?;
        let mut keys: Vec<String> = self
            .records
            .iter()
            .filter(|entry| entry.key().starts_with(&options.prefix))
            .filter(|entry| {
                !options.exclude_deleted
                    || entry.value().last().and_then(|v| v.live_value()).is_some()
            })
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys.truncate(options.page_size);
        Ok(keys)
    }

    async fn get_version(&self, key: &str, version: &str) -> StoreResult<Option<Value>> {
        self.admit(RequestCategory::GetVersion).await?;
        let history = self
            .records
            .get(key)
            .ok_or_else(|| StoreError::KeyNotFound(key.to_string()))?;
        let stored = history
            .iter()
            .find(|v| v.version == version)
            .ok_or_else(|| StoreError::VersionNotFound(key.to_string(), version.to_string()))?;
        Ok(stored.live_value().cloned())
    }

    async fn list_versions(
        &self,
        key: &str,
        options: &ListVersionsOptions,
    ) -> StoreResult<Vec<VersionInfo>> {
        self.admit(RequestCategory::ListVersions).await?;
        let Some(history) = self.records.get(key) else {
            return Ok(Vec::new());
        };
        let mut versions: Vec<VersionInfo> = history
            .iter()
            .filter(|v| options.min_date.map_or(true, |min| v.created_at >= min))
            .filter(|v| options.max_date.map_or(true, |max| v.created_at <= max))
            .map(StoredVersion::info)
            .collect();
        if !options.ascending {
            versions.reverse();
        }
        versions.truncate(options.page_size);
        Ok(versions)
    }

    async fn remove_version(&self, key: &str, version: &str) -> StoreResult<()> {
        self.admit(RequestCategory::RemoveVersion).await?;
        let mut history = self
            .records
            .get_mut(key)
            .ok_or_else(|| StoreError::KeyNotFound(key.to_string()))?;
        let stored = history
            .iter_mut()
            .find(|v| v.version == version)
            .ok_or_else(|| StoreError::VersionNotFound(key.to_string(), version.to_string()))?;
        stored.removed = true;
        Ok(())
    }

    async fn get_version_at_time(
        &self,
        key: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<Value>> {
        self.admit(RequestCategory::GetVersionAtTime).await?;
        Ok(self.records.get(key).and_then(|history| {
            history
                .iter()
                .rev()
                .find(|v| v.created_at <= at)
                .and_then(|v| v.live_value().cloned())
        }))
    }

    async fn get_sorted(&self, range: &SortedRange) -> StoreResult<Vec<SortedEntry>> {
        self.admit(RequestCategory::GetSorted).await?;
        let mut entries: Vec<SortedEntry> = self
            .records
            .iter()
            .filter_map(|entry| {
                let value = entry.value().last()?.live_value().and_then(as_integer)?;
                Some(SortedEntry {
                    key: entry.key().clone(),
                    value,
                })
            })
            .filter(|e| range.min.map_or(true, |min| e.value >= min))
            .filter(|e| range.max.map_or(true, |max| e.value <= max))
            .collect();
        entries.sort_by(|a, b| a.value.cmp(&b.value).then_with(|| a.key.cmp(&b.key)));
        if !range.ascending {
            entries.reverse();
        }
        entries.truncate(range.page_size);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_and_remove() {
        let backend = InMemoryBackend::default();
        assert_eq!(backend.get("k1").await.unwrap(), None);

        backend.set("k1", json!({"gold": 10})).await.unwrap();
        assert_eq!(backend.get("k1").await.unwrap(), Some(json!({"gold": 10})));

        let removed = backend.remove("k1").await.unwrap();
        assert_eq!(removed, Some(json!({"gold": 10})));
        assert_eq!(backend.get("k1").await.unwrap(), None);
        // removing again reports nothing
        assert_eq!(backend.remove("k1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_applies_transform() {
        let backend = InMemoryBackend::default();
        backend.set("list", json!([1])).await.unwrap();

        let appended = backend
            .update(
                "list",
                Arc::new(|current: Option<Value>| {
                    let mut items = current?.as_array()?.clone();
                    items.push(json!(2));
                    Some(Value::Array(items))
                }),
            )
            .await
            .unwrap();
        assert_eq!(appended, Some(json!([1, 2])));

        let declined = backend
            .update("list", Arc::new(|_: Option<Value>| -> Option<Value> { None }))
            .await
            .unwrap();
        assert_eq!(declined, None);
        assert_eq!(backend.get("list").await.unwrap(), Some(json!([1, 2])));
    }

    #[tokio::test]
    async fn test_declined_update_leaves_no_key_behind() {
        let backend = InMemoryBackend::default();
        let declined = backend
            .update("ghost", Arc::new(|_: Option<Value>| -> Option<Value> { None }))
            .await
            .unwrap();
        assert_eq!(declined, None);
        assert_eq!(backend.key_count(), 0);

        let all_keys = ListKeysOptions {
            exclude_deleted: false,
            ..Default::default()
        };
        assert!(backend.list_keys(&all_keys).await.unwrap().is_empty());

        let created = backend
            .update("ghost", Arc::new(|_: Option<Value>| Some(json!("boo"))))
            .await
            .unwrap();
        assert_eq!(created, Some(json!("boo")));
        assert_eq!(backend.list_keys(&all_keys).await.unwrap(), vec!["ghost".to_string()]);
    }

    #[tokio::test]
    async fn test_increment() {
        let backend = InMemoryBackend::default();
        assert_eq!(backend.increment("n", 5).await.unwrap(), 5);
        assert_eq!(backend.increment("n", -2).await.unwrap(), 3);

        backend.set("text", json!("abc")).await.unwrap();
        assert!(matches!(
            backend.increment("text", 1).await,
            Err(StoreError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_list_keys_by_prefix() {
        let backend = InMemoryBackend::default();
        for key in ["player_2", "player_1", "guild_1"] {
            backend.set(key, json!(1)).await.unwrap();
        }
        backend.remove("player_2").await.unwrap();

        let options = ListKeysOptions {
            prefix: "player_".to_string(),
            ..Default::default()
        };
        assert_eq!(backend.list_keys(&options).await.unwrap(), vec!["player_1"]);

        let with_deleted = ListKeysOptions {
            exclude_deleted: false,
            ..options
        };
        assert_eq!(
            backend.list_keys(&with_deleted).await.unwrap(),
            vec!["player_1", "player_2"]
        );
    }

    #[tokio::test]
    async fn test_versions() {
        let backend = InMemoryBackend::default();
        backend.set("k", json!("first")).await.unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let between = Utc::now();
        std::thread::sleep(Duration::from_millis(5));
        backend.set("k", json!("second")).await.unwrap();

        let versions = backend
            .list_versions("k", &ListVersionsOptions::default())
            .await
            .unwrap();
        assert_eq!(versions.len(), 2);
        let first = versions[0].version.clone();

        assert_eq!(
            backend.get_version("k", &first).await.unwrap(),
            Some(json!("first"))
        );
        assert_eq!(
            backend.get_version_at_time("k", between).await.unwrap(),
            Some(json!("first"))
        );

        let newest_first = backend
            .list_versions(
                "k",
                &ListVersionsOptions {
                    ascending: false,
                    page_size: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(newest_first.len(), 1);
        assert_ne!(newest_first[0].version, first);

        backend.remove_version("k", &first).await.unwrap();
        assert_eq!(backend.get_version("k", &first).await.unwrap(), None);
        assert!(matches!(
            backend.remove_version("k", "v999").await,
            Err(StoreError::VersionNotFound(_, _))
        ));
    }

    #[tokio::test]
    async fn test_get_sorted_range() {
        let backend = InMemoryBackend::default();
        backend.set("a", json!(30)).await.unwrap();
        backend.set("b", json!(10)).await.unwrap();
        backend.set("c", json!(20)).await.unwrap();
        backend.set("d", json!("not a number")).await.unwrap();

        let range = SortedRange {
            ascending: false,
            page_size: 10,
            min: Some(15),
            max: None,
        };
        let entries = backend.get_sorted(&range).await.unwrap();
        assert_eq!(
            entries,
            vec![
                SortedEntry {
                    key: "a".to_string(),
                    value: 30
                },
                SortedEntry {
                    key: "c".to_string(),
                    value: 20
                },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_metered_backend_throttles() {
        let budget = Arc::new(WindowBudget::new(1, Duration::from_secs(60)));
        let backend = InMemoryBackend::new("metered").metered(budget.clone());

        backend.set("k", json!(1)).await.unwrap();
        assert_eq!(
            backend.set("k", json!(2)).await,
            Err(StoreError::Throttled("Set".to_string()))
        );
        // other categories keep their own allowance
        assert_eq!(backend.get("k").await.unwrap(), Some(json!(1)));
    }
}
