//! Backend trait definition for the remote key-value store.
//!
//! This module defines the `KeyValueBackend` trait that abstracts the storage
//! operations the scheduler dispatches. Every method may suspend until the backend
//! responds and may fail with a [`StoreError`]. The scheduler never retries: one
//! failure is one reported failure for that request.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mockall::automock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors a backend may report for a single call.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    /// The requested key was not found.
    #[error("Key not found: {0}")]
    KeyNotFound(String),

    /// The requested version of a key was not found.
    #[error("Version {1} not found for key {0}")]
    VersionNotFound(String, String),

    /// The backend rejected the call because the request budget is exhausted.
    #[error("Request throttled: {0}")]
    Throttled(String),

    /// Network error during communication with the backend.
    #[error("Network error: {0}")]
    Network(String),

    /// The backend refused the arguments or the stored data.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Generic backend error.
    #[error("Backend error: {0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Transform applied by an update: receives the current value (if any) and
/// returns the value to store. Returning `None` leaves the key untouched.
pub type Transform = Arc<dyn Fn(Option<Value>) -> Option<Value> + Send + Sync>;

/// Description of one stored version of a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    pub created_at: DateTime<Utc>,
    /// `true` if this version is a removal marker or was removed explicitly
    pub deleted: bool,
}

/// One entry of an ordered (integer valued) range query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortedEntry {
    pub key: String,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListKeysOptions {
    pub prefix: String,
    pub page_size: usize,
    pub exclude_deleted: bool,
}

impl Default for ListKeysOptions {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            page_size: default_page_size(),
            exclude_deleted: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListVersionsOptions {
    pub ascending: bool,
    pub min_date: Option<DateTime<Utc>>,
    pub max_date: Option<DateTime<Utc>>,
    pub page_size: usize,
}

impl Default for ListVersionsOptions {
    fn default() -> Self {
        Self {
            ascending: true,
            min_date: None,
            max_date: None,
            page_size: default_page_size(),
        }
    }
}

/// Inclusive integer range for ordered queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortedRange {
    pub ascending: bool,
    pub page_size: usize,
    pub min: Option<i64>,
    pub max: Option<i64>,
}

impl Default for SortedRange {
    fn default() -> Self {
        Self {
            ascending: true,
            page_size: default_page_size(),
            min: None,
            max: None,
        }
    }
}

fn default_page_size() -> usize {
    50
}

/// Trait that abstracts the remote key-value store.
///
/// # Thread Safety
///
/// Implementations are shared between the dispatch loop and every spawned
/// execution, which is enforced by the `Send + Sync` bounds.
#[automock]
#[async_trait]
pub trait KeyValueBackend: Send + Sync {
    /// Name used in log output
    fn name(&self) -> String;

    /// Read the current value of a key. `Ok(None)` if the key holds no value.
    async fn get(&self, key: &str) -> StoreResult<Option<Value>>;

    /// Overwrite the value of a key.
    async fn set(&self, key: &str, value: Value) -> StoreResult<()>;

    /// Atomically transform the value of a key and return the stored result.
    ///
    /// Returns `Ok(None)` if the transform declined to write.
    async fn update(&self, key: &str, transform: Transform) -> StoreResult<Option<Value>>;

    /// Add `delta` to an integer value (absent keys count as zero) and return the sum.
    async fn increment(&self, key: &str, delta: i64) -> StoreResult<i64>;

    /// Remove a key and return the value it held, if any.
    async fn remove(&self, key: &str) -> StoreResult<Option<Value>>;

    /// List keys matching the options' prefix, at most one page.
    async fn list_keys(&self, options: &ListKeysOptions) -> StoreResult<Vec<String>>;

    /// Read a specific version of a key.
    async fn get_version(&self, key: &str, version: &str) -> StoreResult<Option<Value>>;

    /// List the versions of a key, at most one page.
    async fn list_versions(
        &self,
        key: &str,
        options: &ListVersionsOptions,
    ) -> StoreResult<Vec<VersionInfo>>;

    /// Permanently remove one version of a key.
    async fn remove_version(&self, key: &str, version: &str) -> StoreResult<()>;

    /// Read the value a key held at the given point in time.
    async fn get_version_at_time(
        &self,
        key: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<Value>>;

    /// Query integer valued keys ordered by value, at most one page.
    async fn get_sorted(&self, range: &SortedRange) -> StoreResult<Vec<SortedEntry>>;
}

impl fmt::Debug for dyn KeyValueBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyValueBackend({})", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_option_defaults() {
        let keys = ListKeysOptions::default();
        assert_eq!(keys.page_size, 50);
        assert!(keys.exclude_deleted);
        assert!(keys.prefix.is_empty());

        let range = SortedRange::default();
        assert!(range.ascending);
        assert_eq!(range.min, None);
    }

    #[test]
    fn test_version_info_serialization() {
        let info = VersionInfo {
            version: "v1".to_string(),
            created_at: Utc::now(),
            deleted: false,
        };
        let serialized = serde_json::to_value(&info).unwrap();
        assert_eq!(serialized["version"], json!("v1"));
        let deserialized: VersionInfo = serde_json::from_value(serialized).unwrap();
        assert_eq!(deserialized, info);
    }

    #[tokio::test]
    async fn test_mock_backend_reports_errors() {
        let mut backend = MockKeyValueBackend::new();
        backend
            .expect_get()
            .returning(|key| Err(StoreError::Network(format!("unreachable for {}", key))));

        let result = backend.get("k1").await;
        assert_eq!(
            result,
            Err(StoreError::Network("unreachable for k1".to_string()))
        );
    }
}
