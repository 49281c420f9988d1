use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::store::backend::{
    KeyValueBackend, ListKeysOptions, ListVersionsOptions, SortedRange, StoreError, Transform,
};

use super::outcome::{Payload, RequestOutcome};

/// Operation kinds the backend budgets separately.
///
/// Each category owns one queue in the request manager and is checked against the
/// budget oracle on its own.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
pub enum RequestCategory {
    Get,
    Set,
    Update,
    Increment,
    Remove,
    ListKeys,
    GetVersion,
    ListVersions,
    RemoveVersion,
    GetVersionAtTime,
    GetSorted,
}

/// A storage operation together with its typed parameters.
#[derive(Clone)]
pub enum Operation {
    Get { key: String },
    Set { key: String, value: Value },
    Update { key: String, transform: Transform },
    Increment { key: String, delta: i64 },
    Remove { key: String },
    ListKeys { options: ListKeysOptions },
    GetVersion { key: String, version: String },
    ListVersions { key: String, options: ListVersionsOptions },
    RemoveVersion { key: String, version: String },
    GetVersionAtTime { key: String, at: DateTime<Utc> },
    GetSorted { range: SortedRange },
}

impl Operation {
    pub fn category(&self) -> RequestCategory {
        match self {
            Operation::Get { .. } => RequestCategory::Get,
            Operation::Set { .. } => RequestCategory::Set,
            Operation::Update { .. } => RequestCategory::Update,
            Operation::Increment { .. } => RequestCategory::Increment,
            Operation::Remove { .. } => RequestCategory::Remove,
            Operation::ListKeys { .. } => RequestCategory::ListKeys,
            Operation::GetVersion { .. } => RequestCategory::GetVersion,
            Operation::ListVersions { .. } => RequestCategory::ListVersions,
            Operation::RemoveVersion { .. } => RequestCategory::RemoveVersion,
            Operation::GetVersionAtTime { .. } => RequestCategory::GetVersionAtTime,
            Operation::GetSorted { .. } => RequestCategory::GetSorted,
        }
    }

    /// Target key; `None` for listing operations that span the whole store.
    pub fn key(&self) -> Option<&str> {
        match self {
            Operation::Get { key }
            | Operation::Set { key, .. }
            | Operation::Update { key, .. }
            | Operation::Increment { key, .. }
            | Operation::Remove { key }
            | Operation::GetVersion { key, .. }
            | Operation::ListVersions { key, .. }
            | Operation::RemoveVersion { key, .. }
            | Operation::GetVersionAtTime { key, .. } => Some(key),
            Operation::ListKeys { .. } | Operation::GetSorted { .. } => None,
        }
    }

    /// Runs the operation against `backend` and folds the response into an outcome.
    ///
    /// Backend errors and empty reads are reported through the outcome, never returned.
    pub(crate) async fn execute(self, backend: &dyn KeyValueBackend) -> RequestOutcome {
        let category = self.category();
        let outcome = match self {
            Operation::Get { key } => read(backend.get(&key).await, Payload::Value),
            Operation::Set { key, value } => write(backend.set(&key, value).await.map(|_| None)),
            Operation::Update { key, transform } => {
                read(backend.update(&key, transform).await, Payload::Value)
            }
            Operation::Increment { key, delta } => {
                read(backend.increment(&key, delta).await.map(Some), Payload::Integer)
            }
            Operation::Remove { key } => write(
                backend
                    .remove(&key)
                    .await
                    .map(|removed| removed.map(Payload::Value)),
            ),
            Operation::ListKeys { options } => {
                read(backend.list_keys(&options).await.map(Some), Payload::Keys)
            }
            Operation::GetVersion { key, version } => {
                read(backend.get_version(&key, &version).await, Payload::Value)
            }
            Operation::ListVersions { key, options } => read(
                backend.list_versions(&key, &options).await.map(Some),
                Payload::Versions,
            ),
            Operation::RemoveVersion { key, version } => {
                write(backend.remove_version(&key, &version).await.map(|_| None))
            }
            Operation::GetVersionAtTime { key, at } => {
                read(backend.get_version_at_time(&key, at).await, Payload::Value)
            }
            Operation::GetSorted { range } => {
                read(backend.get_sorted(&range).await.map(Some), Payload::Sorted)
            }
        };

        if let Some(message) = &outcome.error_message {
            warn!("{} on {} failed: {}", category, backend.name(), message);
        }
        outcome
    }
}

fn read<T>(result: Result<Option<T>, StoreError>, wrap: fn(T) -> Payload) -> RequestOutcome {
    match result {
        Ok(Some(value)) => RequestOutcome::success(Some(wrap(value))),
        Ok(None) => RequestOutcome::no_value(),
        Err(e) => RequestOutcome::failure(e.to_string()),
    }
}

fn write(result: Result<Option<Payload>, StoreError>) -> RequestOutcome {
    match result {
        Ok(value) => RequestOutcome::success(value),
        Err(e) => RequestOutcome::failure(e.to_string()),
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Update { key, .. } => f
                .debug_struct("Update")
                .field("key", key)
                .finish_non_exhaustive(),
            Operation::Get { key } => f.debug_struct("Get").field("key", key).finish(),
            Operation::Set { key, value } => f
                .debug_struct("Set")
                .field("key", key)
                .field("value", value)
                .finish(),
            Operation::Increment { key, delta } => f
                .debug_struct("Increment")
                .field("key", key)
                .field("delta", delta)
                .finish(),
            Operation::Remove { key } => f.debug_struct("Remove").field("key", key).finish(),
            Operation::ListKeys { options } => f
                .debug_struct("ListKeys")
                .field("options", options)
                .finish(),
            Operation::GetVersion { key, version } => f
                .debug_struct("GetVersion")
                .field("key", key)
                .field("version", version)
                .finish(),
            Operation::ListVersions { key, options } => f
                .debug_struct("ListVersions")
                .field("key", key)
                .field("options", options)
                .finish(),
            Operation::RemoveVersion { key, version } => f
                .debug_struct("RemoveVersion")
                .field("key", key)
                .field("version", version)
                .finish(),
            Operation::GetVersionAtTime { key, at } => f
                .debug_struct("GetVersionAtTime")
                .field("key", key)
                .field("at", at)
                .finish(),
            Operation::GetSorted { range } => f
                .debug_struct("GetSorted")
                .field("range", range)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::backend::MockKeyValueBackend;
    use serde_json::json;
    use std::{str::FromStr, sync::Arc};
    use strum::IntoEnumIterator;

    fn mock(name: &str) -> MockKeyValueBackend {
        let mut backend = MockKeyValueBackend::new();
        let name = name.to_string();
        backend.expect_name().returning(move || name.clone());
        backend
    }

    #[test]
    fn test_category_round_trip_through_strings() {
        assert_eq!(RequestCategory::iter().count(), 11);
        assert_eq!(RequestCategory::GetVersionAtTime.to_string(), "GetVersionAtTime");
        assert_eq!(
            RequestCategory::from_str("ListKeys").unwrap(),
            RequestCategory::ListKeys
        );
        assert!(RequestCategory::from_str("Teleport").is_err());
    }

    #[test]
    fn test_operation_key_and_category() {
        let op = Operation::Increment {
            key: "score".to_string(),
            delta: 3,
        };
        assert_eq!(op.category(), RequestCategory::Increment);
        assert_eq!(op.key(), Some("score"));

        let list = Operation::ListKeys {
            options: ListKeysOptions::default(),
        };
        assert_eq!(list.category(), RequestCategory::ListKeys);
        assert_eq!(list.key(), None);

        let update = Operation::Update {
            key: "k".to_string(),
            transform: Arc::new(|v: Option<Value>| v),
        };
        assert!(format!("{:?}", update).starts_with("Update"));
    }

    #[tokio::test]
    async fn test_read_with_value_succeeds() {
        let mut backend = mock("primary");
        backend.expect_get().returning(|_| Ok(Some(json!(5))));

        let outcome = Operation::Get {
            key: "k1".to_string(),
        }
        .execute(&backend)
        .await;
        assert!(outcome.success);
        assert_eq!(outcome.value, Some(Payload::Value(json!(5))));
        assert_eq!(outcome.error_message, None);
    }

    #[tokio::test]
    async fn test_read_without_value_fails() {
        let mut backend = mock("primary");
        backend.expect_get().returning(|_| Ok(None));

        let outcome = Operation::Get {
            key: "missing".to_string(),
        }
        .execute(&backend)
        .await;
        assert!(!outcome.success);
        assert!(outcome.error_message.is_some());
        assert_eq!(outcome.value, None);
    }

    #[tokio::test]
    async fn test_write_succeeds_without_value() {
        let mut backend = mock("primary");
        backend.expect_set().times(1).returning(|_, _| Ok(()));
        backend.expect_remove().returning(|_| Ok(None));

        let set = Operation::Set {
            key: "a".to_string(),
            value: json!("x"),
        }
        .execute(&backend)
        .await;
        assert!(set.success);
        assert_eq!(set.value, None);

        let remove = Operation::Remove {
            key: "a".to_string(),
        }
        .execute(&backend)
        .await;
        assert!(remove.success);
    }

    #[tokio::test]
    async fn test_backend_error_is_captured() {
        let mut backend = mock("primary");
        backend
            .expect_increment()
            .returning(|_, _| Err(StoreError::Throttled("Increment".to_string())));

        let outcome = Operation::Increment {
            key: "n".to_string(),
            delta: 1,
        }
        .execute(&backend)
        .await;
        assert!(!outcome.success);
        assert_eq!(
            outcome.error_message.as_deref(),
            Some("Request throttled: Increment")
        );
    }
}
