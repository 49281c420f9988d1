//! Typed entry points over the request scheduler.
//!
//! Each call validates its arguments, queues one request and waits for the
//! completion carrying that request's id. Validation failures are returned
//! before anything is queued; backend failures come back inside the [`Outcome`].

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, instrument, warn};

use crate::{
    config::ClientConfig,
    event::event_bus::Subscription,
    request::{
        manager::{Completion, RequestQueueManager},
        operation::Operation,
        outcome::{FromPayload, Outcome, RequestOutcome},
        pending::RequestId,
        RequestError, RequestResult,
    },
    store::{
        backend::{
            KeyValueBackend, ListKeysOptions, ListVersionsOptions, SortedEntry, SortedRange,
            VersionInfo,
        },
        budget::BudgetOracle,
    },
};

#[derive(Clone)]
pub struct ThrottledClient {
    manager: RequestQueueManager,
    config: ClientConfig,
}

impl ThrottledClient {
    pub fn new(budget: Arc<dyn BudgetOracle>, config: ClientConfig) -> Self {
        Self::with_manager(RequestQueueManager::new(budget), config)
    }

    /// Shares an existing scheduler, e.g. between clients with different limits.
    pub fn with_manager(manager: RequestQueueManager, config: ClientConfig) -> Self {
        Self { manager, config }
    }

    pub fn manager(&self) -> &RequestQueueManager {
        &self.manager
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn get(
        &self,
        store: &Arc<dyn KeyValueBackend>,
        key: &str,
    ) -> RequestResult<Outcome<Value>> {
        self.check_key(key)?;
        self.dispatch(store, Operation::Get { key: key.to_string() })
            .await
    }

    pub async fn set(
        &self,
        store: &Arc<dyn KeyValueBackend>,
        key: &str,
        value: Value,
    ) -> RequestResult<Outcome<()>> {
        self.check_key(key)?;
        self.check_value(&value)?;
        self.dispatch(
            store,
            Operation::Set {
                key: key.to_string(),
                value,
            },
        )
        .await
    }

    /// Applies `transform` to the stored value and returns what was written.
    pub async fn update<F>(
        &self,
        store: &Arc<dyn KeyValueBackend>,
        key: &str,
        transform: F,
    ) -> RequestResult<Outcome<Value>>
    where
        F: Fn(Option<Value>) -> Option<Value> + Send + Sync + 'static,
    {
        self.check_key(key)?;
        self.dispatch(
            store,
            Operation::Update {
                key: key.to_string(),
                transform: Arc::new(transform),
            },
        )
        .await
    }

    pub async fn increment(
        &self,
        store: &Arc<dyn KeyValueBackend>,
        key: &str,
        delta: i64,
    ) -> RequestResult<Outcome<i64>> {
        self.check_key(key)?;
        self.dispatch(
            store,
            Operation::Increment {
                key: key.to_string(),
                delta,
            },
        )
        .await
    }

    /// Removes `key`. The outcome carries the removed value when the key existed.
    pub async fn remove(
        &self,
        store: &Arc<dyn KeyValueBackend>,
        key: &str,
    ) -> RequestResult<Outcome<Value>> {
        self.check_key(key)?;
        self.dispatch(store, Operation::Remove { key: key.to_string() })
            .await
    }

    pub async fn list_keys(
        &self,
        store: &Arc<dyn KeyValueBackend>,
        options: ListKeysOptions,
    ) -> RequestResult<Outcome<Vec<String>>> {
        if options.prefix.len() > self.config.max_key_length {
            return Err(RequestError::invalid_argument(
                "prefix",
                format!("longer than {} bytes", self.config.max_key_length),
            ));
        }
        self.check_page_size(options.page_size)?;
        self.dispatch(store, Operation::ListKeys { options }).await
    }

    pub async fn get_version(
        &self,
        store: &Arc<dyn KeyValueBackend>,
        key: &str,
        version: &str,
    ) -> RequestResult<Outcome<Value>> {
        self.check_key(key)?;
        check_version(version)?;
        self.dispatch(
            store,
            Operation::GetVersion {
                key: key.to_string(),
                version: version.to_string(),
            },
        )
        .await
    }

    pub async fn list_versions(
        &self,
        store: &Arc<dyn KeyValueBackend>,
        key: &str,
        options: ListVersionsOptions,
    ) -> RequestResult<Outcome<Vec<VersionInfo>>> {
        self.check_key(key)?;
        self.check_page_size(options.page_size)?;
        if let (Some(min), Some(max)) = (options.min_date, options.max_date) {
            if min > max {
                return Err(RequestError::invalid_argument(
                    "min_date",
                    "must not be later than max_date",
                ));
            }
        }
        self.dispatch(
            store,
            Operation::ListVersions {
                key: key.to_string(),
                options,
            },
        )
        .await
    }

    pub async fn remove_version(
        &self,
        store: &Arc<dyn KeyValueBackend>,
        key: &str,
        version: &str,
    ) -> RequestResult<Outcome<()>> {
        self.check_key(key)?;
        check_version(version)?;
        self.dispatch(
            store,
            Operation::RemoveVersion {
                key: key.to_string(),
                version: version.to_string(),
            },
        )
        .await
    }

    pub async fn get_version_at_time(
        &self,
        store: &Arc<dyn KeyValueBackend>,
        key: &str,
        at: DateTime<Utc>,
    ) -> RequestResult<Outcome<Value>> {
        self.check_key(key)?;
        self.dispatch(
            store,
            Operation::GetVersionAtTime {
                key: key.to_string(),
                at,
            },
        )
        .await
    }

    pub async fn get_sorted(
        &self,
        store: &Arc<dyn KeyValueBackend>,
        range: SortedRange,
    ) -> RequestResult<Outcome<Vec<SortedEntry>>> {
        self.check_page_size(range.page_size)?;
        if let (Some(min), Some(max)) = (range.min, range.max) {
            if min > max {
                return Err(RequestError::invalid_argument(
                    "min",
                    format!("{} is greater than max {}", min, max),
                ));
            }
        }
        self.dispatch(store, Operation::GetSorted { range }).await
    }

    /// Queues `operation` and waits for its completion.
    ///
    /// The id is reserved and the listener attached before the request is queued,
    /// so a completion can never be fired ahead of its listener.
    #[instrument(skip(self, store, operation), fields(category = %operation.category()))]
    async fn dispatch<T: FromPayload>(
        &self,
        store: &Arc<dyn KeyValueBackend>,
        operation: Operation,
    ) -> RequestResult<Outcome<T>> {
        let request_id = self.manager.reserve_id();
        let (tx, rx) = oneshot::channel::<RequestOutcome>();
        let tx = Mutex::new(Some(tx));
        let expected = request_id.clone();

        let subscription = self
            .manager
            .completions()
            .subscribe(move |completion: Completion| {
                if completion.request_id != expected {
                    return;
                }
                let sender = match tx.lock() {
                    Ok(mut guard) => guard.take(),
                    Err(poisoned) => poisoned.into_inner().take(),
                };
                if let Some(sender) = sender {
                    let _ = sender.send(completion.outcome);
                }
            })?;

        let mut in_flight = InFlight {
            manager: self.manager.clone(),
            request_id: request_id.clone(),
            subscription,
            settled: false,
        };

        self.manager
            .enqueue(request_id.clone(), Arc::clone(store), operation)
            .await;

        let received = match self.config.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(received) => received,
                Err(_) => {
                    let withdrawn = in_flight.withdraw().await;
                    warn!(
                        "Request {} timed out after {:?} (withdrawn: {})",
                        request_id, limit, withdrawn
                    );
                    return Err(RequestError::Timeout(request_id));
                }
            },
            None => rx.await,
        };

        let outcome = received.map_err(|_| RequestError::ChannelClosed)?;
        in_flight.settled = true;
        debug!("Request {} finished (success: {})", request_id, outcome.success);
        Ok(Outcome::from(outcome))
    }

    fn check_key(&self, key: &str) -> RequestResult<()> {
        if key.is_empty() {
            return Err(RequestError::invalid_argument("key", "must not be empty"));
        }
        if key.len() > self.config.max_key_length {
            return Err(RequestError::invalid_argument(
                "key",
                format!("longer than {} bytes", self.config.max_key_length),
            ));
        }
        Ok(())
    }

    fn check_page_size(&self, page_size: usize) -> RequestResult<()> {
        if page_size == 0 || page_size > self.config.max_page_size {
            return Err(RequestError::invalid_argument(
                "page_size",
                format!("must be within 1..={}", self.config.max_page_size),
            ));
        }
        Ok(())
    }

    fn check_value(&self, value: &Value) -> RequestResult<()> {
        let size = serde_json::to_vec(value)
            .map_err(|e| RequestError::invalid_argument("value", e.to_string()))?
            .len();
        if size > self.config.max_value_bytes {
            return Err(RequestError::invalid_argument(
                "value",
                format!(
                    "{} bytes exceeds the limit of {}",
                    size, self.config.max_value_bytes
                ),
            ));
        }
        Ok(())
    }
}

/// Listener and queue entry of one facade call.
///
/// Dropping it disconnects the listener. A call that never received its
/// completion also has its request withdrawn if it is still queued.
struct InFlight {
    manager: RequestQueueManager,
    request_id: RequestId,
    subscription: Subscription<Completion>,
    settled: bool,
}

impl InFlight {
    async fn withdraw(&mut self) -> bool {
        self.subscription.disconnect();
        let withdrawn = self.manager.cancel(&self.request_id).await;
        self.settled = true;
        withdrawn
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.subscription.disconnect();
        if self.settled {
            return;
        }
        // 呼び出し側が待機を放棄した
        debug!("Request {} abandoned by its caller", self.request_id);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let manager = self.manager.clone();
            let request_id = self.request_id.clone();
            runtime.spawn(async move {
                manager.cancel(&request_id).await;
            });
        }
    }
}

fn check_version(version: &str) -> RequestResult<()> {
    if version.is_empty() {
        return Err(RequestError::invalid_argument(
            "version",
            "must not be empty",
        ));
    }
    Ok(())
}
