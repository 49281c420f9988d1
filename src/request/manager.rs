//! # Request Queue Manager
//!
//! The RequestQueueManager owns one queue of pending requests per operation
//! category and a periodic dispatch loop that sends requests to the backend once
//! the budget oracle reports spare allowance for their category.
//!
//! ## Key Features
//!
//! - **Budget-aware Dispatch**: A request is only started when its category has budget left
//! - **At-most-once Execution**: Each request moves `Queued -> Executing -> Completed` exactly once
//! - **Correlated Completion**: Every request produces one [`Completion`] on the completion bus
//! - **Self-stopping Loop**: The dispatch loop stops when every queue is empty and
//!   restarts on the next submission
//!
//! ## Implementation Details
//!
//! Queues and the running flag live behind a single Tokio mutex, which is the only
//! place they are mutated. Each tick scans the queues in category order, starts an
//! independent task per eligible request and returns without awaiting them. An
//! execution removes its request from the queue under the same mutex before firing
//! its completion.

use std::{collections::BTreeMap, panic::AssertUnwindSafe, sync::Arc, time::Duration};

use futures::FutureExt;
use tokio::{
    sync::Mutex,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, instrument, trace, warn};

use crate::{
    event::event_bus::EventBus,
    store::{backend::KeyValueBackend, budget::BudgetOracle},
};

use super::{
    operation::{Operation, RequestCategory},
    outcome::RequestOutcome,
    pending::{PendingRequest, RequestId, RequestIdGenerator, RequestState},
};

/// Period of the dispatch loop.
pub const TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Fired on the completion bus once per request.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub request_id: RequestId,
    pub outcome: RequestOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Ticks run since the manager was created
    pub ticks: u64,
    /// Time accumulated across all ticks
    pub elapsed: Duration,
    pub dispatched: u64,
    pub completed: u64,
    /// Requests withdrawn before they started
    pub withdrawn: u64,
}

#[derive(Default)]
struct DispatchState {
    queues: BTreeMap<RequestCategory, Vec<PendingRequest>>,
    running: bool,
    stats: DispatchStats,
}

impl DispatchState {
    fn take(&mut self, id: &RequestId) -> Option<PendingRequest> {
        self.queues.values_mut().find_map(|queue| {
            let position = queue.iter().position(|request| request.id() == id)?;
            Some(queue.remove(position))
        })
    }

    fn find(&self, id: &RequestId) -> Option<&PendingRequest> {
        self.queues
            .values()
            .flat_map(|queue| queue.iter())
            .find(|request| request.id() == id)
    }
}

/// # Request Queue Manager
///
/// Cloning yields another handle to the same queues, loop and completion bus.
///
/// # Example
///
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use budgetkv::request::{manager::RequestQueueManager, operation::Operation};
/// # use budgetkv::store::{backend::KeyValueBackend, budget::FixedBudget, in_memory::InMemoryBackend};
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let manager = RequestQueueManager::new(Arc::new(FixedBudget::new(10)));
/// let backend: Arc<dyn KeyValueBackend> = Arc::new(InMemoryBackend::default());
///
/// let completion = manager.completions().wait();
/// let request_id = manager
///     .submit(backend, Operation::Get { key: "k1".to_string() })
///     .await;
/// let completion = completion.await?;
/// assert_eq!(completion.request_id, request_id);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RequestQueueManager {
    budget: Arc<dyn BudgetOracle>,
    completions: EventBus<Completion>,
    state: Arc<Mutex<DispatchState>>,
    ids: Arc<RequestIdGenerator>,
}

impl RequestQueueManager {
    pub fn new(budget: Arc<dyn BudgetOracle>) -> Self {
        Self {
            budget,
            completions: EventBus::new(),
            state: Arc::new(Mutex::new(DispatchState::default())),
            ids: Arc::new(RequestIdGenerator::new()),
        }
    }

    /// Bus on which every finished request fires its [`Completion`].
    pub fn completions(&self) -> &EventBus<Completion> {
        &self.completions
    }

    /// Mints the correlation id for a request that is submitted later.
    pub fn reserve_id(&self) -> RequestId {
        self.ids.mint()
    }

    /// Queues `operation` against `backend` and returns its correlation id.
    ///
    /// Starts the dispatch loop if it is idle. Does not wait for the request.
    #[instrument(skip(self, backend))]
    pub async fn submit(
        &self,
        backend: Arc<dyn KeyValueBackend>,
        operation: Operation,
    ) -> RequestId {
        let request_id = self.reserve_id();
        self.enqueue(request_id.clone(), backend, operation).await;
        request_id
    }

    /// Queues a request under an id obtained from [`RequestQueueManager::reserve_id`].
    pub(crate) async fn enqueue(
        &self,
        request_id: RequestId,
        backend: Arc<dyn KeyValueBackend>,
        operation: Operation,
    ) {
        let category = operation.category();
        let mut state = self.state.lock().await;
        debug!("Request {} queued for {} on {}", request_id, category, backend.name());
        state
            .queues
            .entry(category)
            .or_default()
            .push(PendingRequest::new(request_id, backend, operation));

        if !state.running {
            state.running = true;
            self.spawn_dispatch_loop();
        }
    }

    /// Withdraws a request that has not started yet.
    ///
    /// Returns `false` if the request is unknown or already executing; an executing
    /// request always runs to completion.
    pub async fn cancel(&self, request_id: &RequestId) -> bool {
        let mut state = self.state.lock().await;
        let queued = state
            .find(request_id)
            .is_some_and(|request| request.is_queued());
        if !queued {
            return false;
        }
        state.take(request_id);
        state.stats.withdrawn += 1;
        debug!("Request {} withdrawn", request_id);
        true
    }

    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    pub async fn queue_len(&self, category: RequestCategory) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(&category)
            .map_or(0, Vec::len)
    }

    /// Requests queued or executing across all categories.
    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.queues.values().map(Vec::len).sum()
    }

    /// State of a request that is still held by a queue.
    pub async fn request_state(&self, request_id: &RequestId) -> Option<RequestState> {
        self.state
            .lock()
            .await
            .find(request_id)
            .map(PendingRequest::state)
    }

    pub async fn stats(&self) -> DispatchStats {
        self.state.lock().await.stats.clone()
    }

    fn spawn_dispatch_loop(&self) {
        debug!("Dispatch loop starting");
        let manager = self.clone();
        tokio::spawn(async move { manager.run_dispatch_loop().await });
    }

    async fn run_dispatch_loop(self) {
        let mut interval = time::interval_at(Instant::now() + TICK_INTERVAL, TICK_INTERVAL);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_tick = Instant::now();

        loop {
            interval.tick().await;
            let now = Instant::now();
            let elapsed = now.duration_since(last_tick);
            last_tick = now;

            if !self.tick(elapsed).await {
                break;
            }
        }
        debug!("Dispatch loop idle");
    }

    /// Runs one scan over all queues. Returns `false` once the loop has stopped.
    async fn tick(&self, elapsed: Duration) -> bool {
        let mut state = self.state.lock().await;
        let DispatchState {
            queues,
            running,
            stats,
        } = &mut *state;
        stats.ticks += 1;
        stats.elapsed += elapsed;

        for (category, queue) in queues.iter_mut() {
            for request in queue.iter_mut().filter(|request| request.is_queued()) {
                if self.budget.remaining_budget(*category) == 0 {
                    trace!("No {} budget, {} stays queued", category, request.id());
                    continue;
                }
                if let Some((operation, backend)) = request.begin_execution() {
                    stats.dispatched += 1;
                    self.spawn_execution(request.id().clone(), backend, operation);
                }
            }
        }

        if queues.values().all(Vec::is_empty) {
            *running = false;
            return false;
        }
        true
    }

    fn spawn_execution(
        &self,
        request_id: RequestId,
        backend: Arc<dyn KeyValueBackend>,
        operation: Operation,
    ) {
        let manager = self.clone();
        tokio::spawn(async move {
            let category = operation.category();
            debug!("Dispatching {} ({}) to {}", request_id, category, backend.name());

            let outcome = match AssertUnwindSafe(operation.execute(backend.as_ref()))
                .catch_unwind()
                .await
            {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!("{} on {} panicked", category, backend.name());
                    RequestOutcome::failure(format!("{} call panicked", category))
                }
            };
            manager.complete(request_id, outcome).await;
        });
    }

    async fn complete(&self, request_id: RequestId, outcome: RequestOutcome) {
        {
            let mut state = self.state.lock().await;
            match state.take(&request_id) {
                Some(mut request) => {
                    if request.complete() {
                        state.stats.completed += 1;
                    } else {
                        warn!("Request {} finished in state {:?}", request_id, request.state());
                    }
                }
                None => warn!("Request {} finished but was no longer queued", request_id),
            }
        }

        let completion = Completion {
            request_id: request_id.clone(),
            outcome,
        };
        if let Err(e) = self.completions.fire(completion) {
            warn!("Completion of {} was not delivered: {}", request_id, e);
        }
    }
}
