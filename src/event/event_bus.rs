//! # Event Bus Implementation
//!
//! The EventBus is a handler-based publish-subscribe primitive. Components register
//! closures against a bus and every [`EventBus::fire`] invokes the registered handlers
//! with a clone of the fired arguments.
//!
//! ## Features
//!
//! - **Ordered Delivery**: Handlers are invoked in subscription order
//! - **One-shot Subscriptions**: A handler can be registered to fire at most once
//! - **Concurrent Handlers**: Handlers flagged as concurrent are spawned on the Tokio runtime
//! - **Blocking Wait**: [`EventBus::wait`] suspends the caller until the next firing
//!
//! ## Snapshot Semantics
//!
//! The recipients of one firing are fixed when the firing starts. A handler may
//! disconnect itself or any other subscription while the bus is firing without
//! affecting the current round of delivery.
//!
//! ## Lifecycle
//!
//! [`EventBus::destroy`] clears all subscriptions. After that every `subscribe*`,
//! `wait` and `fire` call fails with [`EventError::Destroyed`].

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
};

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, trace};

type Handler<A> = Arc<dyn Fn(A) + Send + Sync>;

struct SubscriptionEntry<A> {
    id: u64,
    handler: Handler<A>,
    fires_once: bool,
    concurrent: bool,
    fired: AtomicBool,
}

struct BusInner<A> {
    /// `None` once the bus has been destroyed
    subscriptions: Mutex<Option<Vec<Arc<SubscriptionEntry<A>>>>>,
    next_id: AtomicU64,
}

impl<A> BusInner<A> {
    fn lock(&self) -> MutexGuard<'_, Option<Vec<Arc<SubscriptionEntry<A>>>>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, id: u64) -> bool {
        match self.lock().as_mut() {
            Some(subscriptions) => {
                let before = subscriptions.len();
                subscriptions.retain(|entry| entry.id != id);
                subscriptions.len() != before
            }
            None => false,
        }
    }

    fn contains(&self, id: u64) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|subscriptions| subscriptions.iter().any(|entry| entry.id == id))
    }
}

/// # EventBus
///
/// Multi-subscriber notification primitive. Cloning an `EventBus` yields another
/// handle to the same set of subscriptions.
///
/// ## Example
///
/// ```rust,no_run
/// use budgetkv::event::event_bus::EventBus;
///
/// let bus: EventBus<String> = EventBus::new();
/// let subscription = bus
///     .subscribe(|message| println!("received: {}", message))
///     .unwrap();
/// bus.fire("hello".to_string()).unwrap();
/// subscription.disconnect();
/// ```
pub struct EventBus<A> {
    inner: Arc<BusInner<A>>,
}

impl<A> Clone for EventBus<A> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<A> Default for EventBus<A> {
    fn default() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscriptions: Mutex::new(Some(Vec::new())),
                next_id: AtomicU64::new(1),
            }),
        }
    }
}

impl<A> fmt::Debug for EventBus<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let guard = self.inner.lock();
        f.debug_struct("EventBus")
            .field("destroyed", &guard.is_none())
            .field("subscribers", &guard.as_ref().map_or(0, Vec::len))
            .finish()
    }
}

impl<A> EventBus<A>
where
    A: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler that is invoked on every firing.
    pub fn subscribe<F>(&self, handler: F) -> EventResult<Subscription<A>>
    where
        F: Fn(A) + Send + Sync + 'static,
    {
        self.register(Arc::new(handler), false, false)
    }

    /// Registers a handler that is invoked on the next firing only.
    ///
    /// The subscription is removed from the bus as part of that firing.
    pub fn subscribe_once<F>(&self, handler: F) -> EventResult<Subscription<A>>
    where
        F: Fn(A) + Send + Sync + 'static,
    {
        self.register(Arc::new(handler), true, false)
    }

    /// Registers a handler that may run off the firing task.
    ///
    /// Inside a Tokio runtime the handler is spawned as its own task; outside of one
    /// it is invoked inline like any other handler.
    pub fn subscribe_concurrent<F>(&self, handler: F) -> EventResult<Subscription<A>>
    where
        F: Fn(A) + Send + Sync + 'static,
    {
        self.register(Arc::new(handler), false, true)
    }

    fn register(
        &self,
        handler: Handler<A>,
        fires_once: bool,
        concurrent: bool,
    ) -> EventResult<Subscription<A>> {
        let mut guard = self.inner.lock();
        let subscriptions = guard.as_mut().ok_or(EventError::Destroyed)?;
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        subscriptions.push(Arc::new(SubscriptionEntry {
            id,
            handler,
            fires_once,
            concurrent,
            fired: AtomicBool::new(false),
        }));
        trace!("Subscription {} registered (once: {}, concurrent: {})", id, fires_once, concurrent);

        Ok(Subscription {
            id,
            bus: Arc::downgrade(&self.inner),
            fires_once,
            concurrent,
        })
    }

    /// Suspends the caller until the bus next fires and returns the fired arguments.
    ///
    /// Internally this registers a one-shot subscription. If the returned future is
    /// dropped before the bus fires, that subscription stays registered until the
    /// next firing consumes it.
    ///
    /// # Errors
    ///
    /// * `EventError::Destroyed` - If the bus was destroyed before the call
    /// * `EventError::WaitAborted` - If the bus was destroyed while waiting
    pub async fn wait(&self) -> EventResult<A> {
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        self.subscribe_once(move |args| {
            if let Some(tx) = slot.lock().unwrap_or_else(PoisonError::into_inner).take() {
                let _ = tx.send(args);
            }
        })?;
        rx.await.map_err(|_| EventError::WaitAborted)
    }

    /// Invokes every live handler with a clone of `args`.
    ///
    /// Returns the number of handlers the firing was delivered to. Firing a bus
    /// with no subscriptions is a no-op. Handler failures are the handler's own
    /// concern; the bus does not trap them.
    pub fn fire(&self, args: A) -> EventResult<usize> {
        let snapshot = self
            .inner
            .lock()
            .as_ref()
            .ok_or(EventError::Destroyed)?
            .clone();

        let mut delivered = 0;
        for entry in snapshot {
            if entry.fires_once && entry.fired.swap(true, Ordering::AcqRel) {
                continue;
            }
            self.invoke(&entry, args.clone());
            if entry.fires_once {
                self.inner.remove(entry.id);
            }
            delivered += 1;
        }
        trace!("Fired to {} subscriber(s)", delivered);
        Ok(delivered)
    }

    fn invoke(&self, entry: &SubscriptionEntry<A>, args: A) {
        if entry.concurrent {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                let handler = Arc::clone(&entry.handler);
                runtime.spawn(async move { handler(args) });
                return;
            }
        }
        (entry.handler)(args);
    }

    /// Clears all subscriptions and makes the bus unusable.
    ///
    /// Pending [`EventBus::wait`] calls resolve with [`EventError::WaitAborted`].
    pub fn destroy(&self) {
        let removed = self.inner.lock().take();
        if let Some(subscriptions) = removed {
            debug!("EventBus destroyed with {} subscription(s)", subscriptions.len());
        }
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.lock().is_none()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().as_ref().map_or(0, Vec::len)
    }
}

/// A registration of one handler against an [`EventBus`].
///
/// Dropping a `Subscription` does not disconnect it; call [`Subscription::disconnect`].
pub struct Subscription<A> {
    id: u64,
    bus: Weak<BusInner<A>>,
    fires_once: bool,
    concurrent: bool,
}

impl<A> Subscription<A> {
    /// Removes the subscription from its bus. Calling it again is a no-op.
    pub fn disconnect(&self) {
        if let Some(bus) = self.bus.upgrade() {
            if bus.remove(self.id) {
                trace!("Subscription {} disconnected", self.id);
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.bus.upgrade().is_some_and(|bus| bus.contains(self.id))
    }

    pub fn fires_once(&self) -> bool {
        self.fires_once
    }

    pub fn is_concurrent(&self) -> bool {
        self.concurrent
    }
}

impl<A> fmt::Debug for Subscription<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("fires_once", &self.fires_once)
            .field("concurrent", &self.concurrent)
            .finish()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("Event bus has been destroyed")]
    Destroyed,
    #[error("Event bus was destroyed while waiting")]
    WaitAborted,
}

pub type EventResult<T> = Result<T, EventError>;
