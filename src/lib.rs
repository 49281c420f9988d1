//! # budgetkv: Budget-aware Access to a Remote Key-Value Store
//!
//! The remote store allows only a limited number of calls per operation category
//! in any time window. budgetkv lets callers issue ordinary typed calls and takes
//! care of holding them back until the budget allows them to run.
//!
//! ## Components
//!
//! ### 1. Event Bus
//! A small multi-subscriber notification primitive ([`event`]). Completions of
//! scheduled requests are delivered through it.
//!
//! ### 2. Request Scheduling
//! One queue per operation category and a periodic dispatch loop ([`request`]):
//! - Operation categories and payloads ([`request::operation`])
//! - Queue manager and dispatch loop ([`request::manager`])
//! - Result records ([`request::outcome`])
//!
//! ### 3. Collaborators
//! The backend store and the budget oracle are traits ([`store`]), with in-memory
//! implementations for local use and testing.
//!
//! ### 4. Facade
//! [`facade::ThrottledClient`] validates arguments, submits a request and waits for
//! the correlated completion.
//!
//! ## Request Lifecycle
//!
//! ```text
//! validate → queue (Queued) → tick + budget → execute (Executing) → fire completion (Completed)
//! ```
//!
//! Each request runs at most once and produces exactly one completion. Backend
//! failures are reported in the result, never raised to the caller.
//!
//! ## Configuration
//!
//! Limits and the optional call timeout live in [`config::ClientConfig`], which can
//! be loaded from a JSON file.

pub mod config;
pub mod error;
pub mod event;
pub mod facade;
pub mod request;
pub mod store;

pub use config::ClientConfig;
pub use error::*;
pub use event::event_bus::{EventBus, EventError, Subscription};
pub use facade::ThrottledClient;
pub use request::{
    manager::{Completion, RequestQueueManager},
    operation::{Operation, RequestCategory},
    outcome::{Outcome, RequestOutcome},
    pending::RequestId,
    RequestError, RequestResult,
};
pub use store::{
    backend::{KeyValueBackend, StoreError},
    budget::{BudgetOracle, FixedBudget, WindowBudget},
    in_memory::InMemoryBackend,
};
