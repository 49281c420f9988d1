use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tokio::time::Instant;

use crate::store::backend::KeyValueBackend;

use super::operation::{Operation, RequestCategory};

/// Correlation identifier binding a submitted request to its completion.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(String);

impl RequestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Mints `R_<n>` identifiers from a monotonically increasing counter.
///
/// Identifiers are never reused for the lifetime of the generator.
#[derive(Debug, Default)]
pub struct RequestIdGenerator {
    counter: AtomicU64,
}

impl RequestIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mint(&self) -> RequestId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        RequestId(format!("R_{}", n))
    }
}

/// Lifecycle of a pending request: `Queued -> Executing -> Completed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Queued,
    Executing,
    Completed,
}

/// One queued storage operation.
pub struct PendingRequest {
    id: RequestId,
    operation: Operation,
    backend: Arc<dyn KeyValueBackend>,
    state: RequestState,
    submitted_at: Instant,
}

impl PendingRequest {
    pub fn new(id: RequestId, backend: Arc<dyn KeyValueBackend>, operation: Operation) -> Self {
        Self {
            id,
            operation,
            backend,
            state: RequestState::Queued,
            submitted_at: Instant::now(),
        }
    }

    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn category(&self) -> RequestCategory {
        self.operation.category()
    }

    pub fn key(&self) -> Option<&str> {
        self.operation.key()
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn is_queued(&self) -> bool {
        self.state == RequestState::Queued
    }

    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    /// Moves the request from `Queued` to `Executing` and hands out what the
    /// execution needs. Returns `None` if the request is not queued.
    pub fn begin_execution(&mut self) -> Option<(Operation, Arc<dyn KeyValueBackend>)> {
        if self.state != RequestState::Queued {
            return None;
        }
        self.state = RequestState::Executing;
        Some((self.operation.clone(), Arc::clone(&self.backend)))
    }

    /// Moves the request from `Executing` to `Completed`. Returns `false` if it was
    /// not executing.
    pub fn complete(&mut self) -> bool {
        if self.state != RequestState::Executing {
            return false;
        }
        self.state = RequestState::Completed;
        true
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("operation", &self.operation)
            .field("backend", &self.backend.name())
            .field("state", &self.state)
            .finish()
    }
}
