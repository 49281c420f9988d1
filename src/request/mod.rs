//! # Budget-aware Request Scheduling
//!
//! Requests flow through the scheduler like this:
//!
//! ```text
//! ┌──────┐ validate ┌───────────────────┐ tick (500ms) ┌─────────────┐
//! │Facade│─────────▶│Category queue (11)│─────────────▶│BudgetOracle │
//! └──┬───┘  submit  └───────────────────┘  budget > 0  └──────┬──────┘
//!    │                                                        │ spawn
//!    │       Completion { request_id, outcome }        ┌──────▼──────┐
//!    └◀────────────────── EventBus ◀───────────────────│  Backend    │
//!                                                      └─────────────┘
//! ```
//!
//! - [`operation`]: the closed set of categories and their typed parameters
//! - [`pending`]: queued requests, correlation ids and their lifecycle
//! - [`outcome`]: the result record delivered for every request
//! - [`manager`]: queues, the dispatch loop and completion delivery

pub mod manager;
pub mod operation;
pub mod outcome;
pub mod pending;

use thiserror::Error;

use crate::event::event_bus::EventError;

use self::pending::RequestId;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RequestError {
    #[error("Invalid argument `{param}`: {reason}")]
    InvalidArgument { param: &'static str, reason: String },
    #[error("Request timed out: {0}")]
    Timeout(RequestId),
    #[error("Completion channel closed")]
    ChannelClosed,
    #[error("Event bus error: {0}")]
    Event(#[from] EventError),
}

impl RequestError {
    pub fn invalid_argument(param: &'static str, reason: impl Into<String>) -> Self {
        RequestError::InvalidArgument {
            param,
            reason: reason.into(),
        }
    }
}

pub type RequestResult<T> = Result<T, RequestError>;
