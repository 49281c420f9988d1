use thiserror::Error;

use crate::config::ConfigError;
use crate::event::event_bus::EventError;
use crate::request::RequestError;
use crate::store::backend::StoreError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Request error: {0}")]
    Request(#[from] RequestError),
    #[error("Event error: {0}")]
    Event(#[from] EventError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type InternalResult<T> = Result<T, Error>;

impl Error {
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Error::Internal(message.into())
    }
}
