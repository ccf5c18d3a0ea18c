//! Exchange and lookup errors

use courier_message::MessageError;
use courier_schema::ConversionError;
use std::sync::Arc;
use thiserror::Error;

/// Failure recorded on an exchange
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// Processing was interrupted; the exchange is also flagged as interrupted
    #[error("Interrupted while processing exchange")]
    Interrupted,

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Lookup(#[from] LookupError),

    #[error("{0}")]
    Processing(String),

    /// Any other failure, wrapped as is
    #[error("Wrapped failure: {0}")]
    Wrapped(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ExchangeError {
    /// Processing failure with a message
    pub fn processing(message: impl Into<String>) -> Self {
        ExchangeError::Processing(message.into())
    }

    /// Wrap an arbitrary error
    pub fn wrap<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ExchangeError::Wrapped(Box::new(error))
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, ExchangeError::Interrupted)
    }
}

/// Result type for exchange processing
pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Failure stored on an exchange, re-raised when extracting its result
#[derive(Debug, Clone, Error)]
#[error("Exchange {exchange_id} failed: {cause}")]
pub struct ExecutionError {
    pub exchange_id: String,
    #[source]
    pub cause: Arc<ExchangeError>,
}

/// Mandatory lookup failures
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LookupError {
    #[error("No '{name}' property available on exchange {exchange_id}")]
    NoSuchProperty { name: String, exchange_id: String },

    #[error("No '{name}' header available on exchange {exchange_id}")]
    NoSuchHeader { name: String, exchange_id: String },

    #[error("No '{name}' variable available on exchange {exchange_id}")]
    NoSuchVariable { name: String, exchange_id: String },

    #[error("VariableRepository with id: {0} does not exist")]
    UnknownVariableRepository(String),

    #[error(transparent)]
    Conversion(#[from] ConversionError),
}

/// Result type for lookups
pub type LookupResult<T> = Result<T, LookupError>;
