//! Dispatcher error types.

use thiserror::Error;
use tip_bus::error::BusError;
use tip_core::error::DomainError;

/// Errors that abort a dispatcher operation.
///
/// Per-row publish and mark failures are not errors of the cycle; they are
/// recorded against the row and reported in the cycle report.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The outbox or event store could not be read.
    #[error("store error: {0}")]
    Store(#[from] DomainError),

    /// The bus could not be reached.
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
}
