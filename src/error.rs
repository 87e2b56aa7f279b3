//! Custom error types for the sweep controller and its instrument links.
//!
//! This module defines the primary error type, `SweepError`, used across the crate.
//! Using the `thiserror` crate, it provides a centralized and consistent way to handle
//! the different kinds of failures that can occur while driving the signal generator
//! and reading the field probe.
//!
//! ## Error Hierarchy
//!
//! `SweepError` consolidates the following sources:
//!
//! - **`Config`**: Wraps errors from `figment` while layering the defaults, the TOML file
//!   and the environment.
//! - **`Configuration`**: Semantic errors in otherwise well-formed configuration, caught by
//!   `Settings::validate`.
//! - **`Io`**, **`Serial`**, **`Timeout`**, **`LinkClosed`**: transport faults. These are fatal
//!   to the link that raised them (see [`SweepError::is_transport`]).
//! - **`UnexpectedResponse`**, **`Probe`**: protocol faults. The link reports them and keeps running.
//! - **`CommandCancelled`**: a queued instrument command was flushed before it executed.
//! - **`InvalidSweep`**: sweep preconditions were not met.

use crate::probe::ProbeFault;
use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, SweepError>;

/// Every failure the crate reports.
#[derive(Error, Debug)]
pub enum SweepError {
    /// Layering or parsing the configuration failed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// A loaded value is out of range.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// Socket or file I/O.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Opening or configuring the probe port.
    #[error("Serial port error: {0}")]
    Serial(String),

    /// A generator round trip did not finish in time.
    #[error("Instrument round trip timed out after {0:?}")]
    Timeout(Duration),

    /// The link's task has stopped.
    #[error("Instrument link closed")]
    LinkClosed,

    /// Flushed by `clear_queue` before it ran.
    #[error("Command cancelled before execution")]
    CommandCancelled,

    /// A read-back that does not parse as the command's value.
    #[error("Unexpected response to '{command}': '{response}'")]
    UnexpectedResponse {
        /// Query that was sent.
        command: String,
        /// What came back.
        response: String,
    },

    /// Instrument-reported or instrument-level failure.
    #[error("Instrument error: {0}")]
    Instrument(String),

    /// Probe protocol fault.
    #[error("Probe error: {0}")]
    Probe(#[from] ProbeFault),

    /// Sweep preconditions not met.
    #[error("Invalid sweep: {0}")]
    InvalidSweep(String),
}

impl SweepError {
    /// Whether this error is a transport fault that should halt the link that raised it.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SweepError::Io(_) | SweepError::Serial(_) | SweepError::Timeout(_) | SweepError::LinkClosed
        )
    }
}

impl From<figment::Error> for SweepError {
    fn from(err: figment::Error) -> Self {
        SweepError::Config(Box::new(err))
    }
}

#[cfg(feature = "instrument_serial")]
impl From<tokio_serial::Error> for SweepError {
    fn from(err: tokio_serial::Error) -> Self {
        SweepError::Serial(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::ErrorCode;

    #[test]
    fn test_error_display() {
        let err = SweepError::Instrument("generator refused command".to_string());
        assert_eq!(err.to_string(), "Instrument error: generator refused command");
    }

    #[test]
    fn test_transport_classification() {
        assert!(SweepError::LinkClosed.is_transport());
        assert!(SweepError::Timeout(Duration::from_secs(5)).is_transport());
        assert!(!SweepError::CommandCancelled.is_transport());

        let protocol = SweepError::from(ProbeFault::Device(ErrorCode::Parity));
        assert!(!protocol.is_transport());
        assert_eq!(protocol.to_string(), "Probe error: Parity Error");
    }
}
