//! Custom error types for the acquisition engine.
//!
//! This module defines the two error enums used across the crate. Using the
//! `thiserror` crate, it provides a centralized and consistent way to report
//! what went wrong, from a serial port that refused to open to a frequency
//! that never produced a usable reading.
//!
//! ## Error Hierarchy
//!
//! `SessionError` covers everything that can end a sweep:
//!
//! - **`PortOpen`**: the transport could not be opened (bad name, permissions,
//!   device absent). No command is ever sent.
//! - **`Identification`**: the instrument did not answer `*IDN?`. The session
//!   still returns the instrument to local mode and closes the port.
//! - **`TransportNotOpen`**: a command was issued without an attached port.
//! - **`FrequencyTimeout`**: a bounded retry policy gave up on one frequency.
//! - **`Verification`**: strict mode read back a setting that does not match.
//! - **`Io`**: any other transport failure, wrapped as-is.
//! - **`SerialFeatureDisabled`**: a real port was requested in a build
//!   without the `tokio_serial` feature.
//!
//! Transient fetch failures (empty reply, `cmd err`, malformed pair) are not
//! errors at all: the sweep engine logs and retries them.
//!
//! `ConfigError` is kept separate because configuration is resolved before
//! any session exists.

use thiserror::Error;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Failed to open serial port '{port}': {source}")]
    PortOpen {
        port: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Instrument on '{port}' did not answer *IDN? (device not responding or wrong protocol)")]
    Identification { port: String },

    #[error("Serial port not connected")]
    TransportNotOpen,

    #[error("No valid reading at {frequency} Hz after {attempts} attempts")]
    FrequencyTimeout { frequency: f64, attempts: u32 },

    #[error("Setting '{setting}' read back as '{actual}', expected '{expected}'")]
    Verification {
        setting: String,
        expected: String,
        actual: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial support not enabled. Rebuild with --features tokio_serial")]
    SerialFeatureDisabled,
}

impl SessionError {
    /// Whether the instrument was reached before the failure.
    ///
    /// Port and feature failures happen before anything is sent, so there is
    /// nothing to restore on the device side.
    pub fn reached_instrument(&self) -> bool {
        !matches!(
            self,
            SessionError::PortOpen { .. } | SessionError::SerialFeatureDisabled
        )
    }
}

/// Errors raised while loading or validating configuration.
#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(value: figment::Error) -> Self {
        ConfigError::Load(Box::new(value))
    }
}
