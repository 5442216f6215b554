//! # LCR Sweep Acquisition Library
//!
//! Drives a benchtop LCR / impedance analyzer over a serial line: opens the
//! port, identifies and configures the instrument, sweeps a list of test
//! frequencies collecting one `(A, B)` reading per frequency, and always
//! hands the instrument back to front-panel control when it is done.
//!
//! ## Crate Structure
//!
//! - **`config`**: figment-based loading of [`config::SweepConfig`] from
//!   defaults, TOML and `LCR_SWEEP_*` environment variables.
//! - **`error`**: [`error::SessionError`] and [`error::ConfigError`].
//! - **`logging`**: `tracing-subscriber` initialization.
//! - **`transport`**: line-oriented serial transport and the
//!   [`transport::Connector`] seam that opens it.
//! - **`protocol`**: wire commands and the settle-delayed
//!   [`protocol::ProtocolClient`].
//! - **`response`**: classification of measurement replies.
//! - **`sweep`**: the per-frequency acquisition loop and its retry policy.
//! - **`session`**: the full open / identify / configure / sweep / restore
//!   lifecycle.
//! - **`sample`** and **`sink`**: sweep output and live sample delivery.
//! - **`simulator`**: an in-process analyzer for tests and demos.

pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod response;
pub mod sample;
pub mod session;
pub mod simulator;
pub mod sink;
pub mod sweep;
pub mod transport;

pub use config::{AppConfig, SweepConfig};
pub use error::{ConfigError, SessionError};
pub use sample::{Sample, SweepResult};
pub use session::SessionController;
pub use sink::SampleSink;
pub use sweep::RetryPolicy;
