//! Session controller: one complete, safely torn-down sweep.
//!
//! Lifecycle of [`SessionController::run_sweep`]:
//!
//! 1. open the transport (`PortOpen` on failure, nothing is sent)
//! 2. settle, then identify with `*IDN?` (`Identification` on silence)
//! 3. push configuration: remote mode, fast aperture, DC bias, AC level,
//!    functions R / THR, auto-range. Fire-and-forget, replies not inspected
//! 4. optionally (strict mode) read the settings back
//! 5. run the sweep engine
//! 6. always: return to local mode and close the transport
//!
//! Step 6 runs whenever step 1 succeeded, including after an error or a
//! panic in steps 2-5. Failures during step 6 are logged only; they never
//! replace the error that ended the sweep.

use crate::config::SweepConfig;
use crate::error::SessionError;
use crate::protocol::{commands, CommandChannel, ProtocolClient};
use crate::sample::SweepResult;
use crate::sink::SampleSink;
use crate::sweep::SweepEngine;
use crate::transport::{Connector, SerialConnector};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tracing::Instrument;

/// Runs sweeps on ports opened through a [`Connector`].
#[derive(Debug, Clone, Default)]
pub struct SessionController<C = SerialConnector> {
    connector: C,
}

impl SessionController<SerialConnector> {
    /// Controller for physical serial ports.
    pub fn serial() -> Self {
        Self::new(SerialConnector)
    }
}

impl<C: Connector> SessionController<C> {
    /// Create a controller over `connector`.
    pub fn new(connector: C) -> Self {
        Self { connector }
    }

    /// Connector used to open ports.
    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Run exactly one sweep described by `config`.
    ///
    /// Accepted samples are pushed to `sink` as they arrive; the complete
    /// result is returned only if every frequency produced a sample.
    ///
    /// # Errors
    /// - [`SessionError::PortOpen`] if the port cannot be opened
    /// - [`SessionError::Identification`] if `*IDN?` gets no answer
    /// - [`SessionError::Verification`] if strict mode finds a mismatch
    /// - [`SessionError::FrequencyTimeout`] if a bounded retry policy gives up
    /// - [`SessionError::Io`] for any other transport failure
    pub async fn run_sweep<S>(
        &self,
        config: &SweepConfig,
        sink: &mut S,
    ) -> Result<SweepResult, SessionError>
    where
        S: SampleSink + ?Sized,
    {
        let span = tracing::info_span!("sweep", port = %config.port, baud_rate = config.baud_rate);
        self.run_sweep_inner(config, sink).instrument(span).await
    }

    async fn run_sweep_inner<S>(
        &self,
        config: &SweepConfig,
        sink: &mut S,
    ) -> Result<SweepResult, SessionError>
    where
        S: SampleSink + ?Sized,
    {
        let transport = self
            .connector
            .open(&config.port, config.baud_rate, config.timing.read_timeout)
            .await?;

        let mut client = ProtocolClient::with_transport(transport, config.timing.settle_delay);

        let outcome = AssertUnwindSafe(drive(&mut client, config, sink))
            .catch_unwind()
            .await;

        finalize(&mut client).await;

        match outcome {
            Ok(Ok(result)) => {
                tracing::info!(samples = result.len(), "Sweep complete");
                Ok(result)
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Sweep failed");
                Err(e)
            }
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

/// Identify, configure, verify and sweep on an open channel.
async fn drive<C, S>(
    client: &mut C,
    config: &SweepConfig,
    sink: &mut S,
) -> Result<SweepResult, SessionError>
where
    C: CommandChannel + ?Sized,
    S: SampleSink + ?Sized,
{
    client.settle().await;
    let idn = client.query(commands::IDN).await?;
    if idn.is_empty() {
        tracing::error!("No response to *IDN?");
        return Err(SessionError::Identification {
            port: config.port.clone(),
        });
    }
    tracing::info!(idn = %idn, "Instrument identified");
    client.settle().await;

    configure(client, config).await?;
    if config.strict {
        verify(client, config).await?;
    }

    SweepEngine::new(config.retry)
        .sweep(client, &config.frequencies, sink)
        .await
}

/// Push measurement settings. Replies are not inspected.
pub async fn configure<C>(client: &mut C, config: &SweepConfig) -> Result<(), SessionError>
where
    C: CommandChannel + ?Sized,
{
    client.write(commands::REMOTE).await?;
    client.write(commands::APERTURE_FAST).await?;
    client.write(&commands::bias_voltage(config.dc_bias_mv)).await?;
    client.write(&commands::voltage_level(config.ac_level_mv)).await?;
    client.write(commands::FUNCTION_A_R).await?;
    client.write(commands::FUNCTION_B_THR).await?;
    client.write(commands::RANGE_AUTO_ON).await?;
    tracing::info!(
        dc_bias_mv = config.dc_bias_mv,
        ac_level_mv = config.ac_level_mv,
        "Instrument configured"
    );
    Ok(())
}

/// Read back the configured settings and fail on the first mismatch.
pub async fn verify<C>(client: &mut C, config: &SweepConfig) -> Result<(), SessionError>
where
    C: CommandChannel + ?Sized,
{
    let bias = client.query(commands::BIAS_QUERY).await?;
    check(
        "bias_voltage",
        config.dc_bias_mv.to_string(),
        &bias,
        millivolts_match(&bias, config.dc_bias_mv),
    )?;

    let level = client.query(commands::LEVEL_QUERY).await?;
    check(
        "voltage_level",
        config.ac_level_mv.to_string(),
        &level,
        millivolts_match(&level, config.ac_level_mv),
    )?;

    let function_a = client.query(commands::FUNCTION_A_QUERY).await?;
    check("function_a", "R".into(), &function_a, function_a.eq_ignore_ascii_case("R"))?;

    let function_b = client.query(commands::FUNCTION_B_QUERY).await?;
    check(
        "function_b",
        "THR".into(),
        &function_b,
        function_b.eq_ignore_ascii_case("THR"),
    )?;

    tracing::info!("Instrument settings verified");
    Ok(())
}

fn check(setting: &str, expected: String, actual: &str, ok: bool) -> Result<(), SessionError> {
    if ok {
        return Ok(());
    }
    tracing::error!(setting, expected = %expected, actual, "Read-back mismatch");
    Err(SessionError::Verification {
        setting: setting.to_string(),
        expected,
        actual: actual.to_string(),
    })
}

/// A voltage read-back matches when it equals the setting in mV or in V.
fn millivolts_match(reply: &str, millivolts: i32) -> bool {
    let Ok(value) = reply.trim().parse::<f64>() else {
        return false;
    };
    let expected = f64::from(millivolts);
    (value - expected).abs() < 1e-6 || (value * 1000.0 - expected).abs() < 1e-3
}

/// Return the instrument to local mode and close the transport.
async fn finalize(client: &mut ProtocolClient) {
    if let Err(e) = client.write(commands::LOCAL).await {
        tracing::warn!(error = %e, "Failed to return instrument to local mode");
    }
    if let Some(transport) = client.take_transport() {
        let port = transport.port_name().to_string();
        match transport.close().await {
            Ok(()) => tracing::info!("Serial port {} closed", port),
            Err(e) => tracing::warn!(error = %e, "Failed to close serial port {}", port),
        }
    }
}
