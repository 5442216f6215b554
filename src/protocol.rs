//! Instrument protocol client.
//!
//! The analyzer speaks a small SCPI-like ASCII dialect. Configuration
//! commands are fire-and-forget: the instrument gives no reliable
//! acknowledgement, so [`ProtocolClient::write`] never reads. Queries read
//! exactly one line. Every exchange is followed by a fixed settle delay that
//! gives the instrument time to process the command.
//!
//! A query that times out, or reaches end of stream, yields an empty string
//! rather than an error, because the sweep engine retries those instead of
//! aborting. A broken link (write or read I/O failure) is an error.

use crate::error::SessionError;
use crate::transport::LineTransport;
use async_trait::async_trait;
use std::time::Duration;

/// Wire commands understood by the analyzer.
pub mod commands {
    /// Identification query
    pub const IDN: &str = "*IDN?";
    /// Enter remote control mode
    pub const REMOTE: &str = "SYSTEM:REMOTE";
    /// Return to front-panel control
    pub const LOCAL: &str = "SYSTEM:LOCAL";
    /// Fastest integration time
    pub const APERTURE_FAST: &str = "APERTURE FAST";
    /// Measurement function A: resistance / real part
    pub const FUNCTION_A_R: &str = "FUNCTION:IMPEDANCE:A R";
    /// Measurement function B: theta
    pub const FUNCTION_B_THR: &str = "FUNCTION:IMPEDANCE:B THR";
    /// Automatic range selection
    pub const RANGE_AUTO_ON: &str = "FUNCTION:IMPEDANCE:RANGE:AUTO ON";
    /// Fetch the latest reading
    pub const FETCH: &str = "FETCH?";
    /// Trigger and read an impedance measurement
    pub const MEASURE_IMPEDANCE: &str = "MEAS:IMP?";
    /// DC bias read-back
    pub const BIAS_QUERY: &str = "BIAS:VOLTAGE?";
    /// AC level read-back
    pub const LEVEL_QUERY: &str = "VOLTAGE:LEVEL?";
    /// Function A read-back
    pub const FUNCTION_A_QUERY: &str = "FUNCTION:IMPEDANCE:A?";
    /// Function B read-back
    pub const FUNCTION_B_QUERY: &str = "FUNCTION:IMPEDANCE:B?";

    /// DC bias in millivolts.
    pub fn bias_voltage(millivolts: i32) -> String {
        format!("BIAS:VOLTAGE {}", millivolts)
    }

    /// AC test level in millivolts.
    pub fn voltage_level(millivolts: i32) -> String {
        format!("VOLTAGE:LEVEL {}", millivolts)
    }

    /// Test frequency in hertz.
    pub fn frequency(hz: f64) -> String {
        format!("FREQUENCY {}", hz)
    }
}

/// Command/response seam between the engine and the instrument link.
///
/// Implemented by [`ProtocolClient`]; tests substitute scripted channels.
#[async_trait]
pub trait CommandChannel: Send {
    /// Send a command without reading a response.
    async fn write(&mut self, command: &str) -> Result<(), SessionError>;

    /// Send a command and read one stripped line.
    ///
    /// Empty when no transport is held or nothing arrived before the read
    /// timeout.
    ///
    /// # Errors
    /// [`SessionError::Io`] when writing the command or reading the reply fails.
    async fn query(&mut self, command: &str) -> Result<String, SessionError>;

    /// Wait one settle delay.
    async fn settle(&mut self);
}

/// Protocol client over an optional [`LineTransport`].
#[derive(Debug)]
pub struct ProtocolClient {
    transport: Option<LineTransport>,
    settle_delay: Duration,
}

impl ProtocolClient {
    /// Create a client that owns `transport`.
    pub fn with_transport(transport: LineTransport, settle_delay: Duration) -> Self {
        Self {
            transport: Some(transport),
            settle_delay,
        }
    }

    /// Detach and return the transport, if any.
    pub fn take_transport(&mut self) -> Option<LineTransport> {
        self.transport.take()
    }
}

#[async_trait]
impl CommandChannel for ProtocolClient {
    async fn write(&mut self, command: &str) -> Result<(), SessionError> {
        let transport = self
            .transport
            .as_mut()
            .ok_or(SessionError::TransportNotOpen)?;

        transport.send_line(command).await?;
        tracing::debug!(command, "Sent");
        tokio::time::sleep(self.settle_delay).await;
        Ok(())
    }

    async fn query(&mut self, command: &str) -> Result<String, SessionError> {
        let Some(transport) = self.transport.as_mut() else {
            tracing::warn!(command, "Query without an open serial port");
            return Ok(String::new());
        };

        // A reply that arrived after an earlier timeout must not be taken
        // as the answer to this command.
        let stale = transport.discard_pending().await?;
        if stale > 0 {
            tracing::warn!(command, bytes = stale, "Discarded late input before query");
        }

        transport.send_line(command).await?;
        tokio::time::sleep(self.settle_delay).await;

        let response = transport.read_line().await?;
        tracing::debug!(command, response = %response, "Query");
        Ok(response)
    }

    async fn settle(&mut self) {
        tokio::time::sleep(self.settle_delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn client_pair(read_timeout: Duration) -> (ProtocolClient, tokio::io::DuplexStream) {
        let (host, device) = tokio::io::duplex(256);
        let transport = LineTransport::new("test", device, read_timeout);
        (
            ProtocolClient::with_transport(transport, Duration::ZERO),
            host,
        )
    }

    #[test]
    fn test_command_formatting() {
        assert_eq!(commands::bias_voltage(0), "BIAS:VOLTAGE 0");
        assert_eq!(commands::voltage_level(300), "VOLTAGE:LEVEL 300");
        assert_eq!(commands::frequency(100.0), "FREQUENCY 100");
        assert_eq!(commands::frequency(100_000.0), "FREQUENCY 100000");
        assert_eq!(commands::frequency(1234.5), "FREQUENCY 1234.5");
    }

    fn detached_client() -> ProtocolClient {
        ProtocolClient {
            transport: None,
            settle_delay: Duration::ZERO,
        }
    }

    #[tokio::test]
    async fn write_without_transport_fails() {
        let mut client = detached_client();
        let result = client.write(commands::REMOTE).await;
        assert!(matches!(result, Err(SessionError::TransportNotOpen)));
    }

    #[tokio::test]
    async fn query_without_transport_is_empty() -> anyhow::Result<()> {
        let mut client = detached_client();
        assert_eq!(client.query(commands::IDN).await?, "");
        Ok(())
    }

    #[tokio::test]
    async fn write_sends_line_and_reads_nothing() -> anyhow::Result<()> {
        let (mut client, host) = client_pair(Duration::from_millis(50));
        let mut host = BufReader::new(host);

        client.write("APERTURE FAST").await?;

        let mut line = String::new();
        host.read_line(&mut line).await?;
        assert_eq!(line, "APERTURE FAST\n");
        Ok(())
    }

    #[tokio::test]
    async fn query_returns_stripped_line() -> anyhow::Result<()> {
        let (mut client, mut host) = client_pair(Duration::from_millis(500));
        host.write_all(b"ET4410,V1.00  \r\n").await?;

        assert_eq!(client.query(commands::IDN).await?, "ET4410,V1.00");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn query_timeout_is_empty() -> anyhow::Result<()> {
        let (mut client, _host) = client_pair(Duration::from_secs(1));
        assert_eq!(client.query(commands::FETCH).await?, "");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn query_on_broken_link_fails_without_waiting() {
        let (host, device) = tokio::io::duplex(256);
        let transport = LineTransport::new("test", device, Duration::from_secs(1));
        let mut client = ProtocolClient::with_transport(transport, Duration::from_secs(1));
        drop(host);

        let start = tokio::time::Instant::now();
        let result = client.query(commands::FETCH).await;

        match result {
            Err(SessionError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::BrokenPipe),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn late_reply_is_not_taken_for_next_query() -> anyhow::Result<()> {
        let (mut client, host) = client_pair(Duration::from_secs(1));
        let (host_read, mut host_write) = tokio::io::split(host);
        let mut host_read = BufReader::new(host_read);

        // First query times out; its reply shows up afterwards.
        assert_eq!(client.query(commands::FETCH).await?, "");
        host_write.write_all(b"1.0,2.0\n").await?;
        tokio::task::yield_now().await;

        let device = tokio::spawn(async move {
            let mut line = String::new();
            // FETCH? from the first query, then the second one
            host_read.read_line(&mut line).await?;
            line.clear();
            host_read.read_line(&mut line).await?;
            host_write.write_all(b"3.0,4.0\n").await?;
            Ok::<_, std::io::Error>(line)
        });

        assert_eq!(client.query(commands::FETCH).await?, "3.0,4.0");
        assert_eq!(device.await??, "FETCH?\n");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn write_waits_settle_delay() -> anyhow::Result<()> {
        let (host, device) = tokio::io::duplex(256);
        let transport = LineTransport::new("test", device, Duration::from_secs(1));
        let mut client = ProtocolClient::with_transport(transport, Duration::from_secs(1));

        let start = tokio::time::Instant::now();
        client.write(commands::REMOTE).await?;
        assert!(start.elapsed() >= Duration::from_secs(1));
        drop(host);
        Ok(())
    }

    #[tokio::test]
    async fn take_transport_closes_client() {
        let (mut client, _host) = client_pair(Duration::from_millis(50));
        assert!(client.take_transport().is_some());
        assert!(client.take_transport().is_none());
        assert!(matches!(
            client.write(commands::LOCAL).await,
            Err(SessionError::TransportNotOpen)
        ));
    }
}
