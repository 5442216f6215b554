//! Line-oriented transport to the analyzer.
//!
//! Protocol Overview:
//! - Format: ASCII, one command or response per line
//! - Terminator: LF (`\n`) on commands, LF or CRLF on responses
//! - Serial framing: 8N1, no flow control
//!
//! [`LineTransport`] wraps any `AsyncRead + AsyncWrite` stream, so the same
//! code path drives a real serial port (`tokio-serial`) and the in-memory
//! duplex used by the simulator and the tests. Opening a port goes through
//! the [`Connector`] trait for the same reason.

use crate::error::SessionError;
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

/// Line terminator appended to every command.
pub const LINE_TERMINATOR: &str = "\n";

/// Any byte stream usable as an analyzer link.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}
type DynSerial = Box<dyn SerialPortIO>;

/// Bidirectional, line-terminated byte channel with a read timeout.
pub struct LineTransport {
    port_name: String,
    io: BufReader<DynSerial>,
    read_timeout: Duration,
}

impl LineTransport {
    /// Wrap an already opened stream.
    pub fn new(
        port_name: impl Into<String>,
        io: impl SerialPortIO + 'static,
        read_timeout: Duration,
    ) -> Self {
        Self {
            port_name: port_name.into(),
            io: BufReader::new(Box::new(io)),
            read_timeout,
        }
    }

    /// Name of the port this transport was opened on.
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Send one command followed by the line terminator.
    pub async fn send_line(&mut self, command: &str) -> std::io::Result<()> {
        let line = format!("{}{}", command, LINE_TERMINATOR);
        let port = self.io.get_mut();
        port.write_all(line.as_bytes()).await?;
        port.flush().await
    }

    /// Drop any input that is already waiting, without blocking.
    ///
    /// Returns the number of bytes discarded.
    pub async fn discard_pending(&mut self) -> std::io::Result<usize> {
        let mut discarded = 0;
        loop {
            let available = match tokio::time::timeout(Duration::ZERO, self.io.fill_buf()).await {
                Ok(Ok(buf)) => buf.len(),
                Ok(Err(e)) => return Err(e),
                Err(_) => break,
            };
            if available == 0 {
                break;
            }
            self.io.consume(available);
            discarded += available;
        }
        if discarded > 0 {
            tracing::trace!(port = %self.port_name, discarded, "Discarded pending input");
        }
        Ok(discarded)
    }

    /// Read one line, waiting at most the read timeout.
    ///
    /// Returns whatever arrived before the timeout or end of stream, with
    /// surrounding whitespace and line terminators stripped. An empty string
    /// means nothing was read.
    pub async fn read_line(&mut self) -> std::io::Result<String> {
        let mut raw = Vec::new();
        let read = self.io.read_until(b'\n', &mut raw);
        let outcome = tokio::time::timeout(self.read_timeout, read).await;
        match outcome {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                // Partial data is kept in `raw`; read_until appends as it goes.
                tracing::trace!(
                    port = %self.port_name,
                    partial = raw.len(),
                    "Read timeout"
                );
            }
        }
        Ok(String::from_utf8_lossy(&raw).trim().to_string())
    }

    /// Shut down the write half and release the port.
    pub async fn close(mut self) -> std::io::Result<()> {
        self.io.get_mut().shutdown().await
    }
}

impl std::fmt::Debug for LineTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LineTransport")
            .field("port_name", &self.port_name)
            .field("read_timeout", &self.read_timeout)
            .finish_non_exhaustive()
    }
}

/// Opens transports for a session.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open `port` at `baud_rate`, reads bounded by `read_timeout`.
    ///
    /// # Errors
    /// Returns [`SessionError::PortOpen`] when the port cannot be opened.
    async fn open(
        &self,
        port: &str,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<LineTransport, SessionError>;
}

/// Connector for physical RS-232/USB-serial ports.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialConnector;

#[cfg(feature = "tokio_serial")]
#[async_trait]
impl Connector for SerialConnector {
    async fn open(
        &self,
        port: &str,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<LineTransport, SessionError> {
        use tokio_serial::SerialPortBuilderExt;

        let port_owned = port.to_string();

        // Opening can block on some platforms; keep it off the runtime threads.
        let stream = tokio::task::spawn_blocking(move || {
            tokio_serial::new(&port_owned, baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .timeout(read_timeout)
                .open_native_async()
        })
        .await
        .map_err(|e| SessionError::PortOpen {
            port: port.to_string(),
            source: std::io::Error::other(e),
        })?
        .map_err(|e| SessionError::PortOpen {
            port: port.to_string(),
            source: e.into(),
        })?;

        tracing::info!(port, baud_rate, "Serial port opened");
        Ok(LineTransport::new(port, stream, read_timeout))
    }
}

#[cfg(not(feature = "tokio_serial"))]
#[async_trait]
impl Connector for SerialConnector {
    async fn open(
        &self,
        _port: &str,
        _baud_rate: u32,
        _read_timeout: Duration,
    ) -> Result<LineTransport, SessionError> {
        Err(SessionError::SerialFeatureDisabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn send_line_appends_terminator() -> std::io::Result<()> {
        let (mut host, device) = tokio::io::duplex(64);
        let mut transport = LineTransport::new("test", device, Duration::from_millis(50));

        transport.send_line("*IDN?").await?;

        let mut buf = vec![0u8; 16];
        let n = host.read(&mut buf).await?;
        assert_eq!(&buf[..n], b"*IDN?\n");
        Ok(())
    }

    #[tokio::test]
    async fn read_line_strips_crlf() -> std::io::Result<()> {
        let (mut host, device) = tokio::io::duplex(64);
        let mut transport = LineTransport::new("test", device, Duration::from_millis(50));

        host.write_all(b"50.0,-30.0\r\nnext\n").await?;

        assert_eq!(transport.read_line().await?, "50.0,-30.0");
        assert_eq!(transport.read_line().await?, "next");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn read_line_times_out_empty() -> std::io::Result<()> {
        let (_host, device) = tokio::io::duplex(64);
        let mut transport = LineTransport::new("test", device, Duration::from_secs(1));

        assert_eq!(transport.read_line().await?, "");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn read_line_returns_partial_data_on_timeout() -> std::io::Result<()> {
        let (mut host, device) = tokio::io::duplex(64);
        let mut transport = LineTransport::new("test", device, Duration::from_secs(1));

        host.write_all(b"12.5,").await?;

        assert_eq!(transport.read_line().await?, "12.5,");
        Ok(())
    }

    #[tokio::test]
    async fn discard_pending_drops_buffered_lines_only() -> std::io::Result<()> {
        let (mut host, device) = tokio::io::duplex(64);
        let mut transport = LineTransport::new("test", device, Duration::from_millis(50));

        assert_eq!(transport.discard_pending().await?, 0);

        host.write_all(b"late,1\r\nlate,2\n").await?;
        assert_eq!(transport.discard_pending().await?, 15);

        host.write_all(b"fresh\n").await?;
        assert_eq!(transport.read_line().await?, "fresh");
        Ok(())
    }

    #[tokio::test]
    async fn read_line_at_end_of_stream_is_empty() -> std::io::Result<()> {
        let (host, device) = tokio::io::duplex(64);
        let mut transport = LineTransport::new("test", device, Duration::from_millis(50));
        drop(host);

        assert_eq!(transport.read_line().await?, "");
        Ok(())
    }

    #[tokio::test]
    async fn close_signals_end_of_stream() -> std::io::Result<()> {
        let (mut host, device) = tokio::io::duplex(64);
        let transport = LineTransport::new("test", device, Duration::from_millis(50));

        transport.close().await?;

        let mut buf = vec![0u8; 4];
        assert_eq!(host.read(&mut buf).await?, 0);
        Ok(())
    }

    #[cfg(not(feature = "tokio_serial"))]
    #[tokio::test]
    async fn serial_connector_requires_feature() {
        let result = SerialConnector
            .open("/dev/ttyUSB0", 9600, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(SessionError::SerialFeatureDisabled)));
    }
}
