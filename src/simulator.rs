//! Simulated impedance analyzer for testing without hardware.
//!
//! [`SimulatedConnector`] implements [`Connector`] by spawning a
//! [`SimulatedAnalyzer`] task on the far end of an in-memory duplex pipe.
//! The task speaks the same line protocol as the real instrument:
//!
//! - only queries (commands ending in `?`) get a reply
//! - `FETCH?`/`MEAS:IMP?` report R and θ (radians) of a series RLC model
//!   at the last `FREQUENCY` set
//! - settings written with `BIAS:VOLTAGE`, `VOLTAGE:LEVEL` and
//!   `FUNCTION:IMPEDANCE:A/B` can be read back; voltages come back in volts
//! - unknown queries get `cmd err`
//!
//! Replies can be scripted per command to inject failures, the link can be
//! cut after a number of commands, and every received command is recorded
//! for verification.
//!
//! # Example
//!
//! ```
//! use lcr_sweep::simulator::{SimulatedAnalyzer, SimulatedConnector};
//! use lcr_sweep::{config::SweepConfig, session::SessionController};
//! use std::time::Duration;
//!
//! # tokio_test::block_on(async {
//! let connector = SimulatedConnector::new(SimulatedAnalyzer::new());
//! let controller = SessionController::new(connector);
//!
//! let mut config = SweepConfig::default();
//! config.frequencies = vec![100.0, 1000.0];
//! config.timing.settle_delay = Duration::ZERO;
//!
//! let mut samples = Vec::new();
//! let result = controller.run_sweep(&config, &mut samples).await.unwrap();
//! assert_eq!(result.frequencies(), vec![100.0, 1000.0]);
//! # })
//! ```

use crate::error::SessionError;
use crate::protocol::commands;
use crate::response::{CMD_ERR, EXEC_SUCCESS};
use crate::transport::{Connector, LineTransport};
use async_trait::async_trait;
use num_complex::Complex64;
use std::collections::{HashMap, VecDeque};
use std::f64::consts::PI;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, ReadBuf,
};
use tokio::task::JoinHandle;

/// Identification string reported by default.
pub const DEFAULT_IDN: &str = "ET4410,SIM00001,V1.00";

const PIPE_CAPACITY: usize = 4096;

/// Series RLC load attached to the simulated test fixture.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImpedanceModel {
    /// Series resistance in ohms
    pub resistance: f64,
    /// Series capacitance in farads (zero means no capacitor)
    pub capacitance: f64,
    /// Series inductance in henries
    pub inductance: f64,
}

impl Default for ImpedanceModel {
    fn default() -> Self {
        // 100 Ω in series with 1 µF: clearly capacitive at the low end of the
        // sweep and nearly resistive at 100 kHz.
        Self {
            resistance: 100.0,
            capacitance: 1e-6,
            inductance: 0.0,
        }
    }
}

impl ImpedanceModel {
    /// Complex impedance at `frequency` hertz.
    pub fn impedance(&self, frequency: f64) -> Complex64 {
        let omega = 2.0 * PI * frequency;
        let mut z = Complex64::new(self.resistance, omega * self.inductance);
        if self.capacitance > 0.0 && omega > 0.0 {
            z += Complex64::new(0.0, -1.0 / (omega * self.capacitance));
        }
        z
    }

    /// `(R, θ)` at `frequency`, θ in radians.
    pub fn reading(&self, frequency: f64) -> (f64, f64) {
        let z = self.impedance(frequency);
        (z.re, z.arg())
    }
}

/// One scripted answer to a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedReply {
    /// Send this line
    Line(String),
    /// Send nothing; the client read times out
    Silent,
}

impl From<&str> for ScriptedReply {
    fn from(line: &str) -> Self {
        ScriptedReply::Line(line.to_string())
    }
}

/// Behavior of a simulated instrument.
///
/// Cloned for every opened connection, so scripted replies are consumed per
/// connection.
#[derive(Debug, Clone)]
pub struct SimulatedAnalyzer {
    idn: Option<String>,
    model: ImpedanceModel,
    busy_fetches: u32,
    disconnect_after: Option<usize>,
    scripts: HashMap<String, VecDeque<ScriptedReply>>,
}

impl Default for SimulatedAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedAnalyzer {
    /// Well-behaved analyzer with the default load.
    pub fn new() -> Self {
        Self {
            idn: Some(DEFAULT_IDN.to_string()),
            model: ImpedanceModel::default(),
            busy_fetches: 0,
            disconnect_after: None,
            scripts: HashMap::new(),
        }
    }

    /// Never answer `*IDN?`.
    pub fn without_idn(mut self) -> Self {
        self.idn = None;
        self
    }

    /// Answer the first `count` `FETCH?` queries after every frequency
    /// change with `exec success`, like an instrument still measuring.
    pub fn with_busy_fetches(mut self, count: u32) -> Self {
        self.busy_fetches = count;
        self
    }

    /// Drop the link after handling `count` commands, like a pulled
    /// cable. Later writes from the host fail with `BrokenPipe`.
    pub fn disconnect_after(mut self, count: usize) -> Self {
        self.disconnect_after = Some(count);
        self
    }

    /// Queue scripted replies for `command`. They are used in order before
    /// falling back to the default behavior.
    pub fn script<I, R>(mut self, command: &str, replies: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<ScriptedReply>,
    {
        self.scripts
            .entry(command.to_string())
            .or_default()
            .extend(replies.into_iter().map(Into::into));
        self
    }

    fn respond(&mut self, state: &mut DeviceState, command: &str) -> Option<String> {
        state.apply(command, self.busy_fetches);
        if !command.ends_with('?') {
            return None;
        }

        if let Some(reply) = self
            .scripts
            .get_mut(command)
            .and_then(|queue| queue.pop_front())
        {
            return match reply {
                ScriptedReply::Line(line) => Some(line),
                ScriptedReply::Silent => None,
            };
        }

        match command {
            commands::IDN => self.idn.clone(),
            commands::FETCH if state.busy_remaining > 0 => {
                state.busy_remaining -= 1;
                Some(EXEC_SUCCESS.to_string())
            }
            commands::FETCH | commands::MEASURE_IMPEDANCE => {
                let (r, theta) = self.model.reading(state.frequency);
                Some(format!("{:+.5E},{:+.5E}", r, theta))
            }
            commands::BIAS_QUERY => Some(volts(state.bias_mv)),
            commands::LEVEL_QUERY => Some(volts(state.level_mv)),
            commands::FUNCTION_A_QUERY => Some(state.function_a.clone()),
            commands::FUNCTION_B_QUERY => Some(state.function_b.clone()),
            _ => Some(CMD_ERR.to_string()),
        }
    }
}

fn volts(millivolts: i32) -> String {
    format!("{}", f64::from(millivolts) / 1000.0)
}

/// Instrument-side settings changed by commands.
#[derive(Debug, Clone)]
struct DeviceState {
    frequency: f64,
    bias_mv: i32,
    level_mv: i32,
    function_a: String,
    function_b: String,
    busy_remaining: u32,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            frequency: 1000.0,
            bias_mv: 0,
            level_mv: 1000,
            function_a: "Z".to_string(),
            function_b: "THD".to_string(),
            busy_remaining: 0,
        }
    }
}

impl DeviceState {
    fn apply(&mut self, command: &str, busy_fetches: u32) {
        let Some((head, arg)) = command.split_once(' ') else {
            return;
        };
        let arg = arg.trim();
        match head {
            "FREQUENCY" => {
                if let Ok(hz) = arg.parse() {
                    self.frequency = hz;
                    self.busy_remaining = busy_fetches;
                }
            }
            "BIAS:VOLTAGE" => {
                if let Ok(mv) = arg.parse() {
                    self.bias_mv = mv;
                }
            }
            "VOLTAGE:LEVEL" => {
                if let Ok(mv) = arg.parse() {
                    self.level_mv = mv;
                }
            }
            "FUNCTION:IMPEDANCE:A" => self.function_a = arg.to_string(),
            "FUNCTION:IMPEDANCE:B" => self.function_b = arg.to_string(),
            _ => {}
        }
    }
}

/// Everything the simulated instrument observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimulatorLog {
    /// Received command lines, in order, across all connections
    pub commands: Vec<String>,
    /// Connections opened
    pub opens: usize,
    /// Connections closed by the host
    pub closes: usize,
}

impl SimulatorLog {
    /// Number of times `command` was received.
    pub fn count(&self, command: &str) -> usize {
        self.commands.iter().filter(|c| c.as_str() == command).count()
    }

    /// Index of the first occurrence of `command`.
    pub fn position(&self, command: &str) -> Option<usize> {
        self.commands.iter().position(|c| c == command)
    }
}

/// [`Connector`] backed by in-process [`SimulatedAnalyzer`] tasks.
#[derive(Debug)]
pub struct SimulatedConnector {
    analyzer: SimulatedAnalyzer,
    open_error: Option<std::io::ErrorKind>,
    log: Arc<Mutex<SimulatorLog>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SimulatedConnector {
    /// Connector whose ports all lead to clones of `analyzer`.
    pub fn new(analyzer: SimulatedAnalyzer) -> Self {
        Self {
            analyzer,
            open_error: None,
            log: Arc::new(Mutex::new(SimulatorLog::default())),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Connector whose every open fails with `kind`.
    pub fn failing(kind: std::io::ErrorKind) -> Self {
        Self {
            open_error: Some(kind),
            ..Self::new(SimulatedAnalyzer::new())
        }
    }

    /// Snapshot of the log so far.
    pub fn log(&self) -> SimulatorLog {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Wait until every simulated instrument task has finished (host closed
    /// the link, or the link was cut), then return the log.
    pub async fn wait_closed(&self) -> SimulatorLog {
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Simulated analyzer task failed");
            }
        }
        self.log()
    }
}

#[async_trait]
impl Connector for SimulatedConnector {
    async fn open(
        &self,
        port: &str,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<LineTransport, SessionError> {
        if let Some(kind) = self.open_error {
            return Err(SessionError::PortOpen {
                port: port.to_string(),
                source: std::io::Error::new(kind, "simulated open failure"),
            });
        }

        record(&self.log, |log| log.opens += 1);
        let (host, device) = tokio::io::duplex(PIPE_CAPACITY);
        let task = tokio::spawn(serve(self.analyzer.clone(), device, Arc::clone(&self.log)));
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);

        tracing::debug!(port, baud_rate, "Simulated analyzer connected");
        let link = SimulatedLink {
            inner: host,
            log: Arc::clone(&self.log),
            closed: false,
        };
        Ok(LineTransport::new(port, link, read_timeout))
    }
}

fn record(log: &Mutex<SimulatorLog>, update: impl FnOnce(&mut SimulatorLog)) {
    update(&mut log.lock().unwrap_or_else(PoisonError::into_inner));
}

async fn serve(mut analyzer: SimulatedAnalyzer, io: DuplexStream, log: Arc<Mutex<SimulatorLog>>) {
    let (reader, mut writer) = tokio::io::split(io);
    let mut lines = BufReader::new(reader).lines();
    let mut state = DeviceState::default();

    let mut handled = 0;

    while let Ok(Some(line)) = lines.next_line().await {
        let command = line.trim().to_string();
        record(&log, |entries| entries.commands.push(command.clone()));

        if let Some(reply) = analyzer.respond(&mut state, &command) {
            let framed = format!("{}\r\n", reply);
            if writer.write_all(framed.as_bytes()).await.is_err() {
                break;
            }
        }

        handled += 1;
        if analyzer.disconnect_after.is_some_and(|limit| handled >= limit) {
            tracing::debug!(handled, "Simulated link cut");
            break;
        }
    }
}

/// Host end of the simulated link; counts closes.
struct SimulatedLink {
    inner: DuplexStream,
    log: Arc<Mutex<SimulatorLog>>,
    closed: bool,
}

impl AsyncRead for SimulatedLink {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for SimulatedLink {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let result = futures::ready!(Pin::new(&mut self.inner).poll_shutdown(cx));
        if !self.closed {
            self.closed = true;
            record(&self.log, |entries| entries.closes += 1);
        }
        Poll::Ready(result)
    }
}
