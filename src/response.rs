//! Classification of instrument replies to measurement queries.
//!
//! The analyzer answers `FETCH?` / `MEAS:IMP?` with either a reading
//! (`"<a>,<b>"`), a status line such as `exec success` when no new data is
//! available, `cmd err` when it rejected the command, or nothing at all when
//! the read timed out. Everything here is pure string handling so the retry
//! rules can be tested without a transport.

/// Status text sent when a command executed but produced no new data.
pub const EXEC_SUCCESS: &str = "exec success";

/// Status text sent when the instrument rejected a command.
pub const CMD_ERR: &str = "cmd err";

/// Outcome of a single fetch exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// A syntactically valid pair of readings.
    Reading {
        /// First field (measurement A)
        a: f64,
        /// Second field (measurement B)
        b: f64,
    },
    /// Nothing was read before the timeout.
    Empty,
    /// The instrument reported a command error.
    CommandError,
    /// Something arrived but it is not a two-field numeric pair.
    Malformed(String),
}

impl Reply {
    /// Classify a stripped reply line.
    pub fn classify(response: &str) -> Self {
        if response.is_empty() {
            return Reply::Empty;
        }
        if response.contains(CMD_ERR) {
            return Reply::CommandError;
        }
        match parse_pair(response) {
            Some((a, b)) => Reply::Reading { a, b },
            None => Reply::Malformed(response.to_string()),
        }
    }
}

/// Whether the primary fetch reply calls for the fallback measure query.
pub fn needs_fallback(response: &str) -> bool {
    response.contains(EXEC_SUCCESS) || response.contains(CMD_ERR)
}

/// Parse exactly two comma-separated floating point fields.
///
/// Whitespace around each field is ignored; any other content, a missing
/// field or a third field rejects the whole line.
pub fn parse_pair(response: &str) -> Option<(f64, f64)> {
    let mut fields = response.trim_end().split(',');
    let a = fields.next()?.trim().parse::<f64>().ok()?;
    let b = fields.next()?.trim().parse::<f64>().ok()?;
    if fields.next().is_some() {
        return None;
    }
    Some((a, b))
}
