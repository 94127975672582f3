//! Encode/decode for the `rigctld` line protocol.
//!
//! Every command is a single ASCII line: a backslash-prefixed verb followed
//! by space-separated arguments (`\set_mode USB 2400`). The daemon answers
//! with zero or more data lines and a terminal status line `RPRT <code>`,
//! where `0` means success and a negative code is a Hamlib error.

use rigranger_core::error::{Error, Result};
use rigranger_core::types::ModeInfo;

/// Line terminator appended to every command.
pub const LINE_TERMINATOR: char = '\n';

/// Token that starts the terminal status line of every response.
pub const STATUS_TOKEN: &str = "RPRT";

/// Longest line accepted from the daemon before it is discarded.
pub const MAX_LINE: usize = 8192;

/// Terminate `command` with a newline unless it already is.
pub fn encode_command(command: &str) -> String {
    if command.ends_with(LINE_TERMINATOR) {
        command.to_string()
    } else {
        format!("{command}{LINE_TERMINATOR}")
    }
}

/// Reject a command that would put more than one line on the wire.
///
/// A trailing terminator is allowed; a carriage return or newline anywhere
/// else fails with [`Error::Protocol`].
///
/// ```
/// use rigranger_protocol::protocol::check_single_line;
///
/// assert!(check_single_line("\\get_freq\n").is_ok());
/// assert!(check_single_line("\\set_freq 7000000\n\\get_mode").is_err());
/// ```
pub fn check_single_line(command: &str) -> Result<()> {
    let body = command.trim_end_matches(['\r', '\n']);
    if body.contains(['\r', '\n']) {
        return Err(Error::Protocol(format!(
            "command contains an embedded line terminator: {command:?}"
        )));
    }
    Ok(())
}

/// Split a line that ends in a terminal status token.
///
/// Returns the text preceding the token (usually empty) and the status
/// code, or `None` if the line does not end in `RPRT <int>`.
///
/// ```
/// use rigranger_protocol::protocol::split_status_line;
///
/// assert_eq!(split_status_line("RPRT 0"), Some(("", 0)));
/// assert_eq!(split_status_line("RPRT -11\r"), Some(("", -11)));
/// assert_eq!(split_status_line("14250000"), None);
/// ```
pub fn split_status_line(line: &str) -> Option<(&str, i32)> {
    let line = line.trim();
    let idx = line.rfind(STATUS_TOKEN)?;
    let before = &line[..idx];
    if !before.is_empty() && !before.ends_with(char::is_whitespace) {
        return None;
    }
    let after = &line[idx + STATUS_TOKEN.len()..];
    if !after.starts_with(char::is_whitespace) {
        return None;
    }
    let code = after.trim().parse::<i32>().ok()?;
    Some((before.trim_end(), code))
}

/// A complete response: the data lines and the terminal status code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResponse {
    /// Data lines preceding the status line, without terminators.
    pub lines: Vec<String>,
    /// The `RPRT` status code.
    pub code: i32,
}

impl CommandResponse {
    /// Whether the daemon reported success (`RPRT 0`).
    pub fn is_success(&self) -> bool {
        self.code == 0
    }

    /// The first data line, if any.
    pub fn first_line(&self) -> Option<&str> {
        self.lines.first().map(String::as_str)
    }

    /// The response as text, status line included (`"14250000\nRPRT 0"`).
    pub fn raw(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out.push_str(STATUS_TOKEN);
        out.push(' ');
        out.push_str(&self.code.to_string());
        out
    }

    /// Turn a nonzero status code into [`Error::CommandFailure`].
    pub fn into_result(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(Error::CommandFailure {
                code: self.code,
                response: self.raw(),
            })
        }
    }
}

/// Decode a complete response from text.
///
/// Lines after the first status line are ignored. A text without any
/// status line is a protocol error: the response is incomplete.
pub fn parse_response(raw: &str) -> Result<CommandResponse> {
    let mut lines = Vec::new();
    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        if let Some((data, code)) = split_status_line(line) {
            if !data.is_empty() {
                lines.push(data.to_string());
            }
            return Ok(CommandResponse { lines, code });
        }
        if !line.trim().is_empty() {
            lines.push(line.to_string());
        }
    }
    Err(Error::Protocol(format!(
        "response has no {STATUS_TOKEN} status line: {raw:?}"
    )))
}

// ---------------------------------------------------------------------------
// Command builders
// ---------------------------------------------------------------------------

pub fn get_freq() -> String {
    "\\get_freq".to_string()
}

pub fn set_freq(hz: f64) -> String {
    format!("\\set_freq {hz}")
}

pub fn get_mode() -> String {
    "\\get_mode".to_string()
}

pub fn set_mode(mode: &str, passband: i64) -> String {
    format!("\\set_mode {mode} {passband}")
}

pub fn get_ptt() -> String {
    "\\get_ptt".to_string()
}

pub fn set_ptt(enabled: bool) -> String {
    format!("\\set_ptt {}", u8::from(enabled))
}

pub fn get_level(name: &str) -> String {
    format!("\\get_level {name}")
}

pub fn set_level(name: &str, value: f64) -> String {
    format!("\\set_level {name} {value}")
}

pub fn dump_state() -> String {
    "\\dump_state".to_string()
}

// ---------------------------------------------------------------------------
// Value parsers
// ---------------------------------------------------------------------------

fn first_value<'a>(response: &'a CommandResponse, what: &str) -> Result<&'a str> {
    response
        .first_line()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::Protocol(format!("empty {what} response")))
}

/// Frequency in hertz: the first data line as a float.
pub fn parse_frequency(response: &CommandResponse) -> Result<f64> {
    let value = first_value(response, "frequency")?;
    value
        .parse::<f64>()
        .map_err(|e| Error::Protocol(format!("failed to parse frequency {value:?}: {e}")))
}

/// Mode and passband: `<mode> <passband>` on the first data line.
///
/// The passband defaults to 0 when omitted. `rigctld` itself prints the
/// passband on a second line, which is accepted as well.
pub fn parse_mode(response: &CommandResponse) -> Result<ModeInfo> {
    let first = first_value(response, "mode")?;
    let mut parts = first.split_whitespace();
    let mode = parts
        .next()
        .ok_or_else(|| Error::Protocol("empty mode response".into()))?
        .to_string();

    let passband_token = parts
        .next()
        .or_else(|| response.lines.get(1).map(|l| l.trim()).filter(|l| !l.is_empty()));

    let passband = match passband_token {
        Some(token) => token
            .parse::<i64>()
            .map_err(|e| Error::Protocol(format!("failed to parse passband {token:?}: {e}")))?,
        None => 0,
    };

    Ok(ModeInfo { mode, passband })
}

/// PTT state: an integer where nonzero means transmitting.
pub fn parse_ptt(response: &CommandResponse) -> Result<bool> {
    let value = first_value(response, "PTT")?;
    value
        .parse::<i64>()
        .map(|v| v != 0)
        .map_err(|e| Error::Protocol(format!("failed to parse PTT {value:?}: {e}")))
}

/// Level reading: the first data line as a float.
pub fn parse_level(response: &CommandResponse) -> Result<f64> {
    let value = first_value(response, "level")?;
    value
        .parse::<f64>()
        .map_err(|e| Error::Protocol(format!("failed to parse level {value:?}: {e}")))
}
