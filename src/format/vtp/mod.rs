//! # VTP Control Protocol
//!
//! Wire types for the line-oriented VTP protocol spoken by VDR's streamdev
//! server: one control connection carrying numbered text replies, plus
//! push-style data sockets the backend connects back to.
//!
//! ```text
//! C: CAPS TS
//! S: 220 Capability "TS" accepted
//! C: PORT 0 192,168,1,20,195,80
//! S: 220 Port command ok, data connection opened
//! ```
//!
//! Multi-line replies use `-` (or any non-space) after the code on every line
//! except the last:
//!
//! ```text
//! S: 250-1 ARD;...
//! S: 250 2 ZDF;...
//! ```

mod connection;
mod control;
mod data;
mod notify;

pub use connection::{VtpConnection, DEFAULT_READ_TIMEOUT, READ_ATTEMPTS};
pub use control::{
    ControlChannel, DEFAULT_BUSY_RETRIES, DEFAULT_BUSY_RETRY_INTERVAL, DEFAULT_CONNECT_TIMEOUT,
};
pub use data::{DataChannel, DataSocket};
pub use notify::{
    parse_notification, BackendEvents, BackendMessage, MessageLevel, Notification,
    NotificationListener,
};

use std::fmt;
use std::net::SocketAddrV4;
use thiserror::Error;

/// Default VTP port of a streamdev server.
pub const DEFAULT_PORT: u16 = 2004;

/// Longest reply line accepted from the backend.
pub const MAX_LINE_LENGTH: usize = 8 * 1024;

/// Reply codes used by the client.
pub mod codes {
    /// Command accepted.
    pub const OK: u16 = 220;
    /// Reply to `QUIT`.
    pub const CLOSING: u16 = 221;
    /// Server is busy, retry later.
    pub const BUSY: u16 = 451;
    /// Nothing found; benign when the text starts with `No `.
    pub const NO_DATA: u16 = 550;
}

/// Failures while establishing the control connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// TCP connect did not finish before the deadline
    #[error("timed out connecting to {0}")]
    Timeout(String),
    /// The backend refused or reset the connection
    #[error("connection to {addr} refused: {reason}")]
    Refused {
        /// Address that was dialled
        addr: String,
        /// Underlying socket error
        reason: String,
    },
    /// Host name could not be resolved
    #[error("cannot resolve {0}")]
    Dns(String),
    /// First line from the server was missing or not a 220
    #[error("unexpected greeting: {0}")]
    Greeting(String),
    /// `CAPS TS` was not accepted
    #[error("capability negotiation failed: {0}")]
    Negotiation(String),
}

/// Failures during a command exchange.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A reply line could not be parsed
    #[error("malformed reply: {0}")]
    Malformed(String),
    /// The backend answered with a failure code
    #[error("{code} {message}")]
    Status {
        /// Numeric reply code
        code: u16,
        /// Text of the final reply line
        message: String,
    },
    /// A reply line exceeded [`MAX_LINE_LENGTH`]
    #[error("reply line longer than {0} bytes")]
    LineTooLong(usize),
    /// No final reply line arrived in time
    #[error("timed out waiting for reply")]
    Timeout,
    /// The control connection is gone
    #[error("control connection closed")]
    Closed,
}

/// Logical data streams multiplexed next to the control connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataStreamId {
    /// Live TV transport stream
    Live,
    /// Recording playback
    Replay,
    /// Filtered live sections
    LiveFilter,
    /// Backend-pushed text notifications
    DataResponse,
}

impl DataStreamId {
    /// Numeric id used in `PORT` and `ABRT`.
    pub fn as_u8(self) -> u8 {
        match self {
            DataStreamId::Live => 0,
            DataStreamId::Replay => 1,
            DataStreamId::LiveFilter => 2,
            DataStreamId::DataResponse => 3,
        }
    }
}

impl fmt::Display for DataStreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataStreamId::Live => "live",
            DataStreamId::Replay => "replay",
            DataStreamId::LiveFilter => "live-filter",
            DataStreamId::DataResponse => "data-response",
        };
        write!(f, "{}", name)
    }
}

/// A complete reply: the final code and every payload line in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    /// Code of the final line
    pub code: u16,
    /// Payload of each line, without code and separator
    pub lines: Vec<String>,
}

impl Response {
    /// True for 2xx codes.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Payload of the final line, or an empty string.
    pub fn message(&self) -> &str {
        self.lines.last().map(String::as_str).unwrap_or("")
    }

    /// Whether this reply is the benign "nothing found" answer.
    pub fn is_no_data(&self) -> bool {
        self.code == codes::NO_DATA && self.message().starts_with("No ")
    }

    /// Parses the first whitespace-separated field of the final line.
    pub fn first_number(&self) -> Result<u64, ProtocolError> {
        let field = self.message().split_whitespace().next().unwrap_or("");
        field
            .parse()
            .map_err(|_| ProtocolError::Malformed(format!("expected a number in {:?}", self.message())))
    }
}

/// One parsed reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseLine<'a> {
    /// Three-digit code
    pub code: u16,
    /// True when this is the last line of the reply
    pub is_final: bool,
    /// Text after the separator
    pub payload: &'a str,
}

/// Splits `line` into code, continuation flag and payload.
///
/// A bare three-digit line is a final line with an empty payload.
pub fn parse_response_line(line: &str) -> Result<ResponseLine<'_>, ProtocolError> {
    let digits = line
        .get(..3)
        .filter(|d| d.bytes().all(|b| b.is_ascii_digit()))
        .ok_or_else(|| ProtocolError::Malformed(line.to_string()))?;
    let code: u16 = digits
        .parse()
        .map_err(|_| ProtocolError::Malformed(line.to_string()))?;

    let rest = &line[3..];
    let mut chars = rest.chars();
    match chars.next() {
        None => Ok(ResponseLine {
            code,
            is_final: true,
            payload: "",
        }),
        Some(sep) => Ok(ResponseLine {
            code,
            is_final: sep == ' ',
            payload: chars.as_str(),
        }),
    }
}

/// Formats `PORT <id> a,b,c,d,hi,lo` for a listener at `addr`.
pub fn format_port_command(id: DataStreamId, addr: SocketAddrV4) -> String {
    let [a, b, c, d] = addr.ip().octets();
    let port = addr.port();
    format!(
        "PORT {} {},{},{},{},{},{}",
        id.as_u8(),
        a,
        b,
        c,
        d,
        port >> 8,
        port & 0xFF
    )
}
