use crate::format::vtp::{ConnectError, ProtocolError};
use std::num::ParseIntError;
use thiserror::Error;

/// Crate-wide error type.
///
/// Control-channel failures arrive as [`VtpError::Connect`] or
/// [`VtpError::Protocol`]; data-plane failures as [`VtpError::Socket`].
#[derive(Error, Debug)]
pub enum VtpError {
    /// Underlying socket or file I/O failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Could not establish the control connection
    #[error("connect error: {0}")]
    Connect(#[from] ConnectError),

    /// Malformed or unsuccessful control exchange
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The backend refused to serve a channel or recording
    #[error("stream unavailable: {0}")]
    StreamUnavailable(String),

    /// Read or write failure on an open data socket
    #[error("socket error: {0}")]
    Socket(String),

    /// Producer outran the consumer and bytes were dropped
    #[error("buffer overflow: {0} bytes dropped")]
    BufferOverflow(usize),

    /// Bytes discarded while looking for the next TS sync byte
    #[error("lost TS sync, skipped {0} bytes")]
    Desync(usize),

    /// Numeric field in a reply could not be parsed
    #[error("parse int error: {0}")]
    ParseInt(#[from] ParseIntError),

    /// Argument or payload outside the accepted range
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Bad configuration value
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, VtpError>;
