use core::fmt;
use std::io;

use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

/// Error carried by an `$E..#` reply from the GDB server.
///
/// Servers report either a two-digit errno-style code (`E0e`) or, with the
/// LLDB extension, a textual message (`E.error-text`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GdbError {
    Code(u8),
    Text(String),
}

impl fmt::Display for GdbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GdbError::Code(code) => write!(f, "E{:02x}", code),
            GdbError::Text(text) => f.write_str(text),
        }
    }
}

/// Everything that can go wrong between this process and the target.
#[derive(Debug, Error)]
pub enum Error {
    /// No reply within the per-request deadline.
    #[error("timed out waiting for the GDB server")]
    RecvTimeout,
    #[error("timed out sending to the GDB server")]
    SendTimeout,
    #[error("message not sent completely")]
    PartialSend,
    #[error("socket error: {0}")]
    Socket(io::Error),
    #[error("connection to the GDB server has been closed")]
    ConnectionClosed,
    /// Malformed frame, hex field, escape or run-length sequence.
    #[error("bad message format")]
    BadFormat,
    #[error("bad message checksum (expected {expected:02x}, calculated {calculated:02x})")]
    BadChecksum { expected: u8, calculated: u8 },
    /// Structurally valid reply that does not answer the request.
    #[error("unexpected response from the GDB server")]
    BadResponse,
    #[error("invalid input data")]
    BadInput,
    #[error("GDB server reported error: {0}")]
    GdbReported(GdbError),
    #[error("GDB server does not support 'QStartNoAckMode+'")]
    UnsupportedServer,
    /// Header size or reserved bits are off. Usually a wrong structure
    /// address, or a target that has not initialized logging yet.
    #[error("invalid log structure header")]
    InvalidHeader,
    #[error("log structure size {0} is out of range")]
    SizeOutOfRange(u32),
    /// The message filter went non-zero while the transfer was running, so
    /// the transferred image may be torn.
    #[error("message filter re-enabled by the firmware during the transfer")]
    FilterReenabled,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// True when the transport is gone and the session must be
    /// re-established before any further requests.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Error::ConnectionClosed | Error::Socket(_))
    }
}
