//! Byte-level transport to the GDB server.

mod tcp;

pub use tcp::TcpTransport;

use crate::error::Result;

/// Outcome of a single polled receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvStatus {
    /// `n` bytes were placed at the start of the buffer.
    Data(usize),
    /// Nothing arrived within the socket poll interval.
    WouldBlock,
    /// The peer shut the connection down gracefully.
    Closed,
}

/// In-order, serial byte I/O with polled receives.
///
/// [`TcpTransport`] is the production implementation; tests substitute a
/// scripted in-memory server.
pub trait Connection {
    /// Send the entire buffer.
    fn send(&mut self, buf: &[u8]) -> Result<()>;

    /// Receive whatever is available, up to `buf.len()` bytes. Must not
    /// block past the transport's poll interval.
    fn recv_some(&mut self, buf: &mut [u8]) -> Result<RecvStatus>;
}
