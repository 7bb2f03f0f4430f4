use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4, TcpStream};
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::conn::{Connection, RecvStatus};
use crate::error::{Error, Result};

/// Socket receive timeout. Kept minimal so receives double as polling.
const RECV_POLL_TIMEOUT: Duration = Duration::from_millis(1);

/// Socket send timeout. `send(2)` only blocks when the transport buffers
/// are full.
const SEND_TIMEOUT: Duration = Duration::from_millis(50);

/// IPv4 TCP stream to a GDB server.
pub struct TcpTransport {
    stream: TcpStream,
}

impl TcpTransport {
    /// Connect to the GDB server listening at `ip:port`.
    ///
    /// RSP exchanges many small packets, so `TCP_NODELAY` is set
    /// unconditionally.
    pub fn connect(ip: Ipv4Addr, port: u16) -> Result<Self> {
        let addr = SocketAddrV4::new(ip, port);
        info!("Connecting to the GDB server: {}", addr);
        let started = Instant::now();

        let stream = TcpStream::connect(addr).map_err(Error::Socket)?;
        stream.set_nodelay(true).map_err(Error::Socket)?;
        stream
            .set_read_timeout(Some(RECV_POLL_TIMEOUT))
            .map_err(Error::Socket)?;
        stream
            .set_write_timeout(Some(SEND_TIMEOUT))
            .map_err(Error::Socket)?;

        debug!("Connected ({:.1} ms)", started.elapsed().as_secs_f64() * 1e3);
        Ok(TcpTransport { stream })
    }
}

impl Connection for TcpTransport {
    fn send(&mut self, buf: &[u8]) -> Result<()> {
        match self.stream.write_all(buf) {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                Err(Error::SendTimeout)
            }
            Err(e) if e.kind() == ErrorKind::WriteZero => Err(Error::PartialSend),
            Err(e) => Err(Error::Socket(e)),
        }
    }

    fn recv_some(&mut self, buf: &mut [u8]) -> Result<RecvStatus> {
        match self.stream.read(buf) {
            Ok(0) => Ok(RecvStatus::Closed),
            Ok(n) => Ok(RecvStatus::Data(n)),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                Ok(RecvStatus::WouldBlock)
            }
            Err(e) => Err(Error::Socket(e)),
        }
    }
}
