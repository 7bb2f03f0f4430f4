//! A session with the GDB server: capability negotiation, acknowledgement
//! discipline and deadline-based frame reception.
//!
//! All state that the original tool kept process-wide (socket, ack mode,
//! negotiated packet sizes, receive scratch) lives in a single [`Session`]
//! value owned by the main actor.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};

use crate::conn::{Connection, RecvStatus};
use crate::error::{Error, Result};
use crate::protocol::hex;
use crate::protocol::packet::{self, Frame, FrameDecoder, MAX_FRAME_LEN};

/// Default per-request reply deadline.
pub const RECV_TIMEOUT: Duration = Duration::from_millis(500);

/// Reply deadline for the capability query and for pending acknowledgements.
pub const LONG_RECV_TIMEOUT: Duration = Duration::from_millis(2500);

/// Deadline for frames chained after a console-output reply.
pub const ERROR_DATA_TIMEOUT: Duration = Duration::from_millis(50);

/// Packet size assumed when the server does not advertise `PacketSize`.
pub const DEFAULT_PACKET_SIZE: usize = 4096;

/// Smallest receive-packet override the session accepts.
pub const MIN_PACKET_SIZE: usize = 256;

pub struct Session<C: Connection> {
    conn: C,
    decoder: FrameDecoder,
    inbox: VecDeque<u8>,
    ack_mode: bool,
    max_send_packet: usize,
    max_recv_packet: usize,
}

impl<C: Connection> Session<C> {
    /// Open a session: drain any server greeting, require the
    /// `QStartNoAckMode+` capability, then switch the link to no-ack mode.
    pub fn establish(conn: C, recv_override: Option<usize>) -> Result<Session<C>> {
        let mut session = Session {
            conn,
            decoder: FrameDecoder::new(),
            inbox: VecDeque::new(),
            ack_mode: true,
            max_send_packet: DEFAULT_PACKET_SIZE,
            max_recv_packet: DEFAULT_PACKET_SIZE,
        };
        session.drain_unsolicited();
        session.query_capabilities(recv_override)?;
        session.request_no_ack()?;
        Ok(session)
    }

    /// Largest frame the server accepts, in bytes.
    pub fn max_send_packet(&self) -> usize {
        self.max_send_packet
    }

    /// Largest frame this session accepts from the server, in bytes.
    pub fn max_recv_packet(&self) -> usize {
        self.max_recv_packet
    }

    /// Frame and send one payload. In ack mode the server's `+` is consumed
    /// before returning.
    pub fn send_packet(&mut self, payload: &[u8]) -> Result<()> {
        let frame = packet::encode(payload);
        trace!("--> {}", String::from_utf8_lossy(&frame));
        self.conn.send(&frame)?;
        if self.ack_mode {
            self.await_ack();
        }
        Ok(())
    }

    /// Wait for the next complete frame and return its payload.
    pub fn recv_frame(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.next_frame(deadline)? {
                Frame::Payload(payload) => {
                    if self.ack_mode {
                        let _ = self.conn.send(b"+");
                    }
                    return Ok(payload);
                }
                Frame::Ack => {}
                Frame::Nack => {
                    warn!("Server requested a retransmission; not supported");
                }
            }
        }
    }

    /// Log and discard anything the server sent without a request, as after
    /// a reset, breakpoint or exception.
    pub fn drain_unsolicited(&mut self) {
        loop {
            match self.fill_inbox() {
                Ok(RecvStatus::Data(_)) => {}
                _ => break,
            }
        }
        while let Some(byte) = self.inbox.pop_front() {
            match self.decoder.push(byte) {
                Ok(Some(Frame::Payload(payload))) => {
                    warn!("Unexpected message: {}", String::from_utf8_lossy(&payload));
                    if self.ack_mode {
                        let _ = self.conn.send(b"+");
                    }
                }
                Ok(_) => {}
                Err(e) => debug!("Discarding malformed unsolicited data: {}", e),
            }
        }
    }

    /// Send a detach request. The reply is ignored; the link is about to
    /// close anyway.
    pub fn detach(&mut self) {
        if self.send_packet(b"D").is_ok() {
            let _ = self.recv_frame(RECV_TIMEOUT);
        }
    }

    fn query_capabilities(&mut self, recv_override: Option<usize>) -> Result<()> {
        info!("Retrieving GDB server capabilities");
        let started = Instant::now();
        self.send_packet(b"qSupported")?;
        let reply = self.recv_frame(LONG_RECV_TIMEOUT)?;
        self.parse_capabilities(&reply, recv_override)?;
        debug!(
            "Capabilities retrieved ({:.1} ms)",
            started.elapsed().as_secs_f64() * 1e3
        );
        Ok(())
    }

    fn parse_capabilities(&mut self, reply: &[u8], recv_override: Option<usize>) -> Result<()> {
        let reply = String::from_utf8_lossy(reply);
        let mut no_ack_supported = false;
        let mut packet_size = None;

        for feature in reply.split(';') {
            if feature == "QStartNoAckMode+" {
                no_ack_supported = true;
            } else if let Some(value) = feature.strip_prefix("PacketSize=") {
                packet_size = hex::decode_hex::<usize>(value.as_bytes()).ok();
            }
        }

        if !no_ack_supported {
            warn!("GDB server does not support 'QStartNoAckMode+' mode");
            return Err(Error::UnsupportedServer);
        }

        match packet_size {
            Some(size) => debug!("Server packet size: {:#x} bytes", size),
            None => debug!(
                "PacketSize field not found; using default message size {}",
                DEFAULT_PACKET_SIZE
            ),
        }

        self.max_send_packet = packet_size.unwrap_or(DEFAULT_PACKET_SIZE).min(MAX_FRAME_LEN);
        self.max_recv_packet = self.max_send_packet;
        if let Some(size) = recv_override {
            self.max_recv_packet = size.clamp(MIN_PACKET_SIZE, MAX_FRAME_LEN);
        }
        Ok(())
    }

    fn request_no_ack(&mut self) -> Result<()> {
        self.send_packet(b"QStartNoAckMode")?;
        let reply = self.recv_frame(RECV_TIMEOUT)?;
        if reply != b"OK" {
            warn!(
                "No-ack mode not accepted by the GDB server: {}",
                String::from_utf8_lossy(&reply)
            );
            return Err(Error::UnsupportedServer);
        }
        self.ack_mode = false;
        self.drain_unsolicited();
        Ok(())
    }

    /// Consume the `+` the server owes us for the packet just sent. Failures
    /// are logged, not fatal; the reply deadline will catch a dead server.
    fn await_ack(&mut self) {
        let deadline = Instant::now() + LONG_RECV_TIMEOUT;
        loop {
            match self.next_frame(deadline) {
                Ok(Frame::Ack) => return,
                Ok(Frame::Nack) => {
                    warn!("Bad ACK received");
                    return;
                }
                Ok(Frame::Payload(payload)) => {
                    warn!(
                        "Unexpected frame while waiting for ACK: {}",
                        String::from_utf8_lossy(&payload)
                    );
                }
                Err(Error::RecvTimeout) => {
                    warn!("ACK timeout: no acknowledgement received");
                    return;
                }
                Err(e) => {
                    warn!("Error while waiting for ACK: {}", e);
                    return;
                }
            }
        }
    }

    fn next_frame(&mut self, deadline: Instant) -> Result<Frame> {
        loop {
            while let Some(byte) = self.inbox.pop_front() {
                if let Some(frame) = self.decoder.push(byte)? {
                    return Ok(frame);
                }
            }
            match self.fill_inbox()? {
                RecvStatus::Data(_) => {}
                RecvStatus::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(Error::RecvTimeout);
                    }
                }
                RecvStatus::Closed => {
                    info!("Connection to the GDB server has been gracefully closed");
                    return Err(Error::ConnectionClosed);
                }
            }
        }
    }

    fn fill_inbox(&mut self) -> Result<RecvStatus> {
        let mut buf = [0u8; 2048];
        let status = self.conn.recv_some(&mut buf)?;
        if let RecvStatus::Data(n) = status {
            self.inbox.extend(&buf[..n]);
        }
        Ok(status)
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &C {
        &self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockServer;

    #[test]
    fn establish_negotiates_no_ack_mode() {
        let mock = MockServer::new(0, Vec::new());
        let commands = mock.commands.clone();
        let session = Session::establish(mock, None).unwrap();

        assert_eq!(
            commands.borrow().as_slice(),
            ["qSupported", "QStartNoAckMode"]
        );
        assert!(!session.ack_mode);
    }

    #[test]
    fn packet_size_is_parsed_as_hex() {
        let mut mock = MockServer::new(0, Vec::new());
        mock.features = "PacketSize=1000;QStartNoAckMode+".into();
        let session = Session::establish(mock, None).unwrap();
        assert_eq!(session.max_send_packet(), 0x1000);
        assert_eq!(session.max_recv_packet(), 0x1000);
    }

    #[test]
    fn missing_packet_size_uses_default() {
        let mut mock = MockServer::new(0, Vec::new());
        mock.features = "QStartNoAckMode+".into();
        let session = Session::establish(mock, None).unwrap();
        assert_eq!(session.max_send_packet(), DEFAULT_PACKET_SIZE);
    }

    #[test]
    fn missing_no_ack_capability_is_fatal() {
        let mut mock = MockServer::new(0, Vec::new());
        mock.features = "PacketSize=400".into();
        let commands = mock.commands.clone();

        let result = Session::establish(mock, None);
        assert!(matches!(result, Err(Error::UnsupportedServer)));
        // No further requests once the capability check fails.
        assert_eq!(commands.borrow().as_slice(), ["qSupported"]);
    }

    #[test]
    fn recv_override_is_bounded() {
        let mock = MockServer::new(0, Vec::new());
        let session = Session::establish(mock, Some(0x20000)).unwrap();
        assert_eq!(session.max_recv_packet(), MAX_FRAME_LEN);

        let mock = MockServer::new(0, Vec::new());
        let session = Session::establish(mock, Some(512)).unwrap();
        assert_eq!(session.max_recv_packet(), 512);
    }
}
