//! Segmented target-memory access over `m` / `M` packets.
//!
//! Transfers are split into chunks sized from the negotiated packet limits.
//! Chunk sizes are kept divisible by 4 since some debug probes transfer
//! unaligned lengths noticeably slower.

use std::fmt::Write;
use std::time::Instant;

use log::debug;

use crate::conn::Connection;
use crate::error::{Error, Result};
use crate::protocol::hex;
use crate::protocol::packet;
use crate::session::{Session, RECV_TIMEOUT};

impl<C: Connection> Session<C> {
    /// Largest memory-read chunk in bytes. A read reply carries two hex
    /// digits per byte inside `$...#cc`.
    pub fn max_memo_read(&self) -> usize {
        ((self.max_recv_packet() - 4) / 8) * 4
    }

    /// Largest memory-write chunk in bytes. A write packet spends 16 bytes
    /// on `$Maaaaaaaa,llll:` plus the trailing `#cc`.
    pub fn max_memo_write(&self) -> usize {
        ((self.max_send_packet() - 16 - 4) / 8) * 4
    }

    /// Read `out.len()` bytes of target memory starting at `addr`.
    pub fn read_memory(&mut self, addr: u32, out: &mut [u8]) -> Result<()> {
        if out.is_empty() {
            return Err(Error::BadInput);
        }

        debug!("Reading {} bytes from address 0x{:08X}", out.len(), addr);
        let started = Instant::now();
        let max_chunk = self.max_memo_read();

        let mut done = 0;
        while done < out.len() {
            let chunk = (out.len() - done).min(max_chunk);
            self.read_memory_packet(addr + done as u32, &mut out[done..done + chunk])?;
            done += chunk;
        }

        let elapsed_ms = started.elapsed().as_secs_f64() * 1e3;
        debug!(
            "Read finished ({:.1} ms, {:.0} kB/s)",
            elapsed_ms,
            out.len() as f64 / elapsed_ms.max(f64::MIN_POSITIVE)
        );
        Ok(())
    }

    /// Write `data` to target memory starting at `addr`.
    pub fn write_memory(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(Error::BadInput);
        }

        debug!("Writing {} bytes to address 0x{:08X}", data.len(), addr);
        let started = Instant::now();
        let max_chunk = self.max_memo_write();

        let mut done = 0;
        while done < data.len() {
            let chunk = (data.len() - done).min(max_chunk);
            self.write_memory_packet(addr + done as u32, &data[done..done + chunk])?;
            done += chunk;
        }

        debug!(
            "Write finished ({:.1} ms)",
            started.elapsed().as_secs_f64() * 1e3
        );
        Ok(())
    }

    fn read_memory_packet(&mut self, addr: u32, out: &mut [u8]) -> Result<()> {
        // Tested servers reply to lowercase read requests.
        let cmd = format!("m{:08x},{:02x}", addr, out.len());
        self.send_packet(cmd.as_bytes())?;

        let reply = self.recv_frame(RECV_TIMEOUT)?;
        if let Some(e) = packet::error_reply(&reply) {
            return Err(Error::GdbReported(e));
        }
        if reply.len() != out.len() * 2 {
            return Err(Error::BadFormat);
        }
        hex::decode_hex_buf(&reply, out)
    }

    fn write_memory_packet(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        // Tested servers expect uppercase write requests.
        let mut cmd = String::with_capacity(16 + data.len() * 2);
        let _ = write!(cmd, "M{:08X},{:04X}:", addr, data.len());
        for byte in data {
            let _ = write!(cmd, "{:02X}", byte);
        }
        self.send_packet(cmd.as_bytes())?;

        let reply = self.recv_frame(RECV_TIMEOUT)?;
        if reply == b"OK" {
            return Ok(());
        }
        if let Some(e) = packet::error_reply(&reply) {
            return Err(Error::GdbReported(e));
        }
        debug!("Bad response: {}", String::from_utf8_lossy(&reply));
        Err(Error::BadResponse)
    }
}
