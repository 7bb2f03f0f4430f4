//! RSP packet framing: `$payload#cc` with an 8-bit payload checksum.
//!
//! Acknowledgement bytes (`+` / `-`) travel outside frames. Payload bytes
//! that collide with framing characters arrive escaped (`}` followed by the
//! byte XOR 0x20), and servers may compress runs of identical characters
//! with `*` run-length encoding; both are expanded after the checksum has
//! been verified over the raw payload.

use log::trace;

use crate::error::{Error, GdbError, Result};
use crate::protocol::hex::decode_hex_byte;

/// Upper bound on a single frame, raw or expanded. Oversize frames from a
/// misbehaving server are rejected rather than buffered indefinitely.
pub const MAX_FRAME_LEN: usize = 65535;

/// 8-bit RSP checksum: sum of the payload bytes mod 256.
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |a, x| a.wrapping_add(*x))
}

/// Frame a payload as `$payload#cc` with a lowercase hex checksum.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 4);
    out.push(b'$');
    out.extend_from_slice(payload);
    out.push(b'#');
    out.extend_from_slice(format!("{:02x}", checksum(payload)).as_bytes());
    out
}

/// A decoded wire event.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    Ack,
    Nack,
    Payload(Vec<u8>),
}

enum State {
    Ready,
    Body,
    Escape,
    Checksum1,
    Checksum2,
}

/// Streaming frame decoder.
///
/// Bytes are pushed one at a time; a [`Frame`] pops out whenever one
/// completes. The decoder keeps its state across calls, so a frame split
/// over several socket reads reassembles transparently.
pub struct FrameDecoder {
    state: State,
    raw: Vec<u8>,
    checksum_hi: u8,
}

impl FrameDecoder {
    pub fn new() -> FrameDecoder {
        FrameDecoder {
            state: State::Ready,
            raw: Vec::new(),
            checksum_hi: 0,
        }
    }

    /// Feed one byte. Bytes outside a frame that are not acknowledgements
    /// are discarded.
    pub fn push(&mut self, byte: u8) -> Result<Option<Frame>> {
        match self.state {
            State::Ready => match byte {
                b'$' => {
                    self.raw.clear();
                    self.state = State::Body;
                }
                b'+' => return Ok(Some(Frame::Ack)),
                b'-' => return Ok(Some(Frame::Nack)),
                _ => {}
            },
            State::Body => match byte {
                b'#' => self.state = State::Checksum1,
                b'}' => {
                    self.push_raw(byte)?;
                    self.state = State::Escape;
                }
                _ => self.push_raw(byte)?,
            },
            // An escaped byte is data even when it looks like '#'.
            State::Escape => {
                self.push_raw(byte)?;
                self.state = State::Body;
            }
            State::Checksum1 => {
                self.checksum_hi = byte;
                self.state = State::Checksum2;
            }
            State::Checksum2 => {
                self.state = State::Ready;
                let expected =
                    decode_hex_byte(&[self.checksum_hi, byte]).map_err(|_| Error::BadFormat)?;
                let calculated = checksum(&self.raw);
                if calculated != expected {
                    return Err(Error::BadChecksum {
                        expected,
                        calculated,
                    });
                }
                let payload = expand(&self.raw)?;
                trace!("<-- ${}#{:02x}", String::from_utf8_lossy(&payload), expected);
                return Ok(Some(Frame::Payload(payload)));
            }
        }
        Ok(None)
    }

    fn push_raw(&mut self, byte: u8) -> Result<()> {
        if self.raw.len() >= MAX_FRAME_LEN {
            self.state = State::Ready;
            return Err(Error::BadFormat);
        }
        self.raw.push(byte);
        Ok(())
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        FrameDecoder::new()
    }
}

/// Expand `}`-escapes and `*` run-lengths of a checksum-verified payload.
fn expand(raw: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        match raw[i] {
            b'}' => {
                let next = raw.get(i + 1).ok_or(Error::BadFormat)?;
                out.push(next ^ 0x20);
                i += 2;
            }
            b'*' => {
                // Repeat count is carried as a printable char, value + 29.
                let last = *out.last().ok_or(Error::BadFormat)?;
                let count = raw
                    .get(i + 1)
                    .and_then(|c| c.checked_sub(29))
                    .ok_or(Error::BadFormat)? as usize;
                if count == 0 || out.len() + count > MAX_FRAME_LEN {
                    return Err(Error::BadFormat);
                }
                out.extend(core::iter::repeat(last).take(count));
                i += 2;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    Ok(out)
}

/// Classify a reply payload that reports a server-side error.
///
/// Only the `Exx` (exactly two hex digits) and `E.text` shapes count, so a
/// memory-read payload that happens to start with a hex `E` digit is never
/// misclassified.
pub fn error_reply(payload: &[u8]) -> Option<GdbError> {
    if payload.first() != Some(&b'E') {
        return None;
    }
    if payload.len() == 3 {
        if let Ok(code) = decode_hex_byte(&payload[1..3]) {
            return Some(GdbError::Code(code));
        }
    }
    if payload.get(1) == Some(&b'.') {
        return Some(GdbError::Text(
            String::from_utf8_lossy(&payload[2..]).into_owned(),
        ));
    }
    None
}
