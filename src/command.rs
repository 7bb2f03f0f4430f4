//! Execution of arbitrary RSP commands.

use std::time::Instant;

use log::{debug, info, warn};

use crate::conn::Connection;
use crate::error::{Error, Result};
use crate::protocol::hex;
use crate::protocol::packet;
use crate::session::{Session, ERROR_DATA_TIMEOUT, RECV_TIMEOUT};

impl<C: Connection> Session<C> {
    /// Send one command and classify the reply.
    ///
    /// `$OK#` is success. An `$O<hex>..#` chain carries hex-encoded console
    /// output, which is logged; further chained frames are collected until
    /// the short trailing deadline expires. Anything else is an error.
    pub fn execute(&mut self, command: &str) -> Result<()> {
        debug!("   \"{}\":", command);
        let started = Instant::now();

        if command.is_empty() {
            return Err(Error::BadInput);
        }
        if command.len() + 4 > self.max_send_packet() {
            warn!("GDB command too long ({})", command.len());
            return Err(Error::BadInput);
        }

        self.send_packet(command.as_bytes())?;
        let reply = self.recv_frame(RECV_TIMEOUT)?;

        if let Some(e) = packet::error_reply(&reply) {
            return Err(Error::GdbReported(e));
        }

        if reply == b"OK" {
            debug!("OK ({:.1} ms)", started.elapsed().as_secs_f64() * 1e3);
            return Ok(());
        }

        if reply.first() == Some(&b'O') {
            log_console_output(&reply[1..]);
            loop {
                match self.recv_frame(ERROR_DATA_TIMEOUT) {
                    Ok(next) => {
                        if let Some(e) = packet::error_reply(&next) {
                            return Err(Error::GdbReported(e));
                        }
                        match next.split_first() {
                            Some((b'O', rest)) => log_console_output(rest),
                            _ => log_console_output(&next),
                        }
                    }
                    Err(Error::RecvTimeout) => break,
                    Err(e) => return Err(e),
                }
            }
            return Ok(());
        }

        if reply.is_empty() {
            warn!("\"unsupported command\"");
        } else {
            warn!("\"{}\"", String::from_utf8_lossy(&reply));
        }
        self.drain_unsolicited();
        Err(Error::BadResponse)
    }
}

/// Decode a hex-ASCII console-output payload and log it, with newlines
/// flattened to spaces.
fn log_console_output(hex_text: &[u8]) {
    let mut decoded = vec![0u8; hex_text.len() / 2];
    if hex::decode_hex_buf(&hex_text[..decoded.len() * 2], &mut decoded).is_err() {
        warn!("Malformed console output: {}", String::from_utf8_lossy(hex_text));
        return;
    }
    for byte in decoded.iter_mut() {
        if *byte == b'\n' {
            *byte = b' ';
        }
    }
    info!("\"{}\"", String::from_utf8_lossy(&decoded));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockServer;

    #[test]
    fn console_output_chain_is_collected() {
        let mut mock = MockServer::new(0, Vec::new());
        // "Hello\nworld" as hex-ASCII console output, then a chained OK.
        mock.canned.insert(
            "qRcmd,7265736574".into(),
            vec![b"O48656c6c6f0a776f726c64".to_vec(), b"OK".to_vec()],
        );
        let mut session = Session::establish(mock, None).unwrap();
        session.execute("qRcmd,7265736574").unwrap();
    }

    #[test]
    fn chained_error_is_reported() {
        use crate::error::GdbError;

        let mut mock = MockServer::new(0, Vec::new());
        mock.canned.insert(
            "qRcmd,7265736574".into(),
            vec![b"O6f6f7073".to_vec(), b"E03".to_vec()],
        );
        let mut session = Session::establish(mock, None).unwrap();
        let result = session.execute("qRcmd,7265736574");
        assert!(matches!(
            result,
            Err(Error::GdbReported(GdbError::Code(3)))
        ));
    }

    #[test]
    fn ok_classified_as_success() {
        let mock = MockServer::new(0x1000, vec![0u8; 64]);
        let mut session = Session::establish(mock, None).unwrap();
        session.execute("M00001000,4:DEADBEEF").unwrap();
    }

    #[test]
    fn unsupported_command_is_bad_response() {
        let mock = MockServer::new(0, Vec::new());
        let mut session = Session::establish(mock, None).unwrap();
        let result = session.execute("qRcmd,deadbeef");
        assert!(matches!(result, Err(Error::BadResponse)));
    }

    #[test]
    fn over_long_command_is_bad_input() {
        let mock = MockServer::new(0, Vec::new());
        let mut session = Session::establish(mock, None).unwrap();
        let long = "X".repeat(session.max_send_packet());
        assert!(matches!(session.execute(&long), Err(Error::BadInput)));
    }
}
