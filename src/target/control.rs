//! Operations against the live log-data structure: the pause / read /
//! restore sequence, buffer resets, logging-mode switches and structure
//! initialization.
//!
//! Each operation is atomic with respect to its own success: a failing step
//! skips the following state-mutating steps, and the snapshot sequence
//! restores the message filter on a best-effort basis before surfacing the
//! error. Already-made changes are not rolled back.

use std::fs::File;
use std::io::Write;
use std::thread;
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error, info, warn};

use super::header::{CfgWord, Header, CFG_OFFSET, FILTER_OFFSET, HEADER_SIZE};
use super::{MAX_STRUCT_SIZE, MIN_STRUCT_SIZE};
use crate::cli::Config;
use crate::conn::{Connection, TcpTransport};
use crate::error::{Error, Result};
use crate::session::Session;

/// Client-side handle to the log-data structure in target memory.
///
/// Owns the session, the last header image read from the target and the
/// host-side mirror of the whole structure.
pub struct TargetLog<C: Connection> {
    session: Session<C>,
    config: Config,
    header: Header,
    mirror: Vec<u8>,
    /// Filter value observed before logging was paused.
    old_filter: u32,
}

impl<C: Connection> TargetLog<C> {
    pub fn new(session: Session<C>, config: Config) -> TargetLog<C> {
        TargetLog {
            session,
            config,
            header: Header::default(),
            mirror: Vec::new(),
            old_filter: 0,
        }
    }

    pub fn session_mut(&mut self) -> &mut Session<C> {
        &mut self.session
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    fn filter_addr(&self) -> u32 {
        self.config.start_address + FILTER_OFFSET
    }

    fn cfg_addr(&self) -> u32 {
        self.config.start_address + CFG_OFFSET
    }

    fn read_filter(&mut self) -> Result<u32> {
        let mut word = [0u8; 4];
        self.session.read_memory(self.filter_addr(), &mut word)?;
        Ok(LittleEndian::read_u32(&word))
    }

    fn write_word(&mut self, addr: u32, value: u32) -> Result<()> {
        let mut word = [0u8; 4];
        LittleEndian::write_u32(&mut word, value);
        self.session.write_memory(addr, &word)
    }

    /// Pause data logging by zeroing the message-filter word.
    pub fn pause_logging(&mut self) -> Result<()> {
        self.write_word(self.filter_addr(), 0)
    }

    /// Read the header from the target and size the mirror to match.
    ///
    /// A size of 0 means "take the size from the header"; a header whose
    /// size differs from the configured one also wins, after a bounds
    /// check.
    pub fn load_header(&mut self) -> Result<()> {
        let mut buf = [0u8; HEADER_SIZE];
        self.session.read_memory(self.config.start_address, &mut buf)?;
        self.header = Header::from_bytes(&buf);

        let new_size = self.header.total_size();
        if self.config.size == 0 || new_size != self.config.size {
            if !(MIN_STRUCT_SIZE..=MAX_STRUCT_SIZE).contains(&new_size) {
                error!(
                    "The buffer size in the structure header is out of range ({} bytes). \
                     Check the structure address and that the target has initialized logging.",
                    new_size
                );
                return Err(Error::SizeOutOfRange(new_size));
            }
            if self.config.size != 0 {
                debug!("Log data structure size changed to {}", new_size);
            }
            self.config.size = new_size;
        }

        if self.mirror.len() != self.config.size as usize {
            self.mirror = vec![0; self.config.size as usize];
        }
        Ok(())
    }

    /// Reject a header that does not match this host build.
    pub fn validate_header(&self) -> Result<()> {
        self.header.validate().map_err(|e| {
            error!(
                "Error in the structure header (incorrect header size / reserved bits). \
                 Check the structure address and that the target has initialized logging."
            );
            e
        })
    }

    /// The filter was zeroed before the bulk read; if it is non-zero now,
    /// the firmware interfered and the transferred data may be torn.
    fn check_filter_zero(&mut self) -> Result<()> {
        if self.read_filter()? != 0 {
            error!(
                "At the beginning of the transfer the message filter was set to 0 \
                 to allow an uninterrupted transfer to the host. It is no longer zero, \
                 so the filter was re-enabled by the firmware and the transferred data \
                 may be partially corrupted."
            );
            return Err(Error::FilterReenabled);
        }
        Ok(())
    }

    /// The pause / read / restore sequence producing one output file.
    pub fn snapshot(&mut self) -> Result<()> {
        self.session.drain_unsolicited();

        self.old_filter = self.read_filter()?;
        if self.old_filter != 0 {
            self.pause_logging()?;
        }

        if let Err(e) = self.transfer() {
            let _ = self.restore_filter();
            return Err(e);
        }

        self.restore_filter()?;
        self.save_mirror()
    }

    fn transfer(&mut self) -> Result<()> {
        self.load_header()?;
        self.validate_header()?;

        if self.config.delay_ms > 0 {
            // Give lower-priority target tasks time to finish in-flight
            // writes to the circular buffer.
            debug!("Delay {} ms", self.config.delay_ms);
            thread::sleep(Duration::from_millis(self.config.delay_ms));
        }

        let started = Instant::now();
        self.read_structure()?;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1e3;
        debug!(
            "Structure read: {} bytes, {:.0} kB/s",
            self.mirror.len(),
            self.mirror.len() as f64 / elapsed_ms.max(f64::MIN_POSITIVE)
        );

        self.check_filter_zero()?;
        self.reset_circular_buffer()
    }

    /// Read the whole structure into the host mirror.
    pub(super) fn read_structure(&mut self) -> Result<()> {
        self.session
            .read_memory(self.config.start_address, &mut self.mirror)
    }

    /// Restore the message filter after a transfer.
    ///
    /// Precedence: an explicit user value wins; otherwise `filter_copy`
    /// when the firmware turned logging off itself; otherwise the value
    /// observed at entry.
    pub fn restore_filter(&mut self) -> Result<()> {
        let mut value = self.old_filter;
        if value == 0 && self.header.cfg.firmware_off_allowed() {
            value = self.header.filter_copy;
        }
        if self.config.set_filter {
            value = self.config.filter;
        }
        self.write_word(self.filter_addr(), value)
    }

    /// Clear the buffer and/or restart it at index zero.
    ///
    /// `--clear` wipes the whole buffer region to 0xFF and resets the
    /// index; an active single-shot run only resets the index; otherwise
    /// this is a no-op.
    pub fn reset_circular_buffer(&mut self) -> Result<()> {
        if self.config.clear_buffer {
            self.clear_circular_buffer()?;
        }
        if self.config.clear_buffer || self.single_shot_active() {
            self.erase_buffer_index()?;
        }
        Ok(())
    }

    fn clear_circular_buffer(&mut self) -> Result<()> {
        let buffer_len = self.config.size as usize - HEADER_SIZE;
        info!("Clearing the circular buffer ...");
        let started = Instant::now();

        let fill = vec![0xFFu8; buffer_len];
        self.session
            .write_memory(self.config.start_address + HEADER_SIZE as u32, &fill)?;

        let elapsed_ms = started.elapsed().as_secs_f64() * 1e3;
        debug!(
            "Buffer cleared ({:.0} kB/s)",
            buffer_len as f64 / elapsed_ms.max(f64::MIN_POSITIVE)
        );
        Ok(())
    }

    fn erase_buffer_index(&mut self) -> Result<()> {
        self.write_word(self.config.start_address, 0)
    }

    fn single_shot_active(&self) -> bool {
        self.header.cfg.single_shot_active() && self.header.cfg.single_shot_enabled()
    }

    /// Write the mirror to the output file with the pre-pause filter value
    /// patched back in, so consumers see logging as it was.
    fn save_mirror(&mut self) -> Result<()> {
        LittleEndian::write_u32(&mut self.mirror[4..8], self.old_filter);

        let mut file = File::create(&self.config.bin_file).map_err(|e| {
            error!(
                "Could not create file \"{}\": {}",
                self.config.bin_file.display(),
                e
            );
            Error::Io(e)
        })?;
        file.write_all(&self.mirror).map_err(|e| {
            error!(
                "Could not write to the file \"{}\": {}",
                self.config.bin_file.display(),
                e
            );
            Error::Io(e)
        })?;

        info!("Data written to \"{}\"", self.config.bin_file.display());
        Ok(())
    }

    /// Switch the target to single-shot logging and restart it.
    pub fn switch_to_single_shot(&mut self) -> Result<()> {
        self.load_header()?;
        if !self.header.cfg.single_shot_enabled() {
            warn!("Single shot logging not enabled in the firmware.");
            return Ok(());
        }

        self.old_filter = self.read_filter()?;
        self.pause_logging()?;
        self.header.cfg.set_single_shot(true);
        self.write_word(self.cfg_addr(), self.header.cfg.0)?;
        self.reset_circular_buffer()?;
        self.restore_filter()?;

        info!("Single shot logging mode enabled and restarted.");
        Ok(())
    }

    /// Switch the target to post-mortem logging and restart it.
    pub fn switch_to_post_mortem(&mut self) -> Result<()> {
        self.load_header()?;
        self.old_filter = self.read_filter()?;
        self.pause_logging()?;

        let was_single_shot = self.header.cfg.single_shot_active();
        if was_single_shot {
            self.header.cfg.set_single_shot(false);
            self.write_word(self.cfg_addr(), self.header.cfg.0)?;
        }
        self.reset_circular_buffer()?;
        self.restore_filter()?;

        if was_single_shot {
            info!("Post-mortem logging mode enabled and restarted.");
        } else {
            info!("Post-mortem mode restarted.");
        }
        Ok(())
    }

    /// Set a new filter value, or re-apply the current one when `new_value`
    /// is `None`. The value sticks for later transfers.
    pub fn set_filter_value(&mut self, new_value: Option<u32>) -> Result<()> {
        if !self.header.cfg.filtering_enabled() {
            warn!("Message filtering disabled in the firmware.");
            return Ok(());
        }

        if let Some(value) = new_value {
            self.config.filter = value;
        }
        self.config.set_filter = true;
        self.restore_filter()?;
        info!("Message filter set to 0x{:X}", self.config.filter);
        Ok(())
    }

    /// Build and write a fresh structure header for targets whose firmware
    /// omits its own init routine, then clear the buffer and optionally
    /// enable logging.
    pub fn initialize_structure(&mut self, cfg_word: u32, timestamp_frequency: u32) -> Result<()> {
        if timestamp_frequency == 0 {
            warn!("The timestamp frequency must not be zero");
            return Err(Error::BadInput);
        }
        if self.config.size == 0 {
            warn!("The size command line argument must not be zero");
            return Err(Error::BadInput);
        }

        let header = Header {
            last_index: 0,
            filter: 0,
            cfg: CfgWord(cfg_word),
            timestamp_frequency,
            filter_copy: self.config.filter,
            buffer_size: (self.config.size - HEADER_SIZE as u32) / 4,
        };

        self.pause_logging()?;
        self.session
            .write_memory(self.config.start_address, &header.to_bytes())?;
        self.header = header;
        self.clear_circular_buffer()?;

        if self.config.filter != 0 {
            self.write_word(self.filter_addr(), self.config.filter)?;
        }

        info!("The data logging structure has been initialized.");
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn connection(&self) -> &C {
        self.session.connection()
    }
}

impl TargetLog<TcpTransport> {
    /// Drop the current session and establish a fresh one to the same
    /// server.
    pub fn reconnect(&mut self) -> Result<()> {
        let transport = TcpTransport::connect(self.config.ip, self.config.port)?;
        self.session = Session::establish(transport, self.config.max_message_size)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GdbError;
    use crate::testing::MockServer;
    use std::net::Ipv4Addr;

    const BASE: u32 = 0x2400_0000;

    fn test_config(name: &str, size: u32) -> Config {
        Config {
            port: 3333,
            start_address: BASE,
            size,
            bin_file: std::env::temp_dir().join(format!("gdbgrab_{}.bin", name)),
            filter: 0,
            set_filter: false,
            filter_names: None,
            clear_buffer: false,
            persistent: false,
            delay_ms: 0,
            ip: Ipv4Addr::LOCALHOST,
            log_file: None,
            start_script: None,
            detach: false,
            decode_file: None,
            debug: false,
            elevated_priority: false,
            drivers: Vec::new(),
            max_message_size: None,
        }
    }

    fn target_image(header: Header, fill: u8) -> Vec<u8> {
        let mut mem = vec![fill; header.total_size() as usize];
        mem[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
        mem
    }

    fn make_log(name: &str, header: Header, config_size: u32) -> TargetLog<MockServer> {
        let mock = MockServer::new(BASE, target_image(header, 0xA5));
        let session = Session::establish(mock, None).unwrap();
        TargetLog::new(session, test_config(name, config_size))
    }

    fn filter_in_mem(log: &TargetLog<MockServer>) -> u32 {
        LittleEndian::read_u32(&log.connection().mem.borrow()[4..8])
    }

    fn read_bin(config: &Config) -> Vec<u8> {
        let data = std::fs::read(&config.bin_file).unwrap();
        let _ = std::fs::remove_file(&config.bin_file);
        data
    }

    /// Post-mortem target, filter enabled, automatic size detection.
    #[test]
    fn snapshot_preserves_prepause_filter_in_file() {
        let header = Header {
            last_index: 100,
            filter: 0x0F,
            cfg: CfgWord(6 << 24 | 1 << 1),
            timestamp_frequency: 48_000_000,
            filter_copy: 0,
            buffer_size: 2048,
        };
        let mut log = make_log("snap1", header, 0);
        log.snapshot().unwrap();

        let file = read_bin(log.config());
        assert_eq!(file.len(), 24 + 2048 * 4);
        assert_eq!(&file[4..8], &[0x0F, 0, 0, 0]);
        // The live target got its original filter back.
        assert_eq!(filter_in_mem(&log), 0x0F);
        // First write on the wire was the pause.
        let writes = log.connection().writes.clone();
        assert_eq!(writes.borrow()[0], (BASE + 4, vec![0, 0, 0, 0]));
    }

    #[test]
    fn snapshot_applies_user_filter_override() {
        let header = Header {
            last_index: 100,
            filter: 0x0F,
            cfg: CfgWord(6 << 24 | 1 << 1),
            timestamp_frequency: 48_000_000,
            filter_copy: 0,
            buffer_size: 2048,
        };
        let mut log = make_log("snap2", header, 0);
        log.config.filter = 0x10;
        log.config.set_filter = true;
        log.snapshot().unwrap();

        let file = read_bin(log.config());
        // The file keeps the pre-pause value; the target gets the override.
        assert_eq!(&file[4..8], &[0x0F, 0, 0, 0]);
        assert_eq!(filter_in_mem(&log), 0x10);
    }

    #[test]
    fn snapshot_restores_filter_copy_after_firmware_off() {
        let header = Header {
            last_index: 10,
            filter: 0,
            cfg: CfgWord(6 << 24 | 1 << 1 | 1 << 2),
            timestamp_frequency: 48_000_000,
            filter_copy: 0x55,
            buffer_size: 256,
        };
        let mut log = make_log("snap3", header, 0);
        log.snapshot().unwrap();

        let file = read_bin(log.config());
        assert_eq!(&file[4..8], &[0, 0, 0, 0]);
        assert_eq!(filter_in_mem(&log), 0x55);

        // Logging was already off, so the only write is the restore.
        let writes = log.connection().writes.clone();
        assert_eq!(writes.borrow().as_slice(), [(BASE + 4, vec![0x55, 0, 0, 0])]);
    }

    #[test]
    fn snapshot_with_clear_wipes_buffer_and_index() {
        let header = Header {
            last_index: 33,
            filter: 0x1,
            cfg: CfgWord(6 << 24 | 1 << 1 | 1 << 3 | 1),
            timestamp_frequency: 48_000_000,
            filter_copy: 0,
            buffer_size: 256,
        };
        let mut log = make_log("snap4", header, 0);
        log.config.clear_buffer = true;
        log.snapshot().unwrap();

        let mem = log.connection().mem.clone();
        let mem = mem.borrow();
        assert!(mem[HEADER_SIZE..].iter().all(|&b| b == 0xFF));
        assert_eq!(LittleEndian::read_u32(&mem[0..4]), 0);
        assert_eq!(LittleEndian::read_u32(&mem[4..8]), 0x1);
        drop(mem);
        let _ = read_bin(log.config());
    }

    #[test]
    fn single_shot_restart_resets_index_without_clear() {
        let header = Header {
            last_index: 200,
            filter: 0x3,
            cfg: CfgWord(6 << 24 | 1 << 1 | 1 << 3 | 1),
            timestamp_frequency: 48_000_000,
            filter_copy: 0,
            buffer_size: 256,
        };
        let mut log = make_log("snap5", header, 0);
        log.snapshot().unwrap();

        let mem = log.connection().mem.clone();
        let mem = mem.borrow();
        // Buffer content untouched, index reset, filter restored.
        assert!(mem[HEADER_SIZE..].iter().all(|&b| b == 0xA5));
        assert_eq!(LittleEndian::read_u32(&mem[0..4]), 0);
        assert_eq!(LittleEndian::read_u32(&mem[4..8]), 0x3);
        drop(mem);
        let _ = read_bin(log.config());
    }

    #[test]
    fn oversized_header_is_rejected() {
        let header = Header {
            buffer_size: MAX_STRUCT_SIZE,
            cfg: CfgWord(6 << 24),
            ..Header::default()
        };
        let mut mem = vec![0u8; 64];
        mem[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
        let mock = MockServer::new(BASE, mem);
        let session = Session::establish(mock, None).unwrap();
        let mut log = TargetLog::new(session, test_config("snap6", 0));

        assert!(matches!(
            log.load_header(),
            Err(Error::SizeOutOfRange(_))
        ));
    }

    #[test]
    fn invalid_header_aborts_and_restores_filter() {
        // Header size field says 5 words; validation must fail and the
        // filter must be written back.
        let header = Header {
            last_index: 0,
            filter: 0x0F,
            cfg: CfgWord(5 << 24 | 1 << 1),
            timestamp_frequency: 1,
            filter_copy: 0,
            buffer_size: 256,
        };
        let mut log = make_log("snap7", header, 0);
        let result = log.snapshot();
        assert!(matches!(result, Err(Error::InvalidHeader)));
        assert_eq!(filter_in_mem(&log), 0x0F);
        assert!(!log.config().bin_file.exists());
    }

    #[test]
    fn switch_to_single_shot_sets_mode_bit() {
        let header = Header {
            last_index: 50,
            filter: 0x7,
            cfg: CfgWord(6 << 24 | 1 << 1 | 1 << 3),
            timestamp_frequency: 1,
            filter_copy: 0,
            buffer_size: 256,
        };
        let mut log = make_log("snap8", header, 0);
        log.switch_to_single_shot().unwrap();

        let mem = log.connection().mem.clone();
        let mem = mem.borrow();
        let cfg = CfgWord(LittleEndian::read_u32(&mem[8..12]));
        assert!(cfg.single_shot_active());
        // Index restarted for the new single-shot run.
        assert_eq!(LittleEndian::read_u32(&mem[0..4]), 0);
        assert_eq!(LittleEndian::read_u32(&mem[4..8]), 0x7);
    }

    #[test]
    fn switch_to_single_shot_requires_firmware_support() {
        let header = Header {
            filter: 0x7,
            cfg: CfgWord(6 << 24 | 1 << 1),
            buffer_size: 256,
            ..Header::default()
        };
        let mut log = make_log("snap9", header, 0);
        log.switch_to_single_shot().unwrap();

        // Refused: nothing was written.
        assert!(log.connection().writes.borrow().is_empty());
    }

    #[test]
    fn switch_to_post_mortem_clears_mode_bit() {
        let header = Header {
            last_index: 50,
            filter: 0x7,
            cfg: CfgWord(6 << 24 | 1 << 1 | 1 << 3 | 1),
            timestamp_frequency: 1,
            filter_copy: 0,
            buffer_size: 256,
        };
        let mut log = make_log("snap10", header, 0);
        log.switch_to_post_mortem().unwrap();

        let mem = log.connection().mem.clone();
        let mem = mem.borrow();
        let cfg = CfgWord(LittleEndian::read_u32(&mem[8..12]));
        assert!(!cfg.single_shot_active());
        assert_eq!(LittleEndian::read_u32(&mem[4..8]), 0x7);
    }

    #[test]
    fn initialize_structure_builds_header_and_clears_buffer() {
        let mock = MockServer::new(BASE, vec![0u8; 128]);
        let session = Session::establish(mock, None).unwrap();
        let mut log = TargetLog::new(session, test_config("snap11", 128));

        log.initialize_structure(0x0600_0006, 48_000_000).unwrap();

        let mem = log.connection().mem.clone();
        let mem = mem.borrow();
        let header = Header::from_bytes(mem[..HEADER_SIZE].try_into().unwrap());
        assert_eq!(header.last_index, 0);
        assert_eq!(header.filter, 0);
        assert_eq!(header.cfg.0, 0x0600_0006);
        assert_eq!(header.timestamp_frequency, 48_000_000);
        assert_eq!(header.buffer_size, (128 - HEADER_SIZE as u32) / 4);
        assert!(mem[HEADER_SIZE..].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn initialize_structure_validates_inputs() {
        let mock = MockServer::new(BASE, vec![0u8; 128]);
        let session = Session::establish(mock, None).unwrap();
        let mut log = TargetLog::new(session, test_config("snap12", 128));
        assert!(matches!(
            log.initialize_structure(0x0600_0006, 0),
            Err(Error::BadInput)
        ));

        log.config.size = 0;
        assert!(matches!(
            log.initialize_structure(0x0600_0006, 48_000_000),
            Err(Error::BadInput)
        ));
    }

    #[test]
    fn transfer_errors_surface_gdb_reports() {
        // Memory image shorter than the size announced in the header makes
        // the bulk read fail with a server-side error.
        let header = Header {
            filter: 0x0F,
            cfg: CfgWord(6 << 24 | 1 << 1),
            timestamp_frequency: 1,
            buffer_size: 2048,
            ..Header::default()
        };
        let mut mem = vec![0u8; 256];
        mem[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
        let mock = MockServer::new(BASE, mem);
        let session = Session::establish(mock, None).unwrap();
        let mut log = TargetLog::new(session, test_config("snap13", 0));

        let result = log.snapshot();
        assert!(matches!(
            result,
            Err(Error::GdbReported(GdbError::Code(1)))
        ));
        // Best-effort restore still ran.
        assert_eq!(filter_in_mem(&log), 0x0F);
    }
}
