//! Command-line interface.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::Parser;

use crate::session::MIN_PACKET_SIZE;
use crate::target::{MAX_STRUCT_SIZE, MIN_STRUCT_SIZE};

/// Most helper processes that may be raised to elevated priority.
pub const MAX_DRIVERS: usize = 5;

/// Transfer the firmware log-data structure to the host over a GDB server.
#[derive(Parser, Debug)]
#[command(name = "gdbgrab", version)]
pub struct Cli {
    /// GDB server TCP port
    pub port: u16,

    /// Address of the log-data structure (hex, 32-bit word aligned)
    #[arg(value_parser = parse_hex_u32)]
    pub address: u32,

    /// Size of the structure in bytes (hex; 0 = read it from the header)
    #[arg(value_parser = parse_hex_u32)]
    pub size: u32,

    /// Output file for the binary image
    #[arg(long = "bin", value_name = "FILE", default_value = "data.bin")]
    pub bin_file: PathBuf,

    /// Message filter value to set after the transfer (hex)
    #[arg(long, value_name = "HEX", value_parser = parse_hex_u32)]
    pub filter: Option<u32>,

    /// File naming the 32 filter bits, one per line (blank = omit)
    #[arg(long = "filter-names", value_name = "FILE")]
    pub filter_names: Option<PathBuf>,

    /// Clear the circular buffer after the transfer
    #[arg(long)]
    pub clear: bool,

    /// Stay connected for repeated transfers (interactive mode)
    #[arg(short = 'p', long = "persistent")]
    pub persistent: bool,

    /// Delay in ms between pausing the logging and the bulk read
    #[arg(long, value_name = "MS")]
    pub delay: Option<u64>,

    /// IPv4 address of the GDB server
    #[arg(long, value_name = "A.B.C.D", default_value = "127.0.0.1")]
    pub ip: Ipv4Addr,

    /// Redirect log output to a file
    #[arg(long, value_name = "FILE")]
    pub log: Option<PathBuf>,

    /// Command script executed after connecting
    #[arg(long = "start", value_name = "FILE")]
    pub start_script: Option<PathBuf>,

    /// Send a detach command before disconnecting
    #[arg(long)]
    pub detach: bool,

    /// Batch file to run after each successful transfer
    #[arg(long = "decode", value_name = "FILE")]
    pub decode_file: Option<String>,

    /// Log raw RSP traffic
    #[arg(long)]
    pub debug: bool,

    /// Raise process priorities while connected
    #[arg(long)]
    pub priority: bool,

    /// Helper process to raise the priority of (repeatable)
    #[arg(long = "driver", value_name = "NAME")]
    pub drivers: Vec<String>,

    /// Receive-packet size override in bytes (256..=65535)
    #[arg(long, value_name = "N")]
    pub msgsize: Option<usize>,
}

/// Validated runtime parameters.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub start_address: u32,
    /// Total structure size in bytes; refreshed from the header when the
    /// target reports a different value.
    pub size: u32,
    pub bin_file: PathBuf,
    /// Filter value written back after a transfer when `set_filter` is on.
    pub filter: u32,
    pub set_filter: bool,
    pub filter_names: Option<PathBuf>,
    pub clear_buffer: bool,
    pub persistent: bool,
    pub delay_ms: u64,
    pub ip: Ipv4Addr,
    pub log_file: Option<PathBuf>,
    pub start_script: Option<PathBuf>,
    pub detach: bool,
    pub decode_file: Option<String>,
    pub debug: bool,
    pub elevated_priority: bool,
    pub drivers: Vec<String>,
    pub max_message_size: Option<usize>,
}

impl Cli {
    pub fn into_config(self) -> Result<Config, String> {
        if self.size & 3 != 0 || (self.size != 0 && self.size < MIN_STRUCT_SIZE) {
            return Err(format!(
                "The size parameter must be divisible by 4 and at least {} (or 0).",
                MIN_STRUCT_SIZE
            ));
        }
        if self.size > MAX_STRUCT_SIZE {
            return Err(format!(
                "The size parameter must not exceed {}.",
                MAX_STRUCT_SIZE
            ));
        }
        if self.address & 3 != 0 {
            return Err("The address parameter must be 32-bit word aligned.".into());
        }
        if let Some(delay) = self.delay {
            if delay == 0 {
                return Err("The --delay parameter cannot be zero.".into());
            }
        }
        if let Some(size) = self.msgsize {
            if !(MIN_PACKET_SIZE..=65535).contains(&size) {
                return Err(format!(
                    "The --msgsize parameter must be between {} and 65535.",
                    MIN_PACKET_SIZE
                ));
            }
        }
        if self.drivers.len() > MAX_DRIVERS {
            return Err(format!(
                "The --driver argument can be used at most {} times.",
                MAX_DRIVERS
            ));
        }

        Ok(Config {
            port: self.port,
            start_address: self.address,
            size: self.size,
            bin_file: self.bin_file,
            filter: self.filter.unwrap_or(0),
            set_filter: self.filter.is_some(),
            filter_names: self.filter_names,
            clear_buffer: self.clear,
            persistent: self.persistent,
            delay_ms: self.delay.unwrap_or(0),
            ip: self.ip,
            log_file: self.log,
            start_script: self.start_script,
            detach: self.detach,
            decode_file: self.decode_file,
            debug: self.debug,
            // Naming a helper process implies the elevation itself.
            elevated_priority: self.priority || !self.drivers.is_empty(),
            drivers: self.drivers,
            max_message_size: self.msgsize,
        })
    }
}

fn parse_hex_u32(value: &str) -> Result<u32, String> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u32::from_str_radix(digits, 16).map_err(|e| format!("not a hex number: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config, String> {
        let mut argv = vec!["gdbgrab"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv)
            .map_err(|e| e.to_string())
            .and_then(Cli::into_config)
    }

    #[test]
    fn minimal_arguments() {
        let config = parse(&["3333", "24000000", "0"]).unwrap();
        assert_eq!(config.port, 3333);
        assert_eq!(config.start_address, 0x2400_0000);
        assert_eq!(config.size, 0);
        assert_eq!(config.bin_file, PathBuf::from("data.bin"));
        assert_eq!(config.ip, Ipv4Addr::LOCALHOST);
        assert!(!config.set_filter);
        assert_eq!(config.delay_ms, 0);
    }

    #[test]
    fn filter_option_marks_override() {
        let config = parse(&["3333", "24000000", "0", "--filter", "0x10"]).unwrap();
        assert!(config.set_filter);
        assert_eq!(config.filter, 0x10);
    }

    #[test]
    fn misaligned_address_is_rejected() {
        assert!(parse(&["3333", "24000002", "0"]).is_err());
    }

    #[test]
    fn size_bounds_are_checked() {
        assert!(parse(&["3333", "24000000", "2"]).is_err());
        assert!(parse(&["3333", "24000000", "10"]).is_err()); // 16 < MIN
        assert!(parse(&["3333", "24000000", "50"]).is_ok()); // 0x50 = 80
        assert!(parse(&["3333", "24000000", "FFFFFFC"]).is_err());
    }

    #[test]
    fn msgsize_range() {
        assert!(parse(&["3333", "24000000", "0", "--msgsize", "255"]).is_err());
        assert!(parse(&["3333", "24000000", "0", "--msgsize", "65536"]).is_err());
        let config = parse(&["3333", "24000000", "0", "--msgsize", "4096"]).unwrap();
        assert_eq!(config.max_message_size, Some(4096));
    }

    #[test]
    fn zero_delay_is_rejected() {
        assert!(parse(&["3333", "24000000", "0", "--delay", "0"]).is_err());
        assert_eq!(
            parse(&["3333", "24000000", "0", "--delay", "5"])
                .unwrap()
                .delay_ms,
            5
        );
    }

    #[test]
    fn driver_count_is_limited() {
        let mut args = vec!["3333", "24000000", "0"];
        for _ in 0..6 {
            args.push("--driver");
            args.push("jlink");
        }
        assert!(parse(&args).is_err());

        let config = parse(&["3333", "24000000", "0", "--driver", "jlink"]).unwrap();
        assert!(config.elevated_priority);
    }
}
