//! Command scripts.
//!
//! A script is UTF-8 text with one command per line. Lines starting with
//! `##` are comments and lines starting with a single `#` are meta-commands
//! executed locally; everything else is sent to the GDB server verbatim.
//! A failing RSP command aborts the script, a failing meta-command logs
//! and continues.

use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use log::{info, warn};

use crate::conn::Connection;
use crate::error::{Error, Result};
use crate::target::TargetLog;

impl<C: Connection> TargetLog<C> {
    /// Run every command in `path` against the server.
    pub fn run_script(&mut self, path: &Path) -> Result<()> {
        // A reset or breakpoint triggered earlier may have left stop
        // replies in the socket.
        self.session_mut().drain_unsolicited();

        info!("Execute command file: \"{}\" ...", path.display());
        let text = fs::read_to_string(path).map_err(|e| {
            warn!("Could not open command file \"{}\": {}", path.display(), e);
            Error::Io(e)
        })?;

        for line in text.lines() {
            let line = line.trim_end_matches('\r');
            if line.is_empty() {
                continue;
            }
            if line.starts_with("##") {
                continue;
            }
            if line.starts_with('#') {
                self.meta_command(line);
            } else {
                self.session_mut().execute(line)?;
            }
        }
        Ok(())
    }

    /// Execute a `#`-prefixed meta-command locally.
    fn meta_command(&mut self, line: &str) {
        if !line.starts_with("#echo ") {
            info!("   \"{}\"", line);
        }

        if let Some(arg) = line.strip_prefix("#delay ") {
            match arg.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => {
                    thread::sleep(Duration::from_millis(ms));
                    self.session_mut().drain_unsolicited();
                }
                _ => warn!("#delay needs a positive millisecond count"),
            }
        } else if let Some(args) = line.strip_prefix("#init ") {
            let mut fields = args.split_whitespace();
            let cfg_word = fields
                .next()
                .and_then(|v| parse_hex(v).ok());
            let frequency = fields.next().and_then(|v| v.parse::<u32>().ok());
            match (cfg_word, frequency) {
                (Some(cfg_word), Some(frequency)) => {
                    println!("Logging data structure initialization");
                    let _ = self.initialize_structure(cfg_word, frequency);
                }
                _ => warn!(
                    "#init needs two parameters: config word (hex) and \
                     timestamp frequency (decimal)"
                ),
            }
        } else if let Some(arg) = line.strip_prefix("#filter ") {
            match parse_hex(arg.trim()) {
                Ok(value) => {
                    let _ = self.set_filter_value(Some(value));
                }
                Err(_) => warn!("#filter needs a hex value"),
            }
        } else if let Some(text) = line.strip_prefix("#echo ") {
            println!("   {}", text);
        } else {
            warn!("Unknown meta-command: \"{}\"", line);
        }
    }
}

fn parse_hex(value: &str) -> Result<u32> {
    let digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value);
    u32::from_str_radix(digits, 16).map_err(|_| Error::BadFormat)
}

/// Launch the decode batch file named with `--decode` through the shell.
pub fn run_batch_file(command: &str) {
    println!("\nStarting the batch file: {}", command);
    match std::process::Command::new("sh").arg("-c").arg(command).status() {
        Ok(status) if status.success() => {}
        _ => println!("The '{}' batch file could not be started!", command),
    }
}
