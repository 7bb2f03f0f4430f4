//! Persistent-mode interactive loop.
//!
//! A single actor alternates between polling the keyboard (~50 ms) and
//! refreshing a status line with the live write index and filter value
//! (~350 ms). Unsolicited server frames are drained before every dispatch
//! so stale stop replies cannot corrupt later exchanges.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use log::error;

use crate::console::Console;
use crate::conn::TcpTransport;
use crate::error::{Error, Result};
use crate::logger;
use crate::script;
use crate::target::TargetLog;

const KEY_POLL_INTERVAL: Duration = Duration::from_millis(50);
const STATUS_PERIOD: Duration = Duration::from_millis(350);

/// Run the interactive loop until the user exits.
pub fn run(log: &mut TargetLog<TcpTransport>) -> Result<()> {
    let mut console = Console::new()?;
    println!("Press the '?' key for a list of available commands.");
    let mut last_status = Instant::now();

    loop {
        let Some(key) = console.poll_key(KEY_POLL_INTERVAL)? else {
            display_logging_state(log, &mut last_status);
            continue;
        };

        println!();
        log.session_mut().drain_unsolicited();

        match key.to_ascii_uppercase() {
            b'?' => show_help(),
            b'H' => load_and_display_header(log),
            b'B' => {
                let mut interrupted = || {
                    matches!(console.poll_key(Duration::ZERO), Ok(Some(_)))
                };
                report(log.benchmark(&mut interrupted));
            }
            b'S' => report(log.switch_to_single_shot()),
            b'P' => report(log.switch_to_post_mortem()),
            b'F' => prompt_new_filter(log, &mut console)?,
            b'L' => logger::toggle_file_logging(),
            b'0' => match log.config().start_script.clone() {
                Some(path) => report(log.run_script(&path)),
                None => {
                    println!("Command file not defined with the --start argument.")
                }
            },
            key @ b'1'..=b'9' => {
                report(log.run_script(Path::new(&format!("{}.cmd", key as char))))
            }
            b' ' => {
                let result = log.snapshot();
                if result.is_ok() {
                    if let Some(decode) = log.config().decode_file.clone() {
                        script::run_batch_file(&decode);
                    }
                }
                report(result);
            }
            b'R' => {
                println!("Reconnecting to the GDB server ...");
                report(log.reconnect());
            }
            0x1B => {
                print!("\nPress the 'Y' button to exit the program.");
                io::stdout().flush()?;
                if console.wait_key()?.to_ascii_uppercase() == b'Y' {
                    return Ok(());
                }
            }
            _ => println!(
                "Unknown command - Press the '?' key for a list of available commands."
            ),
        }
    }
}

fn show_help() {
    println!(
        "\nAvailable commands:\n\
         \x20  'Space' - Start data transfer and decoding if the --decode=FILE argument is used.\n\
         \x20  'F' - Set new filter value.\n\
         \x20  'S' - Switch to single shot mode and restart logging.\n\
         \x20  'P' - Switch to post-mortem mode and restart logging.\n\
         \x20  '0' - Restart the script defined with the --start argument.\n\
         \x20  '1' ... '9' - Start the command file 1.cmd ... 9.cmd.\n\
         \x20  'B' - Benchmark data transfer speed.\n\
         \x20  'H' - Load the data logging structure header and display information.\n\
         \x20  'L' - Enable / disable logging to the log file.\n\
         \x20  'R' - Reconnect to the GDB server.\n\
         \x20  '?' - View an overview of available commands.\n\
         \x20  'Esc' - Exit.\n\
         ----------------------------------------------------------------------"
    );
}

/// Refresh the status line. Runs a quiet header read at most every 350 ms
/// and otherwise just naps to keep the keyboard poll responsive.
fn display_logging_state(log: &mut TargetLog<TcpTransport>, last_status: &mut Instant) {
    if last_status.elapsed() < STATUS_PERIOD {
        std::thread::sleep(KEY_POLL_INTERVAL);
        return;
    }
    *last_status = Instant::now();

    if !log.config().debug {
        logger::enable(false);
    }
    log.session_mut().drain_unsolicited();
    let result = log.load_header();
    logger::enable(true);

    match result {
        Ok(()) => {
            let header = log.header();
            if header.cfg.single_shot_active() && header.cfg.single_shot_enabled() {
                // The firmware stops a single-shot run a few words early.
                let size = header.buffer_size.saturating_sub(4).max(1);
                let usage = ((100 * header.last_index + size / 2) / size).min(100);
                print!(
                    "\rIndex:{:6}, filter: 0x{:08X}, {}% used               ",
                    header.last_index, header.filter, usage
                );
            } else {
                print!(
                    "\rIndex:{:6}, filter: 0x{:08X}                       ",
                    header.last_index, header.filter
                );
            }
        }
        Err(_) => print!("\rCannot read data from the embedded system.              "),
    }
    let _ = io::stdout().flush();
}

fn load_and_display_header(log: &mut TargetLog<TcpTransport>) {
    if report_err(log.load_header()).is_none() {
        return;
    }
    if log.validate_header().is_err() {
        println!("Incorrect header info (incorrect address or logging not initialized).");
        return;
    }
    print_header_info(log);
}

fn print_header_info(log: &TargetLog<TcpTransport>) {
    let header = log.header();
    let cfg = header.cfg;

    let mhz = header.timestamp_frequency as f64 / 1e6 / (1u64 << cfg.timestamp_shift()) as f64;
    println!(
        "Circular buffer size: {} words, last index: {}, timestamp frequency: {} MHz, \
         long timestamps {}, {}",
        header.buffer_size,
        header.last_index,
        mhz,
        if cfg.long_timestamps() {
            "enabled"
        } else {
            "disabled"
        },
        if cfg.single_shot_enabled() && cfg.single_shot_active() {
            "single shot mode"
        } else {
            "post-mortem mode"
        }
    );

    if !cfg.filtering_enabled() {
        println!("Message filtering disabled in the firmware.");
    } else {
        print_filter_info(log);
    }
}

/// List the enabled filter bits, by name when a `--filter-names` file is
/// given and by number otherwise. Bit 0 is the most significant bit.
fn print_filter_info(log: &TargetLog<TcpTransport>) {
    let header = log.header();
    if header.filter == 0 {
        println!("Message filter: 0 (data logging disabled).");
        return;
    }

    let names: Option<Vec<String>> = match &log.config().filter_names {
        Some(path) => match fs::read_to_string(path) {
            Ok(text) => Some(text.lines().map(str::to_string).collect()),
            Err(e) => {
                println!("Cannot open \"{}\" file. Error: {}", path.display(), e);
                None
            }
        },
        None => None,
    };

    println!("Enabled message filters (0x{:08X}):", header.filter);
    let mut numbers = Vec::new();
    for bit in 0..32u32 {
        if header.filter & 0x8000_0000 >> bit == 0 {
            continue;
        }
        match &names {
            Some(names) => {
                if let Some(name) = names.get(bit as usize).filter(|n| !n.is_empty()) {
                    println!("{:2} - {}", bit, name);
                }
            }
            None => numbers.push(bit.to_string()),
        }
    }
    if !numbers.is_empty() {
        println!("{}", numbers.join(", "));
    }
}

/// Prompt for a new filter value. Enter (or anything that does not parse
/// as hex) keeps the previous parameter value.
fn prompt_new_filter(
    log: &mut TargetLog<TcpTransport>,
    console: &mut Console,
) -> io::Result<()> {
    let prompt = format!(
        "Enter new filter value -> -1=ALL (0x{:X}): ",
        log.config().filter
    );
    let line = console.read_line(&prompt)?;
    let value = parse_filter_value(&line);
    report(log.set_filter_value(value));
    Ok(())
}

fn parse_filter_value(line: &str) -> Option<u32> {
    let line = line.trim();
    if line == "-1" {
        return Some(u32::MAX);
    }
    let digits = line
        .strip_prefix("0x")
        .or_else(|| line.strip_prefix("0X"))
        .unwrap_or(line);
    u32::from_str_radix(digits, 16).ok()
}

/// Show a short classified message for a failed command and keep running.
fn report(result: Result<()>) {
    let _ = report_err(result);
}

fn report_err(result: Result<()>) -> Option<()> {
    let e = match result {
        Ok(()) => return Some(()),
        Err(e) => e,
    };

    error!("{}", e);
    match &e {
        e if e.is_connection_lost() => {
            println!("Could not execute command: connection to the GDB server lost.");
            println!("Press 'R' to reconnect.");
        }
        Error::RecvTimeout | Error::SendTimeout => {
            println!("Could not execute command: can not communicate with the GDB server.")
        }
        Error::GdbReported(_) => {
            println!("Could not execute command: GDB server reported an error.")
        }
        Error::Io(_) => println!("Could not execute command: file operation failed."),
        _ => println!("Could not execute command: problem communicating with the GDB server."),
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_prompt_parsing() {
        assert_eq!(parse_filter_value(""), None);
        assert_eq!(parse_filter_value("nonsense"), None);
        assert_eq!(parse_filter_value("-1"), Some(u32::MAX));
        assert_eq!(parse_filter_value("10"), Some(0x10));
        assert_eq!(parse_filter_value("0x10"), Some(0x10));
        assert_eq!(parse_filter_value(" f "), Some(0xF));
    }
}
