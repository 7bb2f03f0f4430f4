//! Logging backend behind the `log` facade.
//!
//! Messages go to stdout by default, or to the file named with `--log`.
//! Logging can be suppressed at runtime (status polling and the benchmark
//! turn it off unless `--debug` is set), and the file redirection can be
//! toggled from the interactive loop.

use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use log::{Level, LevelFilter, Log, Metadata, Record};

static ENABLED: AtomicBool = AtomicBool::new(true);
static TO_FILE: AtomicBool = AtomicBool::new(false);
static LOG_FILE: Mutex<Option<File>> = Mutex::new(None);

struct GrabLogger;

impl Log for GrabLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        ENABLED.load(Ordering::Relaxed)
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let line = match record.level() {
            Level::Error => format!("Error: {}", record.args()),
            Level::Warn => format!("Warning: {}", record.args()),
            _ => record.args().to_string(),
        };

        if TO_FILE.load(Ordering::Relaxed) {
            let mut file = LOG_FILE.lock().unwrap();
            if let Some(file) = file.as_mut() {
                // Flushed per line so the file can be followed live.
                let _ = writeln!(file, "{}", line);
                let _ = file.flush();
                return;
            }
        }
        println!("{}", line);
    }

    fn flush(&self) {}
}

/// Install the logger. `--debug` raises the level filter so raw RSP frames
/// become visible. A log file that cannot be created falls back to stdout.
pub fn init(log_file: Option<&Path>, debug: bool) {
    if let Some(path) = log_file {
        match File::create(path) {
            Ok(file) => {
                *LOG_FILE.lock().unwrap() = Some(file);
                TO_FILE.store(true, Ordering::Relaxed);
            }
            Err(e) => eprintln!("Could not create log file \"{}\": {}", path.display(), e),
        }
    }

    if log::set_boxed_logger(Box::new(GrabLogger)).is_ok() {
        log::set_max_level(if debug {
            LevelFilter::Trace
        } else {
            LevelFilter::Debug
        });
    }
}

/// Suppress or re-enable all log output.
pub fn enable(on: bool) {
    ENABLED.store(on, Ordering::Relaxed);
}

/// True when log output currently goes to a file rather than the console.
pub fn logging_to_file() -> bool {
    TO_FILE.load(Ordering::Relaxed)
}

/// Flip between file and console logging. A no-op without `--log`.
pub fn toggle_file_logging() {
    if LOG_FILE.lock().unwrap().is_none() {
        println!("No log file configured (use --log=FILE).");
        return;
    }
    let now_to_file = !TO_FILE.load(Ordering::Relaxed);
    TO_FILE.store(now_to_file, Ordering::Relaxed);
    println!(
        "Logging to {}.",
        if now_to_file { "the log file" } else { "the console" }
    );
}
