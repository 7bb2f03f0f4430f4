//! Optional process-priority elevation.
//!
//! `--priority` (or naming a `--driver`) renices this process and the named
//! helper processes while the transfer runs, and restores them on teardown.
//! Strictly an OS scheduling hint; the protocol never depends on it.

use std::fs;
use std::io;

use log::{debug, warn};

use crate::cli::Config;

const ELEVATED_NICE: libc::c_int = -20;
const NORMAL_NICE: libc::c_int = 0;

/// Raise the priorities of this process and the configured helpers.
pub fn increase(config: &Config) {
    if !config.elevated_priority {
        return;
    }
    set_own_priority(ELEVATED_NICE);
    for name in &config.drivers {
        set_priority_by_name(name, ELEVATED_NICE, true);
    }
}

/// Put the priorities back to normal.
pub fn decrease(config: &Config) {
    if !config.elevated_priority {
        return;
    }
    set_own_priority(NORMAL_NICE);
    for name in &config.drivers {
        set_priority_by_name(name, NORMAL_NICE, false);
    }
}

fn set_own_priority(nice: libc::c_int) {
    if unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) } != 0 {
        warn!(
            "Could not set own process priority: {}",
            io::Error::last_os_error()
        );
    }
}

fn set_priority_by_name(name: &str, nice: libc::c_int, report_errors: bool) {
    let Some(pid) = find_pid_by_name(name) else {
        if report_errors {
            warn!("Process {} not found.", name);
        }
        return;
    };

    if unsafe { libc::setpriority(libc::PRIO_PROCESS, pid, nice) } != 0 && report_errors {
        warn!(
            "Failed to set priority for process {}: {}",
            name,
            io::Error::last_os_error()
        );
    } else {
        debug!("Priority of {} (pid {}) set to {}", name, pid, nice);
    }
}

/// Find a process id by executable name via `/proc/<pid>/comm`.
fn find_pid_by_name(name: &str) -> Option<libc::id_t> {
    for entry in fs::read_dir("/proc").ok()? {
        let entry = entry.ok()?;
        let Ok(pid) = entry.file_name().to_string_lossy().parse::<libc::id_t>() else {
            continue;
        };
        if let Ok(comm) = fs::read_to_string(entry.path().join("comm")) {
            if comm.trim_end() == name {
                return Some(pid);
            }
        }
    }
    None
}
