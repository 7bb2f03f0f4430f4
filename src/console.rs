//! Non-blocking keyboard input for the interactive loop.
//!
//! The terminal is held in raw (non-canonical, no-echo) mode so single
//! keystrokes can be polled; line prompts temporarily restore the saved
//! settings. The original settings come back on drop.

use std::io::{self, BufRead, Read, Write};
use std::os::fd::AsFd;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg, Termios};

pub struct Console {
    saved: Termios,
}

impl Console {
    pub fn new() -> io::Result<Console> {
        let stdin = io::stdin();
        let saved = tcgetattr(stdin.as_fd())?;

        let mut raw = saved.clone();
        raw.local_flags
            .remove(LocalFlags::ICANON | LocalFlags::ECHO);
        tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &raw)?;

        Ok(Console { saved })
    }

    /// Return a pending keystroke, or `None` when nothing arrives within
    /// `timeout`.
    pub fn poll_key(&mut self, timeout: Duration) -> io::Result<Option<u8>> {
        let stdin = io::stdin();
        let mut fds = [PollFd::new(stdin.as_fd(), PollFlags::POLLIN)];
        let timeout = PollTimeout::from(timeout.as_millis().min(u16::MAX as u128) as u16);

        if poll(&mut fds, timeout)? == 0 {
            return Ok(None);
        }

        let mut byte = [0u8; 1];
        match stdin.lock().read(&mut byte)? {
            0 => Ok(None),
            _ => Ok(Some(byte[0])),
        }
    }

    /// Block until a key arrives.
    pub fn wait_key(&mut self) -> io::Result<u8> {
        loop {
            if let Some(key) = self.poll_key(Duration::from_millis(100))? {
                return Ok(key);
            }
        }
    }

    /// Print `prompt` and read one line in canonical mode.
    pub fn read_line(&mut self, prompt: &str) -> io::Result<String> {
        let stdin = io::stdin();
        tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &self.saved)?;

        print!("{}", prompt);
        io::stdout().flush()?;
        let mut line = String::new();
        stdin.lock().read_line(&mut line)?;

        let mut raw = self.saved.clone();
        raw.local_flags
            .remove(LocalFlags::ICANON | LocalFlags::ECHO);
        tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &raw)?;

        Ok(line.trim().to_string())
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        let stdin = io::stdin();
        let _ = tcsetattr(stdin.as_fd(), SetArg::TCSANOW, &self.saved);
    }
}
