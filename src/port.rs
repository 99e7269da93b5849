//! Raw-mode serial port setup for the echo test.
//!
//! The port is opened at the termios level so the settings in place before
//! the test can be captured and put back on exit. Reads are configured as
//! VMIN=0/VTIME=5: a read returns as soon as at least one byte arrives, or
//! empty-handed after half a second, which is what the retry loop in
//! [`crate::echo`] is built around.

use std::io::{self, Read, Write};
use std::os::fd::OwnedFd;

use rustix::fs::{fcntl_setfl, open, Mode, OFlags};
use rustix::termios::{
    self, ControlModes, InputModes, LocalModes, OptionalActions, OutputModes, QueueSelector,
    SpecialCodeIndex, Termios,
};
use thiserror::Error;

/// Longest device path accepted, the historical fixed-buffer limit.
pub const MAX_PATH_LEN: usize = 63;

/// Speeds the tool will program, the standard termios steps.
pub const SUPPORTED_SPEEDS: &[u32] = &[
    50, 75, 110, 134, 150, 200, 300, 600, 1200, 1800, 2400, 4800, 9600, 19200, 38400, 57600,
    115200, 230400, 460800, 500000, 576000, 921600, 1000000, 1152000, 1500000, 2000000, 2500000,
    3000000, 3500000, 4000000,
];

#[derive(Debug, Error)]
pub enum PortError {
    #[error("device path is empty")]
    EmptyPath,

    #[error("device path is too long ({len} bytes, limit {MAX_PATH_LEN}): {path}")]
    PathTooLong { path: String, len: usize },

    #[error("unsupported speed: {0}")]
    UnsupportedSpeed(u32),

    #[error("failed to open {path}: {source}")]
    Open { path: String, source: io::Error },

    #[error("failed to configure {path}: {source}")]
    Configure { path: String, source: io::Error },
}

/// Reject bad device paths before any open syscall.
pub fn validate_path(path: &str) -> Result<(), PortError> {
    if path.is_empty() {
        return Err(PortError::EmptyPath);
    }
    if path.len() > MAX_PATH_LEN {
        return Err(PortError::PathTooLong {
            path: path.to_string(),
            len: path.len(),
        });
    }
    Ok(())
}

/// Reject speeds outside the supported set before any open syscall.
pub fn validate_speed(speed: u32) -> Result<(), PortError> {
    if SUPPORTED_SPEEDS.contains(&speed) {
        Ok(())
    } else {
        Err(PortError::UnsupportedSpeed(speed))
    }
}

/// An open serial device in raw mode, holding the settings it had before we
/// touched it. Dropping the port restores those settings and closes the fd.
pub struct Port {
    fd: OwnedFd,
    saved: Termios,
    path: String,
}

impl Port {
    /// Open `path` and configure it for raw 8N1 transfer at `speed` baud.
    pub fn open(path: &str, speed: u32) -> Result<Self, PortError> {
        validate_path(path)?;
        validate_speed(speed)?;

        // NONBLOCK so open() cannot hang waiting for a carrier on a line
        // nobody else holds open; cleared again once the fd is ours so
        // VTIME governs reads.
        let fd = open(
            path,
            OFlags::RDWR | OFlags::NOCTTY | OFlags::NONBLOCK,
            Mode::empty(),
        )
        .map_err(|e| PortError::Open {
            path: path.to_string(),
            source: e.into(),
        })?;

        let configure_err = |e: rustix::io::Errno| PortError::Configure {
            path: path.to_string(),
            source: e.into(),
        };

        fcntl_setfl(&fd, OFlags::empty()).map_err(configure_err)?;

        let saved = termios::tcgetattr(&fd).map_err(configure_err)?;

        let mut opts = saved.clone();
        opts.control_modes &= !(ControlModes::CSIZE | ControlModes::CSTOPB | ControlModes::PARENB);
        opts.control_modes |= ControlModes::CLOCAL | ControlModes::CREAD | ControlModes::CS8;
        opts.input_modes = InputModes::IGNPAR;
        opts.output_modes = OutputModes::empty();
        opts.local_modes = LocalModes::empty();

        // Return with whatever has arrived, or nothing after 0.5s.
        opts.special_codes[SpecialCodeIndex::VMIN] = 0;
        opts.special_codes[SpecialCodeIndex::VTIME] = 5;

        opts.set_speed(speed).map_err(configure_err)?;

        // Stale bytes from a previous run must not leak into the first read.
        termios::tcflush(&fd, QueueSelector::IFlush).map_err(configure_err)?;
        termios::tcsetattr(&fd, OptionalActions::Now, &opts).map_err(configure_err)?;

        Ok(Self {
            fd,
            saved,
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl Drop for Port {
    fn drop(&mut self) {
        // Hand the device back the way we found it. The fd closes when the
        // OwnedFd drops right after.
        if let Err(e) = termios::tcsetattr(&self.fd, OptionalActions::Now, &self.saved) {
            eprintln!("[ECHO/PORT] failed to restore settings on {}: {e}", self.path);
        }
    }
}

impl Read for Port {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        rustix::io::read(&self.fd, buf).map_err(io::Error::from)
    }
}

impl Write for Port {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        rustix::io::write(&self.fd, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        termios::tcdrain(&self.fd).map_err(io::Error::from)
    }
}
