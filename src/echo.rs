//! The write/verify loop.
//!
//! Each cycle writes the fixed pattern in one call, waits for the loopback
//! to settle, then accumulates the echo across a bounded number of read
//! attempts. Short reads are normal here: a VTIME-limited read often hands
//! back only part of the pattern even on a good jumper, so a single short
//! read is reported and retried rather than treated as a failure. Running
//! out of attempts means the jumper is missing or the link is dead, and the
//! loop gives up instead of spinning forever.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use thiserror::Error;

/// Fixed payload written each cycle and expected back verbatim.
pub const PATTERN: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789abcdefghijklmnopqrstuvwxyz";

/// Timing and retry knobs for the loop.
#[derive(Debug, Clone)]
pub struct EchoSettings {
    /// Pause after the write, before the first read attempt.
    pub settle_delay: Duration,
    /// Pause between read attempts while the echo trickles in.
    pub retry_delay: Duration,
    /// Pause between full cycles.
    pub cycle_delay: Duration,
    /// Read attempts per cycle before giving up on the link.
    pub max_read_attempts: u32,
}

impl Default for EchoSettings {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(200),
            retry_delay: Duration::from_millis(100),
            cycle_delay: Duration::from_millis(1000),
            max_read_attempts: 10,
        }
    }
}

#[derive(Debug, Error)]
pub enum EchoError {
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("write failed: {0}")]
    Write(#[source] io::Error),

    #[error("read failed: {0}")]
    Read(#[source] io::Error),

    #[error("no full echo after {attempts} read attempts ({received} of {expected} bytes), giving up")]
    GiveUp {
        attempts: u32,
        received: usize,
        expected: usize,
    },
}

/// Running totals across cycles.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoStats {
    pub cycles: u64,
    pub partial_reads: u64,
    pub mismatches: u64,
}

/// How one cycle ended, short of a fatal error.
#[derive(Debug, PartialEq, Eq)]
enum CycleOutcome {
    /// Full pattern length echoed back.
    Complete,
    /// Stop flag observed mid-cycle.
    Interrupted,
}

// Hex dump for mismatch reports.
fn to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Sleep in short slices so the stop flag is honored promptly.
fn sleep_unless_stopped(total: Duration, stop: &AtomicBool) {
    let slice = Duration::from_millis(50);
    let mut remaining = total;
    while !stop.load(Ordering::SeqCst) && remaining > Duration::ZERO {
        let step = remaining.min(slice);
        thread::sleep(step);
        remaining -= step;
    }
}

/// One write/verify iteration. `rx` must be exactly `PATTERN.len()` bytes;
/// the read loop never fills past it.
fn run_cycle<P: Read + Write>(
    port: &mut P,
    settings: &EchoSettings,
    stop: &AtomicBool,
    rx: &mut [u8],
    stats: &mut EchoStats,
) -> Result<CycleOutcome, EchoError> {
    rx.fill(0);

    let written = port.write(PATTERN).map_err(EchoError::Write)?;
    if written != PATTERN.len() {
        return Err(EchoError::ShortWrite {
            written,
            expected: PATTERN.len(),
        });
    }
    println!("Wrote ({}): {}", written, String::from_utf8_lossy(PATTERN));

    sleep_unless_stopped(settings.settle_delay, stop);

    let mut got = 0usize;
    let mut attempts = 0u32;
    while got < PATTERN.len() {
        if stop.load(Ordering::SeqCst) {
            return Ok(CycleOutcome::Interrupted);
        }
        if attempts == settings.max_read_attempts {
            // One terminal report; the caller prints this error.
            return Err(EchoError::GiveUp {
                attempts,
                received: got,
                expected: PATTERN.len(),
            });
        }
        attempts += 1;

        let n = match port.read(&mut rx[got..]) {
            Ok(n) => n,
            // A timed-out read is just an empty one to us.
            Err(ref e) if e.kind() == io::ErrorKind::TimedOut => 0,
            Err(e) => return Err(EchoError::Read(e)),
        };
        got += n;

        if got < PATTERN.len() {
            stats.partial_reads += 1;
            println!("Partial read ({} of {} bytes), retrying", got, PATTERN.len());
            sleep_unless_stopped(settings.retry_delay, stop);
        }
    }

    if &rx[..got] == PATTERN {
        println!("Read ({}): {}\n", got, String::from_utf8_lossy(&rx[..got]));
    } else {
        stats.mismatches += 1;
        println!("Mismatch after {} bytes", got);
        println!("  sent: {}", to_hex(PATTERN));
        println!("  recv: {}\n", to_hex(&rx[..got]));
    }
    stats.cycles += 1;

    Ok(CycleOutcome::Complete)
}

/// Drive cycles until `stop` is set or a cycle fails.
///
/// On a clean stop the accumulated stats come back; fatal errors propagate
/// so the caller can report them and exit nonzero. Either way the port is
/// the caller's to drop, which restores its saved settings.
pub fn run_echo_loop<P: Read + Write>(
    port: &mut P,
    settings: &EchoSettings,
    stop: &AtomicBool,
) -> Result<EchoStats, EchoError> {
    let mut stats = EchoStats::default();
    let mut rx = vec![0u8; PATTERN.len()];

    while !stop.load(Ordering::SeqCst) {
        match run_cycle(port, settings, stop, &mut rx, &mut stats)? {
            CycleOutcome::Interrupted => break,
            CycleOutcome::Complete => sleep_unless_stopped(settings.cycle_delay, stop),
        }
    }

    Ok(stats)
}
