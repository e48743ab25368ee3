//! Kernel logger
//!
//! Implements the `log` facade. Every record that passes the level filter
//! is kept in a small ring (the dmesg buffer) and, on hosted builds, echoed
//! to stderr.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt::Write;
use heapless::Deque;
#[cfg(feature = "std")]
use log::Level;
use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use spin::Mutex;

use crate::config::{level_from_str, VmConfig};

/// Records kept in the ring
pub const LOG_RING_DEPTH: usize = 64;

/// Bytes kept per record; longer lines are cut
pub const LOG_LINE_MAX: usize = 160;

type Line = heapless::String<LOG_LINE_MAX>;

struct KernelLogger {
    ring: Mutex<Deque<Line, LOG_RING_DEPTH>>,
}

static LOGGER: KernelLogger = KernelLogger {
    ring: Mutex::new(Deque::new()),
};

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let mut line = Line::new();
        // A full line just stops taking characters
        let _ = write!(line, "[{:>5}] {}", record.level(), record.args());

        {
            let mut ring = self.ring.lock();
            if ring.is_full() {
                ring.pop_front();
            }
            let _ = ring.push_back(line.clone());
        }

        #[cfg(feature = "std")]
        {
            let color = match record.level() {
                Level::Error => 31,
                Level::Warn => 93,
                Level::Info => 34,
                Level::Debug => 32,
                Level::Trace => 36,
            };
            std::eprintln!("\u{1B}[{}m{}\u{1B}[0m", color, line);
        }
    }

    fn flush(&self) {}
}

/// Install the kernel logger at `level`
///
/// If a logger is already installed only the level changes and the error
/// is returned.
pub fn init(level: LevelFilter) -> Result<(), SetLoggerError> {
    log::set_max_level(level);
    log::set_logger(&LOGGER)
}

/// Install the kernel logger at the configured level
///
/// A `LOG` level set at build time takes precedence over the configuration.
pub fn init_from_config(config: &VmConfig) -> Result<(), SetLoggerError> {
    init(option_env!("LOG").map(level_from_str).unwrap_or(config.log_level))
}

/// Most recent records, oldest first
pub fn recent() -> Vec<String> {
    LOGGER.ring.lock().iter().map(|l| String::from(l.as_str())).collect()
}

/// Empty the ring
pub fn clear() {
    LOGGER.ring.lock().clear();
}
