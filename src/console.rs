//! Kernel log console
//!
//! Backend for the `log` facade. Every record is formatted into a fixed
//! size line, forwarded to the registered sink (the UART writer on real
//! hardware) and kept in a small ring so the last messages can be read back
//! after the fact. Nothing here allocates.

use core::fmt::Write;

use alloc::vec::Vec;
use heapless::{Deque, String};
use log::{LevelFilter, Log, Metadata, Record};
use spin::{Mutex, Once};

/// Longest kept line; longer messages are cut short
pub const LINE_LEN: usize = 128;

/// Number of lines kept in the ring
pub const RING_LEN: usize = 64;

pub type LogLine = String<LINE_LEN>;

/// `log::Log` implementation with an in-memory message ring
pub struct KernelLogger {
    ring: Mutex<Deque<LogLine, RING_LEN>>,
    sink: Once<fn(&str)>,
}

impl KernelLogger {
    pub const fn new() -> Self {
        Self {
            ring: Mutex::new(Deque::new()),
            sink: Once::new(),
        }
    }

    /// Register where formatted lines are written; only the first call counts
    pub fn set_sink(&self, sink: fn(&str)) {
        self.sink.call_once(|| sink);
    }

    /// Snapshot of the ring, oldest first
    pub fn recent(&self) -> Vec<LogLine> {
        self.ring.lock().iter().cloned().collect()
    }
}

impl Default for KernelLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        let mut line = LogLine::new();
        let mut out = Clipped(&mut line);
        let _ = write!(out, "[{:<5}] {}: {}", record.level(), record.target(), record.args());
        if let Some(sink) = self.sink.get() {
            sink(line.as_str());
        }
        let mut ring = self.ring.lock();
        if ring.is_full() {
            ring.pop_front();
        }
        let _ = ring.push_back(line);
    }

    fn flush(&self) {}
}

/// Writer that keeps whatever fits in the line and drops the rest
struct Clipped<'a>(&'a mut LogLine);

impl Write for Clipped<'_> {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let mut end = s.len().min(LINE_LEN - self.0.len());
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        let _ = self.0.push_str(&s[..end]);
        Ok(())
    }
}

static LOGGER: KernelLogger = KernelLogger::new();

/// Install the kernel logger; later calls leave the first setup in place
pub fn init(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}

/// Register the console sink of the global logger
pub fn set_sink(sink: fn(&str)) {
    LOGGER.set_sink(sink);
}

/// Last lines logged through the global logger
pub fn recent() -> Vec<LogLine> {
    LOGGER.recent()
}
