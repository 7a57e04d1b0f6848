//! A basic logger for the NFD data plane.
//!
//! This enables every crate to use the `log` crate's macros anywhere.
//! Records are written, one line each, to a single writer registered at
//! [`init`], typically a serial port or a console.

#![no_std]

extern crate alloc;
extern crate log;
extern crate spin;

use alloc::boxed::Box;
use core::fmt::Write;
use log::{LevelFilter, Log, Metadata, Record};
use spin::{Mutex, Once};

/// Where log records go.
pub type LogWriter = Box<dyn Write + Send>;

struct Logger {
    writer: Once<Mutex<LogWriter>>,
}

static LOGGER: Logger = Logger { writer: Once::new() };

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Some(writer) = self.writer.get() {
            // There is nowhere else to report a failed write.
            let _ = writeln!(writer.lock(), "[{}] {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

/// Registers `writer` as the destination of all log records at or above
/// `level`.
///
/// Only the first call succeeds.
pub fn init(level: LevelFilter, writer: LogWriter) -> Result<(), &'static str> {
    if LOGGER.writer.is_completed() {
        return Err("logger: already initialized");
    }
    LOGGER.writer.call_once(|| Mutex::new(writer));
    log::set_logger(&LOGGER).map_err(|_| "logger: couldn't set logger")?;
    log::set_max_level(level);
    Ok(())
}

/// Changes the most verbose level that is written.
pub fn set_level(level: LevelFilter) {
    log::set_max_level(level);
}
