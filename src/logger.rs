//! Log backend used when the host process has not installed one
//!
//! Lines go to stderr and, on Windows, to the debugger output so they can be read with a
//! debug viewer while the client runs without a console.

use std::io::{self, Write};

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};

/// Writes every enabled record as one line
pub struct Logger;

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let line = format!("[clienthook] {:<5} {}\n", record.level(), record.args());

        // a GUI process may have no stderr; losing the line is fine
        let _ = io::stderr().lock().write_all(line.as_bytes());

        #[cfg(windows)]
        crate::win::output_debug_string(&line);
    }

    fn flush(&self) {
        let _ = io::stderr().lock().flush();
    }
}

/// The installed backend
static LOGGER: Logger = Logger;

/// Installs [`Logger`] at `Info`. Fails if a logger is already installed, which leaves the
/// existing one in place.
pub fn init() -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(LevelFilter::Info);
    Ok(())
}
