//! Generic logging facility with a default implementation.
//!
//! The logger is created by the front-end and injected into the engine,
//! which passes it around as `Rc<dyn Logger>`.

use std::cell::RefCell;
use std::fs::File;
use std::io::Write;

use crate::location::Location;

pub const DEBUG: &str = "DEBUG";
pub const INFO: &str = "INFO";
pub const WARN: &str = "WARN";
pub const ERROR: &str = "ERROR";

const MAX_SEVERITY_LENGTH: usize = 5;

/// Generic trait any logger must implement.
pub trait Logger {
    /// Write the message somewhere.
    fn write(&self, msg: String);

    /// Whether `DEBUG` messages should be written at all.
    fn verbose(&self) -> bool {
        false
    }
}

/// Formatter for all log messages.
fn format_log(level: &str, msg: impl AsRef<str>, loc: Option<&Location>) -> String {
    let level_display = format!("{:width$}", level, width = MAX_SEVERITY_LENGTH);
    let label = loc.map(|l| format!("[{}] ", l)).unwrap_or_default();
    format!("make: {level_display} {label}| {}", msg.as_ref())
}

/// Log a `DEBUG` message; dropped unless the logger is verbose.
pub fn log_debug(logger: &dyn Logger, msg: impl AsRef<str>, loc: Option<&Location>) {
    if logger.verbose() {
        logger.write(format_log(DEBUG, msg, loc));
    }
}

/// Log an `INFO` message.
pub fn log_info(logger: &dyn Logger, msg: impl AsRef<str>, loc: Option<&Location>) {
    logger.write(format_log(INFO, msg, loc));
}

/// Log a `WARN` message.
pub fn log_warn(logger: &dyn Logger, msg: impl AsRef<str>, loc: Option<&Location>) {
    logger.write(format_log(WARN, msg, loc));
}

/// Log an `ERROR` message.
pub fn log_error(logger: &dyn Logger, msg: impl AsRef<str>, loc: Option<&Location>) {
    logger.write(format_log(ERROR, msg, loc));
}

/// The default logger prints to `stderr`.
pub struct StderrLogger {
    pub verbose: bool,
}

impl Logger for StderrLogger {
    fn write(&self, msg: String) {
        eprintln!("{}", msg);
    }

    fn verbose(&self) -> bool {
        self.verbose
    }
}

/// Appends log lines to the file given with `--debug-log`.
pub struct FileLogger {
    file: RefCell<File>,
}

impl FileLogger {
    pub fn new(file: File) -> Self {
        Self {
            file: RefCell::new(file),
        }
    }
}

impl Logger for FileLogger {
    fn write(&self, msg: String) {
        let _ = writeln!(self.file.borrow_mut(), "{}", msg);
    }

    fn verbose(&self) -> bool {
        true
    }
}
