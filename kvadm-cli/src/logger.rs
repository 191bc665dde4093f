//! Logging sink for the shell. Levels are colored, targets name the
//! subsystem (`cluster`, `node`, `pmap`), and everything goes to stderr
//! so command output stays pipeable.

use std::io::{self, Write};

use chrono::prelude::*;
use colored::*;
use log::{Level, Log, Metadata, Record, SetLoggerError};

struct Logger {
    level: Level,
}

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let timestamp = Local::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let line = format!(
            "{timestamp} {:<5} {:<8} {}",
            record.level(),
            record.target().cyan(),
            record.args()
        );
        let line = match record.level() {
            Level::Error => line.red(),
            Level::Warn => line.yellow(),
            Level::Info => line.normal(),
            Level::Debug => line.dimmed(),
            Level::Trace => line.white().dimmed(),
        };

        writeln!(io::stderr(), "{line}").expect("write shouldn't fail");
    }

    fn flush(&self) {}
}

/// Initialize the logger.
pub fn init(level: Level) -> Result<(), SetLoggerError> {
    log::set_boxed_logger(Box::new(Logger { level }))?;
    log::set_max_level(level.to_level_filter());

    Ok(())
}

/// The level requested through `RUST_LOG`, if any.
pub fn env_level() -> Option<Level> {
    std::env::var("RUST_LOG").ok()?.parse().ok()
}
