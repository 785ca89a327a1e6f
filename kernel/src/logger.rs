//! Serial-backed implementation of the `log` facade.
//!
//! Every subsystem logs through `log::{info, warn, ...}`; records are
//! formatted onto COM1 with the level and module path prefixed.

use log::{LevelFilter, Log, Metadata, Record};

use crate::serial_println;

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        serial_println!(
            "[{}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Install the serial logger. Called once, before any subsystem init.
pub fn init() {
    // set_logger only fails if a logger is already installed, which would be
    // a boot-ordering bug.
    log::set_logger(&LOGGER).expect("logger already installed");
    log::set_max_level(LevelFilter::Info);
}

/// Raise the log level to Debug (used when booting with verbose output).
#[allow(dead_code)]
pub fn set_verbose() {
    log::set_max_level(LevelFilter::Debug);
}
