//! UART-backed `log` facade backend
//!
//! Installed once during primary-core bring-up. Before installation (and in
//! hosted unit tests) the `log` macros are no-ops, which is exactly what a
//! test run wants.

use log::{LevelFilter, Log, Metadata, Record};

use crate::drivers::uart;

struct UartLogger;

static LOGGER: UartLogger = UartLogger;

impl Log for UartLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        use core::fmt::Write;
        let mut out = uart::Console;
        let _ = writeln!(out, "[{:5}] {}", record.level(), record.args());
    }

    fn flush(&self) {}
}

/// Install the UART logger. Safe to call once per boot.
pub fn init() {
    let level = if cfg!(feature = "verbose") {
        LevelFilter::Trace
    } else if cfg!(feature = "debug") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
