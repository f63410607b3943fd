//! Kernel logger backing the `log` facade
//!
//! Every record is rendered to the serial port with a millisecond
//! timestamp derived from the tick source. Formatting happens entirely at
//! the call site through `format_args!`; the logger itself never
//! allocates.

use log::{Level, LevelFilter, Log, Metadata, Record};

struct SerialLogger;

static LOGGER: SerialLogger = SerialLogger;

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= Level::Debug
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        crate::serial_println!(
            "[{:>6}ms {:<5} {}] {}",
            crate::arch::x86_64::timer::uptime_ms(),
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Install the serial logger. Records emitted before this call are
/// dropped. Safe to call more than once; later calls are no-ops.
pub fn init() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
}

/// Log at the highest severity. The `log` facade has no level above
/// `Error`, so critical records are error records with a marked target.
#[macro_export]
macro_rules! critical {
    ($($arg:tt)*) => {
        log::error!(target: "CRITICAL", $($arg)*)
    };
}
