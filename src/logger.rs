use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{warn, LevelFilter, Log, Metadata, Record, SetLoggerError};

// Position in this table is what the atomic stores, so the filter can be
// swapped at runtime without locking.
const LEVELS: [LevelFilter; 6] = [
    LevelFilter::Off,
    LevelFilter::Error,
    LevelFilter::Warn,
    LevelFilter::Info,
    LevelFilter::Debug,
    LevelFilter::Trace,
];
const DEFAULT_LEVEL_INDEX: usize = 3; // Info

/// Stderr logger with a runtime-adjustable filter, seeded from the
/// LOG_LEVEL environment variable. An unrecognized value keeps the agent
/// at Info instead of silencing it.
struct AgentLogger {
    filter_index: AtomicUsize,
}

impl AgentLogger {
    const fn new() -> Self {
        Self {
            filter_index: AtomicUsize::new(DEFAULT_LEVEL_INDEX),
        }
    }

    fn filter(&self) -> LevelFilter {
        LEVELS[self.filter_index.load(Ordering::Relaxed).min(LEVELS.len() - 1)]
    }

    fn set_filter(&self, filter: LevelFilter) {
        let index = LEVELS
            .iter()
            .position(|candidate| *candidate == filter)
            .unwrap_or(DEFAULT_LEVEL_INDEX);
        self.filter_index.store(index, Ordering::Relaxed);
    }

    // LevelFilter's FromStr accepts the standard level names in any case.
    fn apply_env_value(&self, value: &str) {
        match value.trim().parse::<LevelFilter>() {
            Ok(filter) => self.set_filter(filter),
            Err(_) => {
                self.set_filter(LevelFilter::Info);
                warn!("unknown LOG_LEVEL value: {}, using default Info level", value);
            }
        }
    }
}

impl Log for AgentLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.filter()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _ = writeln!(io::stderr(), "{:<5} {}", record.level(), record.args());
        }
    }

    fn flush(&self) {
        let _ = io::stderr().flush();
    }
}

static LOGGER: AgentLogger = AgentLogger::new();

/// Installs the logger and seeds its filter from LOG_LEVEL.
pub fn init_from_env() -> Result<(), SetLoggerError> {
    log::set_logger(&LOGGER)?;
    log::set_max_level(LevelFilter::Trace);
    if let Ok(value) = std::env::var("LOG_LEVEL") {
        if !value.trim().is_empty() {
            LOGGER.apply_env_value(&value);
        }
    }
    Ok(())
}

/// Adjusts the filter at runtime.
pub fn set_log_level(filter: LevelFilter) {
    LOGGER.set_filter(filter);
}
