use std::io::Write;
use std::time::Instant;

use log::{LevelFilter, Log, Metadata, Record, SetLoggerError};
use parking_lot::Mutex;

struct EnvmcpLogger {
    file: Option<Mutex<std::fs::File>>,
    filter: LevelFilter,
    start: Instant,
}

impl Log for EnvmcpLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.filter
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // stdout belongs to the child
        let _ = writeln!(
            std::io::stderr().lock(),
            "envmcp: [{}] {}",
            record.level(),
            record.args()
        );

        if let Some(ref file) = self.file {
            let elapsed = self.start.elapsed().as_secs_f64();
            let _ = writeln!(
                file.lock(),
                "[{elapsed:.3}s] [{}] {} - {}",
                record.level(),
                record.target(),
                record.args()
            );
        }
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
        if let Some(ref file) = self.file {
            let _ = file.lock().flush();
        }
    }
}

/// Pick the log level: `RUST_LOG` wins, otherwise warnings plus one step per `-v`.
#[must_use]
pub fn level_filter(rust_log: Option<&str>, verbosity: u8) -> LevelFilter {
    if let Some(filter) = rust_log.and_then(|s| s.parse().ok()) {
        return filter;
    }
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Initialize the global logger. Must be called once before any logging.
///
/// # Errors
///
/// Returns `SetLoggerError` if a logger was already installed.
pub fn init(verbosity: u8, log_file: Option<std::fs::File>) -> Result<(), SetLoggerError> {
    let filter = level_filter(std::env::var("RUST_LOG").ok().as_deref(), verbosity);

    let logger = EnvmcpLogger {
        file: log_file.map(Mutex::new),
        filter,
        start: Instant::now(),
    };

    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(filter);
    Ok(())
}
