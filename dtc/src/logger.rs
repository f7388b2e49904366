use std::io::{self, IsTerminal, Write};

use log::{Level, LevelFilter, Log, Metadata, Record};

struct StderrLogger;

static LOGGER: StderrLogger = StderrLogger;

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let level = match record.level() {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        };

        let mut stderr = io::stderr().lock();
        // Nowhere left to report a failing stderr.
        let _ = if stderr.is_terminal() {
            let color = match record.level() {
                Level::Error => "\x1b[91m",
                Level::Warn => "\x1b[33m",
                Level::Info => "\x1b[96m",
                Level::Debug | Level::Trace => "\x1b[0m",
            };
            writeln!(stderr, "{color}{level:6}\x1b[0m {}", record.args())
        } else {
            writeln!(stderr, "{level:6} {}", record.args())
        };
    }

    fn flush(&self) {
        let _ = io::stderr().flush();
    }
}

/// Install the logger, showing warnings and errors plus one more level per `verbosity` step.
pub fn init(verbosity: u8) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(match verbosity {
            0 => LevelFilter::Warn,
            1 => LevelFilter::Info,
            2 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        });
    }
}
