use std::io::Write;

use chrono::Local;
use colored::{ColoredString, Colorize};
use log::{Level, LevelFilter, Metadata, Record};

/// Targets treated as this workspace's own output in quiet mode.
const OWN_CRATE_PREFIXES: [&str; 2] = ["vpctun_lib", "vpctun_bin"];

/// Diagnostics go to stderr so stdout stays reserved for command output
/// (session tables, banners) and can be piped or parsed.
pub struct ConsoleLogger {
    filter: LevelFilter,
    own_crates_only: bool,
}

impl ConsoleLogger {
    pub fn new(filter: LevelFilter, own_crates_only: bool) -> ConsoleLogger {
        ConsoleLogger {
            filter,
            own_crates_only,
        }
    }

    fn level_tag(level: Level) -> ColoredString {
        match level {
            Level::Error => "error".bright_red(),
            Level::Warn => " warn".bright_yellow(),
            Level::Info => " info".bright_blue(),
            Level::Debug => "debug".bright_cyan(),
            Level::Trace => "trace".normal(),
        }
    }
}

impl log::Log for ConsoleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        if metadata.level() > self.filter {
            return false;
        }
        if !self.own_crates_only {
            return true;
        }
        OWN_CRATE_PREFIXES
            .iter()
            .any(|prefix| metadata.target().starts_with(prefix))
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // millisecond resolution; debug lines come per packet and per flow
        let time = Local::now().format("%H:%M:%S%.3f").to_string();
        let mut stderr = std::io::stderr().lock();
        let _ = writeln!(
            stderr,
            "{} {} {} {}",
            time.dimmed(),
            Self::level_tag(record.level()),
            record.target().dimmed(),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}
