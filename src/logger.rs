//! Log output setup
//!
//! The crate logs through the `log` facade. Binaries and tests install an
//! `env_logger` backend here, which prints dmesg style lines:
//!
//! ```text
//! [    0.001250] [WARN ] nexa_gpusched::scheduler::preempt: rcs0: preempt timeout
//! ```

use std::fmt;
use std::io::Write;
use std::sync::OnceLock;
use std::time::Instant;

use log::{Level, LevelFilter};

static START: OnceLock<Instant> = OnceLock::new();

/// Install the logger. `RUST_LOG` overrides `default_level`.
///
/// Returns false if a logger was already installed.
pub fn init(default_level: LevelFilter, color: bool) -> bool {
    build(default_level, color, false)
}

/// Logger for unit and integration tests; output is captured per test
pub fn init_for_tests() {
    build(LevelFilter::Warn, false, true);
}

/// Parse `log=<level>` or `loglevel=<level>` out of an argument string
pub fn parse_level_directive(args: &str) -> Option<LevelFilter> {
    for token in args.split_whitespace() {
        if let Some((key, value)) = token.split_once('=') {
            if key.eq_ignore_ascii_case("log") || key.eq_ignore_ascii_case("loglevel") {
                if let Ok(level) = value.parse::<LevelFilter>() {
                    return Some(level);
                }
            }
        }
    }
    None
}

/// Microseconds since the logger was installed
pub fn uptime_us() -> u64 {
    START
        .get()
        .map(|start| u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

fn build(default_level: LevelFilter, color: bool, is_test: bool) -> bool {
    START.get_or_init(Instant::now);

    let mut builder = env_logger::Builder::new();
    builder.filter_level(default_level);
    if let Ok(directives) = std::env::var("RUST_LOG") {
        builder.parse_filters(&directives);
    }
    builder.is_test(is_test);
    builder.format(move |buf, record| {
        let timestamp = TimestampDisplay {
            microseconds: uptime_us(),
        };
        if color {
            writeln!(
                buf,
                "{color}[{timestamp}] [{level:<5}] {target}: {message}\x1b[0m",
                color = level_color(record.level()),
                timestamp = timestamp,
                level = record.level(),
                target = record.target(),
                message = record.args(),
            )
        } else {
            writeln!(
                buf,
                "[{timestamp}] [{level:<5}] {target}: {message}",
                timestamp = timestamp,
                level = record.level(),
                target = record.target(),
                message = record.args(),
            )
        }
    });

    builder.try_init().is_ok()
}

fn level_color(level: Level) -> &'static str {
    match level {
        Level::Error => "\x1b[1;31m",
        Level::Warn => "\x1b[33m",
        Level::Info => "\x1b[32m",
        Level::Debug => "\x1b[36m",
        Level::Trace => "\x1b[90m",
    }
}

struct TimestampDisplay {
    microseconds: u64,
}

impl fmt::Display for TimestampDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let seconds = self.microseconds / 1_000_000;
        let micros = self.microseconds % 1_000_000;
        write!(f, "{:>5}.{:06}", seconds, micros)
    }
}
