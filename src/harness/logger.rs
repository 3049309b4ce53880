//! Minimal stderr logger for the harness binary.
//!
//! Level comes from `--log-level` or the `COPILOT_SDK_LOG` environment
//! variable:
//! - `0` / `off`: nothing
//! - `1` / `error`: errors only
//! - `2` / `warn`: warnings (engine stderr lands here)
//! - `3` / `info`: lifecycle events
//! - `4` / `debug`, `5` / `trace`: protocol detail
//!
//! Output goes to stderr so it never mixes with the transcript on stdout.

use std::io::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use log::{LevelFilter, Log, Metadata, Record};

/// Environment variable read when no explicit level is given.
pub const LOG_ENV: &str = "COPILOT_SDK_LOG";

/// Parse a level name or number. Unknown values yield `None`.
pub fn parse_level(value: &str) -> Option<LevelFilter> {
    let value = value.trim().to_ascii_lowercase();
    let level = match value.as_str() {
        "0" | "off" | "none" => LevelFilter::Off,
        "1" | "error" => LevelFilter::Error,
        "2" | "warn" | "warning" => LevelFilter::Warn,
        "3" | "info" => LevelFilter::Info,
        "4" | "debug" => LevelFilter::Debug,
        "5" | "trace" | "all" => LevelFilter::Trace,
        _ => return None,
    };
    Some(level)
}

/// Explicit level if given, else `COPILOT_SDK_LOG`, else warnings only.
pub fn resolve_level(explicit: Option<&str>) -> LevelFilter {
    explicit
        .and_then(parse_level)
        .or_else(|| std::env::var(LOG_ENV).ok().as_deref().and_then(parse_level))
        .unwrap_or(LevelFilter::Warn)
}

struct StderrLogger {
    level: LevelFilter,
}

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let stderr = std::io::stderr();
        let mut out = stderr.lock();
        let _ = writeln!(
            out,
            "[{}] [{:<5}] {}",
            timestamp(),
            record.level(),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

fn timestamp() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:06}", now.as_secs(), now.subsec_micros())
}

/// Install the logger. A second call (or another logger already installed)
/// is ignored.
pub fn init_logger(level: LevelFilter) {
    let logger = Box::new(StderrLogger { level });
    if log::set_boxed_logger(logger).is_ok() {
        log::set_max_level(level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level_names_and_numbers() {
        assert_eq!(parse_level("0"), Some(LevelFilter::Off));
        assert_eq!(parse_level(" WARN "), Some(LevelFilter::Warn));
        assert_eq!(parse_level("3"), Some(LevelFilter::Info));
        assert_eq!(parse_level("trace"), Some(LevelFilter::Trace));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_explicit_level_wins() {
        assert_eq!(resolve_level(Some("debug")), LevelFilter::Debug);
    }
}
