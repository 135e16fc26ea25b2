pub use slog::{b, crit, debug, error, info, kv, o, record, trace, warn};
pub use slog::{Discard, Drain, Level, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds the root terminal logger for the process. The `level` must be one
/// of the sloggers severity names (`trace`, `debug`, `info`, `warning`,
/// `error`, `critical`).
pub fn init(level: &str) -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(&format!(
        r#"
type = "terminal"
level = "{}"
destination = "stderr"
"#,
        level
    ))
    .expect("Malformed logger configuration");

    config.build_logger().expect("Error building root logger")
}

/// A logger that swallows everything. Used as the fallback when a component
/// is constructed without a parent logger, and in tests.
#[inline]
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_levels() {
        for level in &["trace", "debug", "info", "warning", "error"] {
            let _ = init(level);
        }
    }

    #[test]
    fn test_discard_accepts_records() {
        let log = discard();
        debug!(log, "no-op"; "context" => "test");
    }
}
