//! Logging initialization using the `tracing` ecosystem.
//!
//! Console output is always human-readable. When a log directory is given,
//! a daily-rotating file layer is added in either text or JSON lines format.
//! `RUST_LOG` overrides the level passed in.

use std::str::FromStr;

use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::error::CoreError;

/// Format of the rotating log file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl FromStr for LogFormat {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(CoreError::Config(format!("unknown log format: {other}"))),
        }
    }
}

/// Install the global tracing subscriber.
///
/// Worker threads are named (`chanmux-receiver`, `chanmux-processor`,
/// `chanmux-controller`), so both layers print thread names. A second call
/// is a no-op.
///
/// - `log_level`: default filter if `RUST_LOG` is unset (e.g. `"info"`)
/// - `log_dir`: optional directory for `<module_name>.log.<date>` files
/// - `file_format`: text or JSON lines for the file layer
pub fn init_logging(log_level: &str, log_dir: Option<&str>, module_name: &str, file_format: LogFormat) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_thread_names(true)
        .with_ansi(true);

    let appender = log_dir.map(|dir| tracing_appender::rolling::daily(dir, format!("{module_name}.log")));
    let (text_file, json_file) = match (appender, file_format) {
        (Some(writer), LogFormat::Text) => (
            Some(fmt::layer().with_writer(writer).with_ansi(false).with_thread_names(true)),
            None,
        ),
        (Some(writer), LogFormat::Json) => (
            None,
            Some(fmt::layer().json().with_writer(writer).with_thread_names(true).with_current_span(false)),
        ),
        (None, _) => (None, None),
    };

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(text_file)
        .with(json_file)
        .try_init();

    match (installed, log_dir) {
        (Ok(()), Some(dir)) => info!("logging to {dir}/{module_name}.log ({file_format:?}), level={log_level}"),
        (Ok(()), None) => info!("logging to console, level={log_level}"),
        (Err(_), _) => debug!("logging already initialized, keeping the first subscriber"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_log_format() {
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("TEXT".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn double_init_does_not_panic() {
        init_logging("warn", None, "test", LogFormat::Text);
        init_logging("warn", None, "test", LogFormat::Json);
    }
}
