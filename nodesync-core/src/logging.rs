//! Tracing subscriber setup

use std::fs::{File, OpenOptions};
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::LoggingConfig;

/// HTTP client internals are noisy at debug level
const QUIET_DEPENDENCIES: &[&str] = &["hyper_util=warn", "reqwest=info"];

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Install the global subscriber described by `config`
///
/// `format: json` emits one JSON object per record, anything else the
/// pretty format. `RUST_LOG` wins over the configured level when set.
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = parse_log_level(&config.level)?;
    let log_file = config.file_path.as_deref().map(open_log_file).transpose()?;

    let output = if config.format.eq_ignore_ascii_case("json") {
        json_layer(log_file)
    } else {
        pretty_layer(log_file)
    };

    tracing_subscriber::registry()
        .with(output.with_filter(env_filter(level)))
        .try_init()?;
    Ok(())
}

fn env_filter(level: Level) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    QUIET_DEPENDENCIES
        .iter()
        .filter_map(|directive| directive.parse().ok())
        .fold(EnvFilter::new(level.to_string()), EnvFilter::add_directive)
}

fn json_layer(log_file: Option<File>) -> BoxedLayer {
    let layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_file(true)
        .with_line_number(true);
    match log_file {
        Some(file) => layer.with_writer(Arc::new(file)).boxed(),
        None => layer.boxed(),
    }
}

fn pretty_layer(log_file: Option<File>) -> BoxedLayer {
    let layer = fmt::layer()
        .pretty()
        .with_span_events(FmtSpan::CLOSE)
        .with_file(true)
        .with_line_number(true);
    match log_file {
        Some(file) => layer.with_ansi(false).with_writer(Arc::new(file)).boxed(),
        None => layer.boxed(),
    }
}

fn open_log_file(path: &str) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn parse_log_level(level: &str) -> anyhow::Result<Level> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" | "warning" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => anyhow::bail!("Invalid log level: {level}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("TRACE").unwrap(), Level::TRACE);
        assert_eq!(parse_log_level(" warning ").unwrap(), Level::WARN);
        assert_eq!(parse_log_level("info").unwrap(), Level::INFO);
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_quiet_dependency_directives_parse() {
        for directive in QUIET_DEPENDENCIES {
            assert!(directive.parse::<tracing_subscriber::filter::Directive>().is_ok());
        }
    }

    #[test]
    fn test_init_logging_rejects_bad_level() {
        let config = LoggingConfig {
            level: "loud".to_string(),
            ..LoggingConfig::default()
        };
        assert!(init_logging(&config).is_err());
    }
}
