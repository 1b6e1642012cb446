//! Tracing setup.
//!
//! Structured events with spans for runs and buttons, filtered by
//! `RUST_LOG` when set and by the configured level otherwise.
//!
//! ```no_run
//! use rbs_fixture::{config::FixtureConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = FixtureConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!(run = 1, "fixture ready");
//! # Ok(())
//! # }
//! ```

use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::{FixtureConfig, LogFormat};

/// Logging options.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset.
    pub level: Level,
    /// Output format.
    pub format: LogFormat,
    /// Emit span open/close events.
    pub with_span_events: bool,
    /// Include file and line.
    pub with_file_and_line: bool,
    /// Include thread names (camera threads are named `camera-N`).
    pub with_thread_names: bool,
    /// ANSI colours for the pretty format.
    pub with_ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Options from the application section.
    pub fn from_config(config: &FixtureConfig) -> Result<Self, String> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            format: config.application.log_format,
            ..Default::default()
        })
    }

    /// Options with a fixed level.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Set output format.
    #[must_use]
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable span events.
    #[must_use]
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }
}

/// Initialise logging from the fixture configuration.
pub fn init_from_config(config: &FixtureConfig) -> Result<(), String> {
    init(LoggingConfig::from_config(config)?)
}

/// Initialise logging.
///
/// Idempotent: a subscriber installed earlier (tests, embedding
/// applications) is left in place.
pub fn init(config: LoggingConfig) -> Result<(), String> {
    match tracing_subscriber::registry().with(build_layer(&config)).try_init() {
        Ok(()) => Ok(()),
        // Either the global dispatcher or the `log` bridge was installed first.
        Err(e) if e.to_string().contains("already") => Ok(()),
        Err(e) => Err(format!("Failed to initialize tracing: {e}")),
    }
}

/// Formatting layer for `config`, filtered by `RUST_LOG` or the level.
pub fn build_layer(config: &LoggingConfig) -> Box<dyn Layer<Registry> + Send + Sync> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.as_str().to_ascii_lowercase()));
    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    match config.format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_ansi(config.with_ansi)
            .with_filter(filter)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_span_events(span_events)
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_thread_names(config.with_thread_names)
            .with_ansi(false)
            .with_filter(filter)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_current_span(true)
            .with_thread_names(config.with_thread_names)
            .with_filter(filter)
            .boxed(),
    }
}

fn parse_log_level(level: &str) -> Result<Level, String> {
    level.parse::<Level>().map_err(|_| {
        format!("Invalid log level '{level}'. Must be one of: trace, debug, info, warn, error")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_parse_case_insensitively() {
        assert_eq!(parse_log_level("debug").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("WARN").unwrap(), Level::WARN);
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn options_follow_application_section() {
        let mut config = FixtureConfig::default();
        config.application.log_level = "trace".into();
        config.application.log_format = LogFormat::Compact;
        let logging = LoggingConfig::from_config(&config).unwrap();
        assert_eq!(logging.level, Level::TRACE);
        assert_eq!(logging.format, LogFormat::Compact);
    }

    // Scoped subscribers only: a global one would swallow events that other
    // tests capture.
    #[test]
    fn every_format_builds_a_working_subscriber() {
        for format in [LogFormat::Pretty, LogFormat::Compact, LogFormat::Json] {
            let config = LoggingConfig::new(Level::INFO)
                .with_format(format)
                .with_span_events(true);
            let subscriber = tracing_subscriber::registry().with(build_layer(&config));
            tracing::subscriber::with_default(subscriber, || {
                assert!(tracing::enabled!(Level::ERROR));
                let _span = tracing::info_span!("run", index = 1).entered();
                tracing::error!(?format, "scoped subscriber");
            });
        }
    }
}
