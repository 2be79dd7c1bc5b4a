//! Logging configuration and initialization
//!
//! Every ADW binary logs through `tracing`. Console output goes to stderr so
//! that machine-readable command output on stdout stays clean. File output
//! rotates daily under the configured log directory.
//!
//! # Example
//!
//! ```no_run
//! use adw_common::logging::{init_logging, LogConfig};
//! use tracing::{info, Level};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::for_binary("adw-ingest").with_level(Level::DEBUG).with_env()?;
//!     let _guard = init_logging(&config)?;
//!
//!     info!(table = "gads_campaigns", rows = 12, "Loaded batch");
//!     Ok(())
//! }
//! ```

use crate::error::CommonError;
use anyhow::Context;
use std::path::PathBuf;
use std::str::FromStr;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Where log lines go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

impl LogOutput {
    fn console(self) -> bool {
        self != LogOutput::File
    }

    fn file(self) -> bool {
        self != LogOutput::Console
    }
}

impl FromStr for LogOutput {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let output = match s.trim().to_ascii_lowercase().as_str() {
            "console" | "stderr" => LogOutput::Console,
            "file" => LogOutput::File,
            "both" => LogOutput::Both,
            other => return Err(CommonError::config(format!("unknown log output '{}'", other))),
        };
        Ok(output)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let format = match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => LogFormat::Text,
            "json" => LogFormat::Json,
            other => return Err(CommonError::config(format!("unknown log format '{}'", other))),
        };
        Ok(format)
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub output: LogOutput,
    pub format: LogFormat,
    /// Directory for rotated log files
    pub log_dir: PathBuf,
    /// File name prefix ("adw-ingest" -> "adw-ingest.2024-06-15")
    pub log_file_prefix: String,
    /// Extra directives, e.g. "sqlx=warn,adw_ingest=debug"
    pub filter_directives: Option<String>,
    pub include_targets: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::for_binary("adw")
    }
}

impl LogConfig {
    /// Console logging at info level, files named after `binary`
    pub fn for_binary(binary: impl Into<String>) -> Self {
        Self {
            level: Level::INFO,
            output: LogOutput::Console,
            format: LogFormat::Text,
            log_dir: PathBuf::from("./logs"),
            log_file_prefix: binary.into(),
            filter_directives: Some("sqlx=warn".to_string()),
            include_targets: true,
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    pub fn with_filter(mut self, directives: impl Into<String>) -> Self {
        self.filter_directives = Some(directives.into());
        self
    }

    /// Override from the environment; unset variables keep current values.
    ///
    /// - `ADW_LOG_LEVEL`: trace, debug, info, warn, error
    /// - `ADW_LOG_OUTPUT`: console, file, both
    /// - `ADW_LOG_FORMAT`: text, json
    /// - `ADW_LOG_DIR`
    /// - `ADW_LOG_FILTER`: extra filter directives
    pub fn with_env(mut self) -> crate::Result<Self> {
        if let Some(level) = env_var("ADW_LOG_LEVEL") {
            self.level = level
                .parse()
                .map_err(|_| CommonError::config(format!("unknown log level '{}'", level)))?;
        }
        if let Some(output) = env_var("ADW_LOG_OUTPUT") {
            self.output = output.parse()?;
        }
        if let Some(format) = env_var("ADW_LOG_FORMAT") {
            self.format = format.parse()?;
        }
        if let Some(dir) = env_var("ADW_LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
        if let Some(filter) = env_var("ADW_LOG_FILTER") {
            self.filter_directives = Some(filter);
        }
        Ok(self)
    }

    pub fn from_env() -> crate::Result<Self> {
        Self::default().with_env()
    }

    fn env_filter(&self) -> anyhow::Result<EnvFilter> {
        let mut filter = EnvFilter::builder()
            .with_default_directive(self.level.into())
            .from_env_lossy();

        let directives = self.filter_directives.as_deref().unwrap_or_default();
        for directive in directives.split(',').map(str::trim).filter(|d| !d.is_empty()) {
            let parsed = directive
                .parse()
                .with_context(|| format!("invalid filter directive '{}'", directive))?;
            filter = filter.add_directive(parsed);
        }
        Ok(filter)
    }
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// Holds the file writer open; file logging stops when dropped.
#[must_use = "dropping the guard stops file logging"]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

type BoxedLayer = Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync>;

fn fmt_layer<W>(writer: W, config: &LogConfig, ansi: bool) -> BoxedLayer
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(config.include_targets)
        .with_ansi(ansi);

    match config.format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

/// Install the global subscriber. Call once at startup and hold the guard.
pub fn init_logging(config: &LogConfig) -> anyhow::Result<LoggingGuard> {
    let filter = config.env_filter()?;
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut file_guard = None;

    if config.output.console() {
        layers.push(fmt_layer(std::io::stderr, config, true));
    }

    if config.output.file() {
        std::fs::create_dir_all(&config.log_dir)
            .with_context(|| format!("cannot create log directory {}", config.log_dir.display()))?;
        let appender = tracing_appender::rolling::daily(&config.log_dir, &config.log_file_prefix);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        layers.push(fmt_layer(writer, config, false));
        file_guard = Some(guard);
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .context("tracing subscriber already installed")?;

    Ok(LoggingGuard { _file: file_guard })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_output_targets() {
        let both: LogOutput = "both".parse().unwrap();
        assert!(both.console() && both.file());
        let file: LogOutput = "FILE".parse().unwrap();
        assert!(!file.console());
        assert!("syslog".parse::<LogOutput>().is_err());
    }

    #[test]
    fn test_format_parse() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
    }

    #[test]
    fn test_chained_overrides() {
        let config = LogConfig::for_binary("adw-ingest")
            .with_level(Level::DEBUG)
            .with_format(LogFormat::Json)
            .with_log_dir("/var/log/adw");

        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.log_dir, PathBuf::from("/var/log/adw"));
        assert_eq!(config.log_file_prefix, "adw-ingest");
        assert_eq!(config.output, LogOutput::Console);
    }

    #[test]
    fn test_bad_directive_is_rejected() {
        let config = LogConfig::default().with_filter("sqlx=??");
        assert!(config.env_filter().is_err());
    }
}
