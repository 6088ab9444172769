//! Logging setup shared by the host CLI and the worker process.
//!
//! All output goes to stderr: a worker's stdout carries the startup handshake,
//! and a worker's stderr is inherited by the host, so worker logs show up in
//! the host's log stream.
//!
//! # Environment Variables
//!
//! - `SCANBRIDGE_LOG` - Log filter (overrides RUST_LOG)
//! - `SCANBRIDGE_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `SCANBRIDGE_LOG_FORMAT` - Output format: pretty, compact, json
//! - `SCANBRIDGE_LOG_FILE` - Also write logs to this file
//! - `SCANBRIDGE_LOG_ROTATION` - Rotation of that file: hourly, daily, never
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! # Example
//!
//! ```no_run
//! use scanbridge::logging::{LogConfig, init};
//!
//! init(&LogConfig::for_host().with_env_overrides());
//! ```

use clap::ValueEnum;
use std::path::{Path, PathBuf};
use tracing::{Level, Subscriber};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, MakeWriter, format::FmtSpan},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Multi-line, human-readable
    #[default]
    Pretty,
    Compact,
    /// One JSON object per event
    Json,
}

/// Rotation of the optional log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    /// Additional log file (None = stderr only)
    pub file_path: Option<PathBuf>,
    pub rotation: LogRotation,
    /// Filter directive; takes precedence over `level` when set.
    pub filter: Option<String>,
    pub show_target: bool,
    pub show_thread_ids: bool,
    /// Log span timing on close.
    pub span_events: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::default(),
            file_path: None,
            rotation: LogRotation::default(),
            filter: None,
            show_target: true,
            show_thread_ids: false,
            span_events: false,
        }
    }
}

impl LogConfig {
    /// Preset for the host CLI: warnings only, so command output stays clean.
    pub fn for_host() -> Self {
        Self {
            level: Level::WARN,
            ..Self::default()
        }
    }

    /// Preset for worker processes: compact lines with thread ids, since
    /// driver callbacks log from their own threads.
    pub fn for_worker() -> Self {
        Self {
            level: Level::WARN,
            format: LogFormat::Compact,
            show_thread_ids: true,
            ..Self::default()
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Apply environment variable overrides.
    ///
    /// A filter already set (from `-v` or `-q`) wins over the environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_env_lookup(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary variable lookup. Unparseable values
    /// are ignored.
    pub fn with_env_lookup(mut self, get: impl Fn(&str) -> Option<String>) -> Self {
        if self.filter.is_none() {
            self.filter = get("SCANBRIDGE_LOG").or_else(|| get("RUST_LOG"));
        }
        if self.filter.is_none()
            && let Some(level) = get("SCANBRIDGE_LOG_LEVEL").and_then(|l| parse_level(&l))
        {
            self.level = level;
        }
        if let Some(format) = get("SCANBRIDGE_LOG_FORMAT").and_then(|f| parse_choice(&f)) {
            self.format = format;
        }
        if let Some(path) = get("SCANBRIDGE_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }
        if let Some(rotation) = get("SCANBRIDGE_LOG_ROTATION").and_then(|r| parse_choice(&r)) {
            self.rotation = rotation;
        }
        self
    }

    fn build_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.level.to_string().to_lowercase());
        let Some(directive) = &self.filter else {
            return fallback();
        };
        EnvFilter::try_new(directive).unwrap_or_else(|e| {
            eprintln!("warning: ignoring log filter '{}': {}", directive, e);
            fallback()
        })
    }

    /// A formatting layer for this configuration writing to `writer`.
    fn fmt_layer<S, W>(&self, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
    where
        S: Subscriber + for<'a> LookupSpan<'a>,
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let spans = if self.span_events {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let layer = fmt::layer()
            .with_span_events(spans)
            .with_target(self.show_target)
            .with_thread_ids(self.show_thread_ids)
            .with_ansi(ansi)
            .with_writer(writer);

        match self.format {
            LogFormat::Pretty => layer.boxed(),
            LogFormat::Compact => layer.compact().boxed(),
            LogFormat::Json => layer.json().boxed(),
        }
    }
}

/// Parse a level name (`warn`, `DEBUG`, ...) or number (1 = error .. 5 = trace).
pub fn parse_level(s: &str) -> Option<Level> {
    s.trim().parse().ok()
}

fn parse_choice<T: ValueEnum>(s: &str) -> Option<T> {
    T::from_str(s.trim(), true).ok()
}

/// Install the global subscriber: stderr, plus a rolling file when
/// `file_path` is set. Only the first call in a process takes effect.
pub fn init(config: &LogConfig) {
    let file_layer = config.file_path.as_ref().map(|path| {
        let dir = path.parent().unwrap_or(Path::new("."));
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("scanbridge.log");
        let appender = RollingFileAppender::new(config.rotation.into(), dir, name);
        config.fmt_layer(appender, false)
    });

    let _ = tracing_subscriber::registry()
        .with(config.build_filter())
        .with(config.fmt_layer(std::io::stderr, true))
        .with(file_layer)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_parse_choices() {
        assert_eq!(parse_choice("JSON"), Some(LogFormat::Json));
        assert_eq!(parse_choice(" compact "), Some(LogFormat::Compact));
        assert_eq!(parse_choice::<LogFormat>("xml"), None);
        assert_eq!(parse_choice("hourly"), Some(LogRotation::Hourly));
        assert_eq!(parse_choice::<LogRotation>("weekly"), None);
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("warn"), Some(Level::WARN));
        assert_eq!(parse_level("DEBUG"), Some(Level::DEBUG));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_presets() {
        let host = LogConfig::for_host();
        assert_eq!(host.level, Level::WARN);
        assert_eq!(host.format, LogFormat::Pretty);

        let worker = LogConfig::for_worker();
        assert_eq!(worker.format, LogFormat::Compact);
        assert!(worker.show_thread_ids);
    }

    #[test]
    fn test_scanbridge_log_beats_rust_log() {
        let config = LogConfig::default().with_env_lookup(lookup(&[
            ("SCANBRIDGE_LOG", "scanbridge=debug"),
            ("RUST_LOG", "trace"),
        ]));
        assert_eq!(config.filter.as_deref(), Some("scanbridge=debug"));

        let config = LogConfig::default().with_env_lookup(lookup(&[("RUST_LOG", "trace")]));
        assert_eq!(config.filter.as_deref(), Some("trace"));
    }

    #[test]
    fn test_cli_filter_wins_over_env() {
        let config = LogConfig::default()
            .with_filter("warn".to_string())
            .with_env_lookup(lookup(&[
                ("SCANBRIDGE_LOG", "trace"),
                ("SCANBRIDGE_LOG_LEVEL", "debug"),
            ]));
        assert_eq!(config.filter.as_deref(), Some("warn"));
        assert_eq!(config.level, Level::INFO);
    }

    #[test]
    fn test_file_settings_from_env() {
        let config = LogConfig::for_worker().with_env_lookup(lookup(&[
            ("SCANBRIDGE_LOG_LEVEL", "debug"),
            ("SCANBRIDGE_LOG_FORMAT", "json"),
            ("SCANBRIDGE_LOG_FILE", "/tmp/scanbridge-worker.log"),
            ("SCANBRIDGE_LOG_ROTATION", "never"),
        ]));
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(
            config.file_path,
            Some(PathBuf::from("/tmp/scanbridge-worker.log"))
        );
        assert_eq!(config.rotation, LogRotation::Never);
    }

    #[test]
    fn test_bad_values_are_ignored() {
        let config = LogConfig::for_host().with_env_lookup(lookup(&[
            ("SCANBRIDGE_LOG_LEVEL", "loud"),
            ("SCANBRIDGE_LOG_FORMAT", "xml"),
        ]));
        assert_eq!(config.level, Level::WARN);
        assert_eq!(config.format, LogFormat::Pretty);
    }
}
