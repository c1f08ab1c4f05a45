//! Logging configuration

use serde::{Deserialize, Serialize};
use std::io::IsTerminal;
use std::path::PathBuf;

/// Crates whose events are shown at the configured level; everything else
/// is capped at `warn`
const PORTAL_TARGETS: &[&str] = &["portal_relay", "veilnet_portal", "portal_observability"];

/// Log output format
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable multi-line output
    #[default]
    Pretty,
    /// One JSON object per event
    Json,
    /// Single-line text
    Compact,
}

impl LogFormat {
    /// Pretty on a terminal, JSON when stdout is redirected
    pub fn detect() -> Self {
        if std::io::stdout().is_terminal() {
            LogFormat::Pretty
        } else {
            LogFormat::Json
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    /// Level for a `-v` count: none or one is info, two debug, three or more trace
    pub fn from_verbosity(count: u8) -> Self {
        match count {
            0 | 1 => LogLevel::Info,
            2 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl From<LogLevel> for tracing_subscriber::filter::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
            LogLevel::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
            LogLevel::Info => tracing_subscriber::filter::LevelFilter::INFO,
            LogLevel::Warn => tracing_subscriber::filter::LevelFilter::WARN,
            LogLevel::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub format: LogFormat,

    /// Raw `EnvFilter` directives, replacing the level-derived default
    #[serde(default)]
    pub filter_directives: Option<String>,

    /// Additionally log to rotating files
    #[serde(default)]
    pub file: Option<FileLoggingConfig>,

    /// Include source file and line
    #[serde(default)]
    pub include_location: bool,

    /// Include the module path
    #[serde(default = "default_true")]
    pub include_target: bool,
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
            filter_directives: None,
            file: None,
            include_location: false,
            include_target: true,
        }
    }
}

impl LoggingConfig {
    /// Filter directives used when `RUST_LOG` is not set
    pub fn directives(&self) -> String {
        if let Some(directives) = &self.filter_directives {
            return directives.clone();
        }

        let level = self.level.as_str();
        let floor = self.level.min(LogLevel::Warn).as_str();
        let mut directives = vec![floor.to_string()];
        directives.extend(PORTAL_TARGETS.iter().map(|t| format!("{}={}", t, level)));
        directives.join(",")
    }
}

/// Rotating file output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileLoggingConfig {
    pub directory: PathBuf,

    #[serde(default = "default_prefix")]
    pub prefix: String,

    #[serde(default)]
    pub rotation: RotationStrategy,
}

fn default_prefix() -> String {
    "veilnet-portal".to_string()
}

/// Log file rotation strategy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RotationStrategy {
    #[default]
    Daily,
    Hourly,
    /// Single file, never rotated
    Never,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_cap_dependencies_at_warn() {
        let config = LoggingConfig::default();
        assert_eq!(
            config.directives(),
            "warn,portal_relay=info,veilnet_portal=info,portal_observability=info"
        );
    }

    #[test]
    fn test_quiet_level_applies_everywhere() {
        let config = LoggingConfig {
            level: LogLevel::Error,
            ..Default::default()
        };
        assert!(config.directives().starts_with("error,portal_relay=error"));
    }

    #[test]
    fn test_explicit_directives_win() {
        let config = LoggingConfig {
            filter_directives: Some("hyper=debug".to_string()),
            ..Default::default()
        };
        assert_eq!(config.directives(), "hyper=debug");
    }

    #[test]
    fn test_verbosity_mapping() {
        assert_eq!(LogLevel::from_verbosity(0), LogLevel::Info);
        assert_eq!(LogLevel::from_verbosity(1), LogLevel::Info);
        assert_eq!(LogLevel::from_verbosity(2), LogLevel::Debug);
        assert_eq!(LogLevel::from_verbosity(7), LogLevel::Trace);
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: LoggingConfig = serde_json::from_str(
            r#"{"level":"debug","format":"json","file":{"directory":"/var/log/veilnet"}}"#,
        )
        .unwrap();

        assert_eq!(config.level, LogLevel::Debug);
        assert_eq!(config.format, LogFormat::Json);
        assert!(config.include_target);
        let file = config.file.unwrap();
        assert_eq!(file.prefix, "veilnet-portal");
        assert_eq!(file.rotation, RotationStrategy::Daily);
    }
}
