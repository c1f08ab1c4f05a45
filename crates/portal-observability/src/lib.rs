//! Logging setup for the VeilNet portal
//!
//! Structured `tracing` output to the console (pretty, JSON or compact) and
//! optionally to rolling JSON log files.
//!
//! ```no_run
//! use portal_observability::{init_logging, LoggingConfig};
//!
//! let _guard = init_logging(&LoggingConfig::default()).expect("logging");
//! tracing::info!("Portal starting");
//! ```

pub mod config;
pub mod error;
pub mod logging;

pub use config::{FileLoggingConfig, LogFormat, LogLevel, LoggingConfig, RotationStrategy};
pub use error::{ObservabilityError, Result};
pub use logging::{init_logging, LogGuard};
