//! Tracing setup.
//!
//! Structured logging with `tracing` and `tracing-subscriber`:
//! - Selectable output format (pretty, compact, JSON)
//! - `RUST_LOG` filtering, falling back to the configured level
//! - Idempotent initialization, safe to call from tests
//!
//! # Example
//! ```no_run
//! use lecroy_daq::logging::{self, LogFormat, TracingConfig};
//!
//! let config = TracingConfig::from_verbosity(1).with_format(LogFormat::Compact);
//! logging::init(config)?;
//! tracing::info!(channel = 1, "Waveform published");
//! # Ok::<(), String>(())
//! ```

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Pretty-printed format with colors (for development)
    #[default]
    Pretty,
    /// Compact format without colors (for production)
    Compact,
    /// JSON format for structured logging (for log aggregation)
    Json,
}

/// Tracing configuration options.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Maximum level when `RUST_LOG` is not set
    pub level: Level,
    /// Output format
    pub format: LogFormat,
    /// Whether to include file and line numbers
    pub with_file_and_line: bool,
    /// Whether to enable ANSI colors (only for Pretty format)
    pub with_ansi: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            with_file_and_line: false,
            with_ansi: true,
        }
    }
}

impl TracingConfig {
    /// Map a `-v` count to a level: 0 → info, 1 → debug, 2+ → trace.
    pub fn from_verbosity(verbosity: u8) -> Self {
        Self {
            level: level_for_verbosity(verbosity),
            ..Default::default()
        }
    }

    /// Set output format
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Include source file and line in each event
    pub fn with_file_and_line(mut self, enabled: bool) -> Self {
        self.with_file_and_line = enabled;
        self
    }

    /// Enable or disable ANSI colors
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Initialize the global subscriber.
///
/// If a subscriber is already installed this returns `Ok(())`.
pub fn init(config: TracingConfig) -> Result<(), String> {
    // Already initialized: expected in tests
    if tracing::dispatcher::has_been_set() {
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_to_filter_string(config.level)));

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_ansi(config.with_ansi)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_ansi(false)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_filter(env_filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| format!("Failed to initialize tracing: {}", e))
}

fn level_for_verbosity(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

fn level_to_filter_string(level: Level) -> String {
    level.as_str().to_ascii_lowercase()
}
