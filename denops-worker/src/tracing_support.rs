//! Tracing and logging support.
//!
//! Workers log through `tracing`; hosts embedding them call one of these
//! initializers once at startup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Tracing output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracingFormat {
    /// Human-readable format with colors (default for development).
    Pretty,

    /// Compact format without colors.
    Compact,

    /// JSON format (recommended for production).
    Json,
}

/// Tracing configuration.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Log level filter.
    ///
    /// If None, uses RUST_LOG environment variable or defaults to "info".
    pub level: Option<tracing::Level>,

    /// Output format.
    pub format: TracingFormat,

    /// Include thread names in output (worker threads are named).
    pub thread_names: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: None,
            format: TracingFormat::Compact,
            thread_names: true,
        }
    }
}

impl TracingConfig {
    fn filter(&self) -> EnvFilter {
        match self.level {
            Some(level) => EnvFilter::new(level.to_string()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        }
    }
}

/// Initialize tracing subscriber with default settings.
///
/// Uses RUST_LOG for level filtering, `info` when unset. Diagnostics go to
/// stderr.
pub fn init_subscriber() {
    init_subscriber_with_config(TracingConfig::default());
}

/// Initialize tracing subscriber with custom configuration.
///
/// Does nothing if a global subscriber is already set.
pub fn init_subscriber_with_config(config: TracingConfig) {
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_thread_names(config.thread_names);

    let result = match config.format {
        TracingFormat::Pretty => tracing_subscriber::registry()
            .with(config.filter())
            .with(layer.pretty())
            .try_init(),
        TracingFormat::Compact => tracing_subscriber::registry()
            .with(config.filter())
            .with(layer.compact())
            .try_init(),
        TracingFormat::Json => tracing_subscriber::registry()
            .with(config.filter())
            .with(layer.json())
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("Tracing subscriber already initialized");
    }
}
