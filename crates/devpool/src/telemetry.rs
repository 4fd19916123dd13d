// Logging setup
//
// The pool logs through `tracing`; embedders that do not install their own
// subscriber can call `init_telemetry` once at startup.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Logging configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Service name attached to the startup log line
    pub service_name: String,
    /// Log filter (e.g., "info", "devpool=debug")
    pub log_filter: Option<String>,
    /// Colored console output
    pub ansi: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "devpool".to_string(),
            log_filter: None,
            ansi: true,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `DEVPOOL_SERVICE_NAME`: Service name (default: "devpool")
    /// - `RUST_LOG` or `LOG_LEVEL`: Log filter
    /// - `NO_COLOR`: Disables ANSI colors when set
    pub fn from_env() -> Self {
        Self {
            service_name: std::env::var("DEVPOOL_SERVICE_NAME")
                .unwrap_or_else(|_| "devpool".to_string()),
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok()),
            ansi: std::env::var_os("NO_COLOR").is_none(),
        }
    }

    pub fn with_log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }

    fn env_filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new("info"))
    }
}

/// Install a console subscriber
///
/// Returns false when a global subscriber was already installed, in which
/// case nothing changes.
///
/// # Example
///
/// ```ignore
/// use devpool::telemetry::{init_telemetry, TelemetryConfig};
///
/// #[tokio::main]
/// async fn main() {
///     init_telemetry(TelemetryConfig::from_env());
///     // ... your application code
/// }
/// ```
pub fn init_telemetry(config: TelemetryConfig) -> bool {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_ansi(config.ansi)
        .with_filter(config.env_filter());

    let installed = tracing_subscriber::registry()
        .with(console_layer)
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(service = %config.service_name, "Logging initialized");
    }
    installed
}
