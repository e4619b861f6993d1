use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Configuration for the telemetry subsystem.
#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by RUST_LOG env var.
    pub log_level: Level,
    /// Per-module level overrides (e.g. "ray_engine" => DEBUG).
    pub module_levels: Vec<(String, Level)>,
    /// Emit JSON lines instead of the human-readable format.
    pub json_output: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            module_levels: Vec::new(),
            json_output: false,
        }
    }
}

impl TelemetryConfig {
    /// Env-filter directive string built from the configured levels,
    /// e.g. "info,ray_engine=debug".
    pub fn filter_directives(&self) -> String {
        let mut directives = self.log_level.to_string().to_lowercase();
        for (module, level) in &self.module_levels {
            directives.push_str(&format!(",{}={}", module, level.to_string().to_lowercase()));
        }
        directives
    }
}

/// Initialize the telemetry subsystem. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.filter_directives()));

    if config.json_output {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter);
        tracing_subscriber::registry().with(fmt_layer).init();
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter);
        tracing_subscriber::registry().with(fmt_layer).init();
    }
}
