//! # Observability Configuration
//!
//! Environment-specific settings for logging and metrics.

use std::env;

/// Observability configuration for different environments
#[derive(Debug, Clone)]
pub struct ObservabilityConfig {
    /// Environment name (development, staging, production)
    pub environment: String,
    /// Default log level when `RUST_LOG` is not set
    pub log_level: String,
    /// Explicit log format (`json` or `pretty`), overrides the environment default
    pub log_format: Option<String>,
    /// Whether to install the Prometheus recorder
    pub enable_metrics: bool,
    /// Print the rendered metrics after a run
    pub dump_metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            log_level: "info".to_string(),
            log_format: None,
            enable_metrics: true,
            dump_metrics: false,
        }
    }
}

impl ObservabilityConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format: env::var("LOG_FORMAT").ok().map(|f| f.to_lowercase()),
            enable_metrics: env::var("ENABLE_METRICS")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
            dump_metrics: env::var("DUMP_METRICS")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }

    pub fn is_development(&self) -> bool {
        self.environment == "development"
    }

    /// JSON logs everywhere except development, unless `log_format` says otherwise
    pub fn use_json_logs(&self) -> bool {
        match self.log_format.as_deref() {
            Some("json") => true,
            Some("pretty") => false,
            _ => !self.is_development(),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        const LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(format!("Invalid log level: {}", self.log_level));
        }
        if let Some(format) = &self.log_format {
            if format != "json" && format != "pretty" {
                return Err(format!("Invalid log format: {}", format));
            }
        }
        if self.dump_metrics && !self.enable_metrics {
            return Err("dump_metrics requires enable_metrics".to_string());
        }
        Ok(())
    }
}

/// Environment-specific configuration presets
pub mod presets {
    use super::ObservabilityConfig;

    pub fn development() -> ObservabilityConfig {
        ObservabilityConfig {
            environment: "development".to_string(),
            log_level: "debug".to_string(),
            ..Default::default()
        }
    }

    pub fn production() -> ObservabilityConfig {
        ObservabilityConfig {
            environment: "production".to_string(),
            log_level: "warn".to_string(),
            ..Default::default()
        }
    }
}
