//! Observability module for metrics, tracing, and logging setup.
//!
//! This module provides:
//! - Structured logging with configurable levels and formats
//! - Metrics collection with a Prometheus recorder
//! - Span helpers and metric recorders for each pipeline stage

use std::time::Duration;

use anyhow::Result;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::prelude::*;

use crate::observability_config::ObservabilityConfig;

/// Initialize logging and, when enabled, the metrics recorder
pub fn init_observability(config: &ObservabilityConfig) -> Result<Option<PrometheusHandle>> {
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid observability configuration: {}", e))?;

    init_tracing_with_config(config)?;

    let handle = if config.enable_metrics {
        Some(init_metrics_with_config(config)?)
    } else {
        None
    };

    tracing::info!(
        environment = %config.environment,
        metrics_enabled = config.enable_metrics,
        "Observability stack initialized"
    );
    Ok(handle)
}

/// Initialize structured logging (pretty in development, JSON elsewhere)
pub fn init_tracing_with_config(config: &ObservabilityConfig) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
        .add_directive(format!("tabulate={}", config.log_level.to_lowercase()).parse()?)
        .add_directive("sqlx=warn".parse()?)
        .add_directive("reqwest=warn".parse()?);

    if config.use_json_logs() {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_thread_names(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    }

    tracing::info!(
        environment = %config.environment,
        log_level = %config.log_level,
        "Tracing initialized with structured logging"
    );
    Ok(())
}

/// Install the Prometheus recorder; the handle renders the exposition text
pub fn init_metrics_with_config(config: &ObservabilityConfig) -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    tracing::info!(dump_metrics = config.dump_metrics, "Metrics collection initialized");
    Ok(handle)
}

/// Create a span for one end-to-end receipt operation
pub fn pipeline_span(operation: &str) -> tracing::Span {
    tracing::info_span!("receipt_pipeline", operation = operation, component = "pipeline")
}

/// Create a span for OCR operations
pub fn ocr_span(operation: &str) -> tracing::Span {
    tracing::info_span!("ocr_operation", operation = operation, component = "ocr")
}

/// Create a span for mapping store operations
pub fn db_span(operation: &str, table: &str) -> tracing::Span {
    tracing::info_span!(
        "db_operation",
        operation = operation,
        table = table,
        component = "database"
    )
}

/// Create a span for external oracle calls
pub fn oracle_span(operation: &str, model: &str) -> tracing::Span {
    tracing::info_span!(
        "oracle_call",
        operation = operation,
        model = model,
        component = "oracle"
    )
}

/// Record OCR operation metrics
pub fn record_ocr_metrics(success: bool, duration: Duration, image_size: u64) {
    let result = if success { "success" } else { "failure" };
    metrics::counter!("ocr_operations_total", "result" => result).increment(1);
    metrics::histogram!("ocr_duration_seconds").record(duration.as_secs_f64());
    metrics::histogram!("ocr_image_size_bytes").record(image_size as f64);
}

/// Record mapping store operation metrics
pub fn record_db_metrics(operation: &str, duration: Duration, rows: usize) {
    let operation = operation.to_string();
    metrics::counter!("db_operations_total", "operation" => operation.clone()).increment(1);
    metrics::histogram!("db_operation_duration_seconds", "operation" => operation)
        .record(duration.as_secs_f64());
    metrics::histogram!("db_rows_affected").record(rows as f64);
}

/// Record heuristic parse results
pub fn record_parse_metrics(
    items: usize,
    store_detected: bool,
    total_detected: bool,
    duration: Duration,
) {
    metrics::counter!("receipt_parses_total").increment(1);
    metrics::histogram!("receipt_parse_items").record(items as f64);
    metrics::histogram!("receipt_parse_duration_seconds").record(duration.as_secs_f64());
    if !store_detected {
        metrics::counter!("receipt_parse_missing_total", "field" => "store").increment(1);
    }
    if !total_detected {
        metrics::counter!("receipt_parse_missing_total", "field" => "total").increment(1);
    }
}

/// Record the vision pass outcome (`enriched`, `fallback`, `skipped`)
pub fn record_vision_metrics(outcome: &'static str) {
    metrics::counter!("vision_enrichment_total", "outcome" => outcome).increment(1);
}

/// Record a total verification result
pub fn record_verification_metrics(is_valid: bool) {
    let result = if is_valid { "valid" } else { "invalid" };
    metrics::counter!("receipt_verifications_total", "result" => result).increment(1);
}

/// Record how many items each categorization stage resolved
pub fn record_categorization_metrics(learned: usize, ai: usize, failed: bool) {
    metrics::counter!("categorized_items_total", "stage" => "learned").increment(learned as u64);
    metrics::counter!("categorized_items_total", "stage" => "ai").increment(ai as u64);
    if failed {
        metrics::counter!("categorization_failures_total").increment(1);
    }
}

/// Record an external oracle call
pub fn record_oracle_metrics(operation: &str, success: bool, duration: Duration, attempts: u32) {
    let operation = operation.to_string();
    metrics::counter!(
        "oracle_calls_total",
        "operation" => operation.clone(),
        "result" => if success { "success" } else { "failure" }
    )
    .increment(1);
    metrics::histogram!("oracle_call_duration_seconds", "operation" => operation)
        .record(duration.as_secs_f64());
    metrics::histogram!("oracle_call_attempts").record(attempts as f64);
}

/// Update circuit breaker state metric
pub fn update_circuit_breaker_state(is_open: bool) {
    metrics::gauge!("circuit_breaker_state").set(if is_open { 1.0 } else { 0.0 });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recorders_without_installed_recorder() {
        // metrics macros are no-ops until a recorder is installed
        record_parse_metrics(3, true, false, Duration::from_millis(5));
        record_verification_metrics(true);
        record_categorization_metrics(2, 1, false);
        record_oracle_metrics("classify", false, Duration::from_millis(10), 3);
        record_db_metrics("upsert_batch", Duration::from_millis(1), 4);
        update_circuit_breaker_state(false);
    }

    #[test]
    fn test_spans_carry_operation() {
        let span = pipeline_span("process_text");
        let _guard = span.enter();
        let _oracle = oracle_span("classify", "test-model");
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ObservabilityConfig {
            log_level: "shout".to_string(),
            ..Default::default()
        };
        assert!(init_observability(&config).is_err());
    }
}
