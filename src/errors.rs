//! # Application Error Types
//!
//! Common error types used across the receipt pipeline. Degraded paths
//! (vision fallback, catch-all categorization) never surface here; only
//! hard failures and rejected inputs do.

use std::fmt;

/// General application error type for consistent error handling
#[derive(Debug, Clone, PartialEq)]
pub enum AppError {
    /// Configuration validation errors
    Config(String),
    /// Rejected input, e.g. a category outside the active vocabulary
    Validation(String),
    /// Mapping store / database errors
    Database(String),
    /// OCR processing errors (the only hard pipeline failure)
    Ocr(String),
    /// External oracle errors that callers chose to propagate
    Oracle(String),
    /// Internal application errors
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(msg) => write!(f, "[CONFIG] {}", msg),
            AppError::Validation(msg) => write!(f, "[VALIDATION] {}", msg),
            AppError::Database(msg) => write!(f, "[DATABASE] {}", msg),
            AppError::Ocr(msg) => write!(f, "[OCR] {}", msg),
            AppError::Oracle(msg) => write!(f, "[ORACLE] {}", msg),
            AppError::Internal(msg) => write!(f, "[INTERNAL] {}", msg),
        }
    }
}

impl std::error::Error for AppError {}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(err.to_string())
    }
}

impl From<crate::ocr_errors::OcrError> for AppError {
    fn from(err: crate::ocr_errors::OcrError) -> Self {
        AppError::Ocr(err.to_string())
    }
}

impl From<crate::oracle::OracleError> for AppError {
    fn from(err: crate::oracle::OracleError) -> Self {
        AppError::Oracle(err.to_string())
    }
}

/// Result type alias for convenience
pub type AppResult<T> = Result<T, AppError>;

/// Standardized error logging utilities
pub mod error_logging {
    use tracing::error;

    /// Log mapping store errors with the affected key count
    pub fn log_database_error(
        error: &impl std::fmt::Display,
        operation: &str,
        key_count: Option<usize>,
    ) {
        error!(
            error = %error,
            operation = %operation,
            key_count = ?key_count,
            "Mapping store operation failed"
        );
    }

    /// Log OCR processing errors with image and timing context
    pub fn log_ocr_error(
        error: &impl std::fmt::Display,
        operation: &str,
        image_size: Option<usize>,
        processing_duration: Option<std::time::Duration>,
    ) {
        error!(
            error = %error,
            operation = %operation,
            image_size_bytes = ?image_size,
            processing_duration_ms = ?processing_duration.map(|d| d.as_millis()),
            "OCR processing failed"
        );
    }

    /// Log oracle errors with endpoint and retry context
    pub fn log_oracle_error(
        error: &impl std::fmt::Display,
        operation: &str,
        endpoint: Option<&str>,
        attempt_count: Option<u32>,
    ) {
        error!(
            error = %error,
            operation = %operation,
            endpoint = ?endpoint,
            attempt_count = ?attempt_count,
            "Oracle call failed"
        );
    }

    /// Log rejected input values, truncating long payloads
    pub fn log_validation_error(
        error: &impl std::fmt::Display,
        operation: &str,
        input_type: &str,
        input_value: Option<&str>,
    ) {
        error!(
            error = %error,
            operation = %operation,
            input_type = %input_type,
            input_value = ?input_value.map(|v| if v.chars().count() > 100 {
                format!("{}...", v.chars().take(100).collect::<String>())
            } else {
                v.to_string()
            }),
            "Validation failed"
        );
    }

    /// Log configuration errors during startup
    pub fn log_config_error(error: &impl std::fmt::Display, config_key: &str, operation: &str) {
        error!(
            error = %error,
            config_key = %config_key,
            operation = %operation,
            "Configuration error"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_tags() {
        assert_eq!(
            AppError::Validation("Unknown category: 'Toys'".to_string()).to_string(),
            "[VALIDATION] Unknown category: 'Toys'"
        );
        assert!(AppError::Oracle("boom".to_string()).to_string().starts_with("[ORACLE]"));
    }

    #[test]
    fn test_from_ocr_error() {
        let err: AppError =
            crate::ocr_errors::OcrError::Unavailable("no engine".to_string()).into();
        assert!(matches!(err, AppError::Ocr(_)));
    }
}
