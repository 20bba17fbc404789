//! # OCR Configuration Module
//!
//! Configuration for the OCR engine and the shared retry / circuit
//! breaker settings used by every external call.

// Constants for OCR configuration
pub const DEFAULT_LANGUAGES: &str = "eng";
pub const MAX_FILE_SIZE: u64 = 20 * 1024 * 1024; // 20MB limit for receipt photos
/// Characters that occur on grocery receipts
pub const RECEIPT_CHARACTER_WHITELIST: &str =
    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789 .,/$%#&*@-:()'";

/// Recovery configuration for error handling
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,
    /// Base delay between retries in milliseconds
    pub base_retry_delay_ms: u64,
    /// Maximum delay between retries in milliseconds
    pub max_retry_delay_ms: u64,
    /// Timeout for a single external call in seconds
    pub operation_timeout_secs: u64,
    /// Circuit breaker failure threshold
    pub circuit_breaker_threshold: u32,
    /// Circuit breaker reset timeout in seconds
    pub circuit_breaker_reset_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_retry_delay_ms: 1000,  // 1 second
            max_retry_delay_ms: 10000,  // 10 seconds
            operation_timeout_secs: 60, // vision calls are slow
            circuit_breaker_threshold: 5,
            circuit_breaker_reset_secs: 60, // 1 minute
        }
    }
}

impl RecoveryConfig {
    /// Validate recovery configuration parameters
    pub fn validate(&self) -> crate::errors::AppResult<()> {
        if self.max_retries == 0 {
            return Err(crate::errors::AppError::Config(
                "max_retries must be greater than 0".to_string(),
            ));
        }
        if self.base_retry_delay_ms == 0 {
            return Err(crate::errors::AppError::Config(
                "base_retry_delay_ms must be greater than 0".to_string(),
            ));
        }
        if self.max_retry_delay_ms < self.base_retry_delay_ms {
            return Err(crate::errors::AppError::Config(format!(
                "max_retry_delay_ms ({}) must be >= base_retry_delay_ms ({})",
                self.max_retry_delay_ms, self.base_retry_delay_ms
            )));
        }
        if self.operation_timeout_secs == 0 {
            return Err(crate::errors::AppError::Config(
                "operation_timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.circuit_breaker_threshold == 0 {
            return Err(crate::errors::AppError::Config(
                "circuit_breaker_threshold must be greater than 0".to_string(),
            ));
        }
        if self.circuit_breaker_reset_secs == 0 {
            return Err(crate::errors::AppError::Config(
                "circuit_breaker_reset_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Page Segmentation Mode for Tesseract OCR
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum PageSegMode {
    /// Fully automatic page segmentation
    Auto = 3,
    /// Assume a single column of text
    SingleColumn = 4,
    /// Assume a single uniform block of text (receipts)
    #[default]
    SingleBlock = 6,
    /// Find as much text as possible in no particular order
    SparseText = 11,
}

impl PageSegMode {
    /// Convert PSM mode to string value for Tesseract
    pub fn as_str(&self) -> &'static str {
        match self {
            PageSegMode::Auto => "3",
            PageSegMode::SingleColumn => "4",
            PageSegMode::SingleBlock => "6",
            PageSegMode::SparseText => "11",
        }
    }
}

impl std::str::FromStr for PageSegMode {
    type Err = crate::errors::AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "3" => Ok(PageSegMode::Auto),
            "4" => Ok(PageSegMode::SingleColumn),
            "6" => Ok(PageSegMode::SingleBlock),
            "11" => Ok(PageSegMode::SparseText),
            other => Err(crate::errors::AppError::Config(format!(
                "Unsupported page segmentation mode: {}",
                other
            ))),
        }
    }
}

/// Configuration structure for OCR processing
#[derive(Debug, Clone)]
pub struct OcrConfig {
    /// OCR language codes (e.g., "eng")
    pub languages: String,
    /// Maximum accepted image size in bytes
    pub max_file_size: u64,
    /// Timeout for one extraction in seconds
    pub timeout_secs: u64,
    /// Page segmentation mode handed to Tesseract
    pub psm_mode: PageSegMode,
    /// Character whitelist restricting OCR output to receipt characters
    pub character_whitelist: Option<String>,
    /// Run grayscale / band inversion / sharpening before extraction
    pub preprocess: bool,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            languages: DEFAULT_LANGUAGES.to_string(),
            max_file_size: MAX_FILE_SIZE,
            timeout_secs: 30,
            psm_mode: PageSegMode::default(),
            character_whitelist: Some(RECEIPT_CHARACTER_WHITELIST.to_string()),
            preprocess: true,
        }
    }
}

impl OcrConfig {
    /// Validate OCR configuration parameters
    pub fn validate(&self) -> crate::errors::AppResult<()> {
        if self.languages.trim().is_empty() {
            return Err(crate::errors::AppError::Config(
                "languages cannot be empty".to_string(),
            ));
        }
        if self.max_file_size == 0 {
            return Err(crate::errors::AppError::Config(
                "max_file_size must be greater than 0".to_string(),
            ));
        }
        if self.timeout_secs == 0 {
            return Err(crate::errors::AppError::Config(
                "timeout_secs must be greater than 0".to_string(),
            ));
        }
        if let Some(whitelist) = &self.character_whitelist {
            if whitelist.is_empty() {
                return Err(crate::errors::AppError::Config(
                    "character_whitelist cannot be empty when set".to_string(),
                ));
            }
        }
        Ok(())
    }
}
