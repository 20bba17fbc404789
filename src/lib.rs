//! # Tabulate
//!
//! Turns noisy OCR text from grocery receipts into structured records
//! (store, date, totals, line items) and assigns every item a spending
//! category, learning from approved results so that known items skip the
//! external classifier next time.

pub mod categorizer;
pub mod circuit_breaker;
pub mod classifier;
pub mod config;
pub mod db;
pub mod errors;
pub mod line_formats;
pub mod mapping_store;
pub mod matcher;
pub mod normalize;
pub mod observability;
pub mod observability_config;
pub mod ocr;
pub mod ocr_config;
pub mod ocr_errors;
pub mod oracle;
pub mod pipeline;
pub mod receipt;
pub mod text_processing;
pub mod verification;
pub mod vision;

// Re-export types for easier access
pub use categorizer::{
    apply_manual_correction, commit_approved_mappings, CategorizationOutcome, Categorizer,
};
pub use errors::{AppError, AppResult};
pub use mapping_store::{InMemoryMappingStore, MappingStore};
pub use matcher::{find_best_match, FuzzyMatcher};
pub use normalize::normalize_key;
pub use pipeline::{ProcessedReceipt, ReceiptProcessor};
pub use receipt::{CategorizedItem, ItemInput, ParsedReceipt, RawItem};
pub use text_processing::{parse_receipt_text, ReceiptParser};
pub use verification::{verify_total, TotalVerification};
