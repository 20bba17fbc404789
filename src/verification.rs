//! # Total Verification
//!
//! Reconciles the extracted line items against the printed grand total.
//! The derived item sum replaces any OCR-read subtotal: a correctly read
//! subtotal would hide items the parser missed.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::receipt::{round_cents, ParsedReceipt};

/// Two-cent rounding allowance
pub const DEFAULT_TOTAL_TOLERANCE: f64 = 0.02;

/// Outcome shown to the user next to the receipt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TotalVerification {
    pub is_valid: bool,
    pub message: String,
}

impl TotalVerification {
    fn invalid(message: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TotalVerifier {
    tolerance: f64,
}

impl Default for TotalVerifier {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOTAL_TOLERANCE,
        }
    }
}

impl TotalVerifier {
    pub fn new(tolerance: f64) -> Self {
        Self { tolerance }
    }

    /// Check `items + tax − discounts` against the total, writing the item
    /// sum back as the receipt subtotal
    pub fn verify(&self, receipt: &mut ParsedReceipt) -> TotalVerification {
        let Some(total) = receipt.total else {
            return TotalVerification::invalid("Could not find a total on the receipt.");
        };

        let items_sum = receipt.items_sum();
        if items_sum == 0.0 {
            return TotalVerification::invalid("No line items found to verify against.");
        }
        receipt.subtotal = Some(items_sum);

        let tax = receipt.tax.unwrap_or(0.0);
        let computed = round_cents(items_sum + tax - receipt.discounts);
        let expected = round_cents(total);
        let diff = round_cents((computed - expected).abs());

        // float slack so a diff of exactly the tolerance passes
        if diff <= self.tolerance + 1e-9 {
            let savings = if receipt.discounts != 0.0 {
                format!(" − Savings ${:.2}", receipt.discounts)
            } else {
                String::new()
            };
            debug!(items_sum, tax, computed, "Receipt total verified");
            TotalVerification {
                is_valid: true,
                message: format!(
                    "Items ${:.2} + Tax ${:.2}{} = ${:.2} ✓",
                    items_sum, tax, savings, computed
                ),
            }
        } else {
            warn!(items_sum, tax, computed, expected, diff, "Receipt total mismatch");
            TotalVerification::invalid(format!(
                "Mismatch: items ${:.2} + tax ${:.2} = ${:.2} ≠ receipt total ${:.2} (diff ${:.2}). \
                 Check for missing items or manual discounts.",
                items_sum, tax, computed, expected, diff
            ))
        }
    }
}

/// Verify with the default two-cent tolerance
pub fn verify_total(receipt: &mut ParsedReceipt) -> TotalVerification {
    TotalVerifier::default().verify(receipt)
}
