//! Receipt and line item records passed between pipeline stages.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Catch-all category assigned when classification cannot be determined
pub const CATCH_ALL_CATEGORY: &str = "Other";

/// Round a monetary amount to cents
pub fn round_cents(value: f64) -> f64 {
    round_to(value, 2)
}

pub(crate) fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// Render a receipt date token as `YYYY-MM-DD`.
///
/// ISO dates pass through; slash or dash tokens are read month-first, then
/// day-first. Two-digit years are taken as 20xx.
pub fn normalize_receipt_date(token: &str) -> Option<String> {
    let token = token.trim();
    let parts: Vec<&str> = token.split(['/', '-']).collect();
    if parts.len() != 3 {
        return None;
    }
    // year-first only with a four digit year, `3-7-24` is month-first
    if parts[0].len() == 4 {
        return NaiveDate::parse_from_str(token, "%Y-%m-%d")
            .ok()
            .map(|date| date.format("%Y-%m-%d").to_string());
    }
    let first: u32 = parts[0].parse().ok()?;
    let second: u32 = parts[1].parse().ok()?;
    let year: i32 = match parts[2].len() {
        2 => 2000 + parts[2].parse::<i32>().ok()?,
        4 => parts[2].parse().ok()?,
        _ => return None,
    };

    NaiveDate::from_ymd_opt(year, first, second)
        .or_else(|| NaiveDate::from_ymd_opt(year, second, first))
        .map(|date| date.format("%Y-%m-%d").to_string())
}

/// One line item as read from the receipt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawItem {
    /// Verbatim OCR text, the stable key source for learned mappings
    pub raw_name: String,
    /// Display form
    pub clean_name: String,
    /// Unit price
    pub price: f64,
    pub quantity: f64,
}

impl RawItem {
    pub fn new(
        raw_name: impl Into<String>,
        clean_name: impl Into<String>,
        price: f64,
        quantity: f64,
    ) -> Self {
        Self {
            raw_name: raw_name.into(),
            clean_name: clean_name.into(),
            price,
            quantity,
        }
    }

    pub fn line_total(&self) -> f64 {
        self.price * self.quantity
    }
}

/// Transient result of one parse attempt
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedReceipt {
    pub store_name: Option<String>,
    /// Date token as printed (e.g. `02/14/2026`) or ISO from the vision pass
    pub receipt_date: Option<String>,
    pub subtotal: Option<f64>,
    pub tax: Option<f64>,
    /// Sum of every discount line, 0 when none
    pub discounts: f64,
    pub total: Option<f64>,
    pub items: Vec<RawItem>,
    pub raw_text: String,
}

impl ParsedReceipt {
    /// Σ price × quantity rounded to cents
    pub fn items_sum(&self) -> f64 {
        round_cents(self.items.iter().map(RawItem::line_total).sum())
    }
}

/// Where an item's category came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CategorySource {
    /// Stage 1 hit in the learned mappings
    Learned,
    /// Stage 2 classification oracle (or its catch-all fallback)
    Ai,
    /// Human correction
    Manual,
}

impl CategorySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CategorySource::Learned => "learned",
            CategorySource::Ai => "ai",
            CategorySource::Manual => "manual",
        }
    }
}

/// Item handed to the categorization pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemInput {
    pub id: u64,
    pub raw_name: String,
    pub clean_name: Option<String>,
    #[serde(default)]
    pub price: f64,
    #[serde(default = "default_quantity")]
    pub quantity: f64,
}

fn default_quantity() -> f64 {
    1.0
}

impl ItemInput {
    pub fn new(id: u64, raw_name: impl Into<String>) -> Self {
        Self {
            id,
            raw_name: raw_name.into(),
            clean_name: None,
            price: 0.0,
            quantity: 1.0,
        }
    }

    /// Build pipeline inputs from parsed items, numbering them in order
    pub fn from_raw_items(items: &[RawItem]) -> Vec<Self> {
        items
            .iter()
            .enumerate()
            .map(|(idx, item)| Self {
                id: idx as u64,
                raw_name: item.raw_name.clone(),
                clean_name: Some(item.clean_name.clone()),
                price: item.price,
                quantity: item.quantity,
            })
            .collect()
    }

    /// Name shown to the classification oracle
    pub fn oracle_name(&self) -> &str {
        match self.clean_name.as_deref() {
            Some(name) if !name.trim().is_empty() => name,
            _ => &self.raw_name,
        }
    }
}

/// Item annotated with its category
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorizedItem {
    pub id: u64,
    pub raw_name: String,
    pub clean_name: Option<String>,
    pub price: f64,
    pub quantity: f64,
    pub category: String,
    pub category_source: CategorySource,
    pub ai_confidence: Option<f64>,
    /// Set once a human changed the category
    #[serde(default)]
    pub corrected: bool,
}

impl CategorizedItem {
    pub fn from_input(
        input: &ItemInput,
        category: impl Into<String>,
        source: CategorySource,
        confidence: f64,
    ) -> Self {
        Self {
            id: input.id,
            raw_name: input.raw_name.clone(),
            clean_name: input.clean_name.clone(),
            price: input.price,
            quantity: input.quantity,
            category: category.into(),
            category_source: source,
            ai_confidence: Some(confidence),
            corrected: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_receipt_date() {
        assert_eq!(normalize_receipt_date("02/14/2026").as_deref(), Some("2026-02-14"));
        assert_eq!(normalize_receipt_date("2026-02-14").as_deref(), Some("2026-02-14"));
        assert_eq!(normalize_receipt_date("3-7-24").as_deref(), Some("2024-03-07"));
        assert_eq!(normalize_receipt_date("12-05-25").as_deref(), Some("2025-12-05"));
        assert_eq!(normalize_receipt_date("2026/02/14"), None);
        // month 25 is impossible, so day-first
        assert_eq!(normalize_receipt_date("25/12/2025").as_deref(), Some("2025-12-25"));
        assert_eq!(normalize_receipt_date("31/31/2025"), None);
        assert_eq!(normalize_receipt_date("not a date"), None);
    }

    #[test]
    fn test_items_sum_rounds_to_cents() {
        let receipt = ParsedReceipt {
            items: vec![
                RawItem::new("A", "A", 0.1, 3.0),
                RawItem::new("B", "B", 1.005, 1.0),
            ],
            ..Default::default()
        };
        assert!((receipt.items_sum() - 1.31).abs() < 1e-9);
    }

    #[test]
    fn test_category_source_serializes_lowercase() {
        let json = serde_json::to_string(&CategorySource::Learned).unwrap();
        assert_eq!(json, "\"learned\"");
    }

    #[test]
    fn test_oracle_name_prefers_clean_name() {
        let mut input = ItemInput::new(0, "KS STEAKSTRIP");
        assert_eq!(input.oracle_name(), "KS STEAKSTRIP");
        input.clean_name = Some("Kirkland Steak Strips".to_string());
        assert_eq!(input.oracle_name(), "Kirkland Steak Strips");
        input.clean_name = Some("  ".to_string());
        assert_eq!(input.oracle_name(), "KS STEAKSTRIP");
    }
}
