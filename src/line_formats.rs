//! # Line Formats
//!
//! Per-line item extractors for the receipt layouts the parser knows about.
//! Each format reads one upper-cased receipt line and either yields a
//! `(name, price, quantity)` candidate or declines. The parser tries them in
//! order and keeps the first success.
//!
//! - [`PlainFormat`]: `"NAME   $PRICE"` with an optional `"N x "` multiplier
//! - [`WarehouseFormat`]: `"[E] SKU NAME PRICE [flag]"` (warehouse clubs)
//! - [`SequentialFormat`]: `"N NAME [flag] PRICE"` where `N` is the line number

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use tracing::trace;

lazy_static! {
    static ref PLAIN_LINE: Regex = Regex::new(
        r"^(?P<qty>\d+\s*[xX]\s*)?(?P<name>[A-Z][A-Z0-9 /&'\-\.]{2,}?)\s{2,}\$?(?P<price>\d+\.\d{2})\s*$"
    )
    .expect("Plain line pattern should be valid");
    static ref WAREHOUSE_LINE: Regex = Regex::new(
        r"^(?P<seq>\d+\s+)?[E1]?\s*\d{5,8}\s+(?P<name>[A-Z0-9][A-Z0-9/% ]{2,24}?)\s+\$?(?P<price>\d+[.,]\d{2})(?:\s+.*)?$"
    )
    .expect("Warehouse line pattern should be valid");
    static ref SEQUENTIAL_LINE: Regex = Regex::new(
        r"^(?P<seq>\d+)\s+(?P<name>[A-Z][A-Z0-9,\.' /&\-]{3,40}?)\s+(?:[A-Z]{1,3}\s+)?(?P<price>\d+[.,]\d{2})(?:\s.*)?$"
    )
    .expect("Sequential line pattern should be valid");
    static ref LEADING_NOISE: Regex =
        Regex::new(r"^[^A-Z0-9E]+").expect("Leading noise pattern should be valid");
    static ref MULTIPLIER_DIGITS: Regex =
        Regex::new(r"\d+").expect("Multiplier digits pattern should be valid");
}

/// Multiplier values above this are treated as formatting noise
pub const DEFAULT_MAX_MULTIPLIER: f64 = 20.0;

/// Item candidate read from a single line, before plausibility filtering
#[derive(Debug, Clone, PartialEq)]
pub struct LineCandidate {
    /// Name as printed (trimmed, upper-cased)
    pub name: String,
    /// Unit price
    pub price: f64,
    pub quantity: f64,
}

/// One receipt line layout
pub trait LineFormat: Send + Sync {
    /// Short identifier used in logs
    fn name(&self) -> &'static str;

    /// Parse an upper-cased, trimmed line
    fn parse_line(&self, line: &str) -> Option<LineCandidate>;
}

/// Drop punctuation and OCR artifacts in front of a warehouse / sequential line
fn strip_leading_noise(line: &str) -> std::borrow::Cow<'_, str> {
    LEADING_NOISE.replace(line, "")
}

/// Prices may be printed with a decimal comma
fn parse_price(caps: &Captures<'_>) -> Option<f64> {
    caps.name("price")?.as_str().replace(',', ".").parse().ok()
}

fn capture_name(caps: &Captures<'_>) -> Option<String> {
    let name = caps.name("name")?.as_str().trim();
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// `"NAME   $PRICE"`, `"2 x NAME   9.98"`
#[derive(Debug, Clone, Copy)]
pub struct PlainFormat {
    max_multiplier: f64,
}

impl Default for PlainFormat {
    fn default() -> Self {
        Self {
            max_multiplier: DEFAULT_MAX_MULTIPLIER,
        }
    }
}

impl PlainFormat {
    pub fn new(max_multiplier: f64) -> Self {
        Self { max_multiplier }
    }
}

impl LineFormat for PlainFormat {
    fn name(&self) -> &'static str {
        "plain"
    }

    fn parse_line(&self, line: &str) -> Option<LineCandidate> {
        // lines led by a SKU belong to the warehouse format
        if WAREHOUSE_LINE.is_match(&strip_leading_noise(line)) {
            return None;
        }
        let caps = PLAIN_LINE.captures(line)?;
        let name = capture_name(&caps)?;
        let price = parse_price(&caps)?;

        let quantity = caps
            .name("qty")
            .and_then(|m| MULTIPLIER_DIGITS.find(m.as_str()))
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .map(|qty| {
                if qty > self.max_multiplier {
                    trace!(multiplier = qty, "Multiplier above cap treated as noise");
                    1.0
                } else {
                    qty
                }
            })
            .unwrap_or(1.0);

        Some(LineCandidate {
            name,
            price,
            quantity,
        })
    }
}

/// Warehouse club lines: `"E 1136340 3LB ORG GALA   4.49"`, `"1585373 KS NAPKIN  11.99 A"`.
/// A leading integer is a line count printed by the till, not a quantity.
#[derive(Debug, Clone, Copy, Default)]
pub struct WarehouseFormat;

impl LineFormat for WarehouseFormat {
    fn name(&self) -> &'static str {
        "warehouse"
    }

    fn parse_line(&self, line: &str) -> Option<LineCandidate> {
        let stripped = strip_leading_noise(line);
        let caps = WAREHOUSE_LINE.captures(&stripped)?;
        Some(LineCandidate {
            name: capture_name(&caps)?,
            price: parse_price(&caps)?,
            quantity: 1.0,
        })
    }
}

/// Line-numbered receipts: `"3 HEB TX ROOTS CAMPARI TOMA FW   3.47"`.
/// The leading number is the line sequence and never a quantity.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialFormat;

impl LineFormat for SequentialFormat {
    fn name(&self) -> &'static str {
        "sequential"
    }

    fn parse_line(&self, line: &str) -> Option<LineCandidate> {
        let stripped = strip_leading_noise(line);
        let caps = SEQUENTIAL_LINE.captures(&stripped)?;
        Some(LineCandidate {
            name: capture_name(&caps)?,
            price: parse_price(&caps)?,
            quantity: 1.0,
        })
    }
}

/// Formats in the order they are tried
pub fn default_formats(max_multiplier: f64) -> Vec<Box<dyn LineFormat>> {
    vec![
        Box::new(PlainFormat::new(max_multiplier)),
        Box::new(WarehouseFormat),
        Box::new(SequentialFormat),
    ]
}
