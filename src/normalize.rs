//! # Key Normalization
//!
//! Turns an item name into the lookup key used by the mapping store.
//! OCR spacing, casing and trailing pack sizes all collapse onto one key,
//! e.g. `"KS Steakstrip"` and `"KSSteakstrip"` both become `"kssteakstrip"`.

use lazy_static::lazy_static;
use regex::Regex;

/// Unit and pack-size tokens stripped when they directly follow a number
pub const UNIT_SUFFIXES: &[&str] = &[
    "oz", "lb", "kg", "g", "ml", "l", "ct", "pk", "pack", "count", "fl oz",
];

fn build_unit_pattern() -> String {
    let units: Vec<String> = UNIT_SUFFIXES.iter().map(|u| regex::escape(u)).collect();
    format!(r"\d+(?:\.\d+)?\s*(?:{})\b", units.join("|"))
}

lazy_static! {
    static ref UNIT_QUANTITY: Regex =
        Regex::new(&build_unit_pattern()).expect("Unit suffix pattern should be valid");
    static ref STANDALONE_NUMBER: Regex =
        Regex::new(r"\b\d+\b").expect("Standalone number pattern should be valid");
}

/// Produce the stable lookup key for an item name.
///
/// Letters only, lowercase, no spaces. Names without any letters (e.g.
/// `"1/2 & 1/2"`) keep their digits when the original contains a symbol,
/// so the key is only empty when the input carries nothing identifying.
pub fn normalize_key(name: &str) -> String {
    let lowered = name.to_lowercase();
    let without_units = UNIT_QUANTITY.replace_all(&lowered, "");
    let without_numbers = STANDALONE_NUMBER.replace_all(&without_units, "");

    let letters: String = without_numbers
        .chars()
        .filter(|c| c.is_ascii_lowercase())
        .collect();
    if !letters.is_empty() {
        return letters;
    }

    let has_symbol = lowered
        .chars()
        .any(|c| !c.is_ascii_lowercase() && !c.is_ascii_digit() && !c.is_whitespace());
    if has_symbol {
        return lowered
            .chars()
            .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            .collect();
    }

    String::new()
}

/// Title-case a name: first letter of every alphabetic run upper-cased, rest lower-cased
pub fn title_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_alpha = false;
    for c in name.chars() {
        if c.is_alphabetic() {
            if prev_alpha {
                out.extend(c.to_lowercase());
            } else {
                out.extend(c.to_uppercase());
            }
            prev_alpha = true;
        } else {
            out.push(c);
            prev_alpha = false;
        }
    }
    out
}

/// Default display form stored next to a mapping key
pub fn display_name(name: &str) -> String {
    title_case(name.trim())
}
