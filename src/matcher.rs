//! # Fuzzy Mapping Matcher
//!
//! Resolves a normalized key against the learned key → category table:
//! exact match first, then the longest learned key in a substring
//! relationship with the query whose length is comparable to it.

use std::collections::HashMap;

use tracing::trace;

/// Shorter/longer key length ratio below which a substring hit is rejected
pub const DEFAULT_MIN_LENGTH_RATIO: f64 = 0.5;

/// Learned-mapping matcher
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FuzzyMatcher {
    min_length_ratio: f64,
}

impl Default for FuzzyMatcher {
    fn default() -> Self {
        Self {
            min_length_ratio: DEFAULT_MIN_LENGTH_RATIO,
        }
    }
}

impl FuzzyMatcher {
    pub fn new(min_length_ratio: f64) -> Self {
        Self { min_length_ratio }
    }

    pub fn min_length_ratio(&self) -> f64 {
        self.min_length_ratio
    }

    /// Find the best category for `key`, or `None` when the item is unknown.
    ///
    /// A short generic seed such as `"milk"` does not capture a long
    /// unrelated key such as `"tasteofthaicoconutmilk"` (4/22 < 0.5), while
    /// `"coconutmilk"` still matches `"organiccoconutmilk"`.
    pub fn find_best_match<'a>(
        &self,
        key: &str,
        mappings: &'a HashMap<String, String>,
    ) -> Option<&'a str> {
        if key.is_empty() {
            return None;
        }
        if let Some(category) = mappings.get(key) {
            return Some(category.as_str());
        }

        let mut best: Option<(&'a str, &'a str)> = None;
        for (learned, category) in mappings {
            if learned.is_empty() {
                continue;
            }
            if !learned.contains(key) && !key.contains(learned.as_str()) {
                continue;
            }

            let shorter = learned.len().min(key.len()) as f64;
            let longer = learned.len().max(key.len()) as f64;
            if shorter / longer < self.min_length_ratio {
                trace!(
                    query = %key,
                    learned = %learned,
                    "Substring candidate rejected by length ratio"
                );
                continue;
            }

            let better = match best {
                None => true,
                Some((best_key, _)) => {
                    learned.len() > best_key.len()
                        || (learned.len() == best_key.len() && learned.as_str() < best_key)
                }
            };
            if better {
                best = Some((learned.as_str(), category.as_str()));
            }
        }

        best.map(|(_, category)| category)
    }
}

/// Match with the default length ratio
pub fn find_best_match<'a>(key: &str, mappings: &'a HashMap<String, String>) -> Option<&'a str> {
    FuzzyMatcher::default().find_best_match(key, mappings)
}
