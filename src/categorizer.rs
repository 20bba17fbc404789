//! # Categorization Pipeline
//!
//! Two stages: learned mappings first (exact then fuzzy on the raw-name
//! key), then one batched classification oracle call for whatever is
//! left. Nothing is persisted while categorizing; approved results are
//! written back through [`commit_approved_mappings`].

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::classifier::{
    ClassificationOracle, ClassificationRequest, ClassificationResult, DEFAULT_AI_CONFIDENCE,
};
use crate::errors::{error_logging, AppError, AppResult};
use crate::mapping_store::{MappingEntry, MappingSource, MappingStore, MappingUpsert};
use crate::matcher::FuzzyMatcher;
use crate::normalize::{normalize_key, title_case};
use crate::observability::record_categorization_metrics;
use crate::receipt::{CategorizedItem, CategorySource, ItemInput, CATCH_ALL_CATEGORY};

/// Categorized items in input order
#[derive(Debug, Clone, PartialEq)]
pub struct CategorizationOutcome {
    pub items: Vec<CategorizedItem>,
    /// The oracle call failed and unresolved items fell back to the catch-all
    pub categorization_failed: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Categorizer {
    matcher: FuzzyMatcher,
}

impl Categorizer {
    pub fn new(matcher: FuzzyMatcher) -> Self {
        Self { matcher }
    }

    /// Assign a category to every item.
    ///
    /// `mappings` must already be filtered to `active_categories`.
    pub async fn categorize<C: ClassificationOracle>(
        &self,
        items: &[ItemInput],
        store_name: Option<&str>,
        mappings: &HashMap<String, String>,
        active_categories: &[String],
        oracle: &C,
    ) -> CategorizationOutcome {
        let mut results: Vec<(usize, CategorizedItem)> = Vec::with_capacity(items.len());
        let mut unknown: Vec<(usize, &ItemInput)> = Vec::new();

        // Stage 1: always keyed on raw_name
        for (position, item) in items.iter().enumerate() {
            let key = normalize_key(&item.raw_name);
            match self.matcher.find_best_match(&key, mappings) {
                Some(category) => {
                    debug!(
                        raw_name = %item.raw_name,
                        key = %key,
                        category = %category,
                        "Learned mapping hit"
                    );
                    results.push((
                        position,
                        CategorizedItem::from_input(item, category, CategorySource::Learned, 1.0),
                    ));
                }
                None => unknown.push((position, item)),
            }
        }
        let learned = results.len();

        let mut categorization_failed = false;
        if !unknown.is_empty() {
            let requests: Vec<ClassificationRequest> = unknown
                .iter()
                .map(|(_, item)| ClassificationRequest {
                    id: item.id,
                    name: item.oracle_name().to_string(),
                    store: store_name.map(str::to_string),
                })
                .collect();

            let answers: HashMap<u64, ClassificationResult> =
                match oracle.classify(&requests, active_categories).await {
                    Ok(answers) => {
                        let mut by_id = HashMap::with_capacity(answers.len());
                        for answer in answers {
                            by_id.entry(answer.id).or_insert(answer);
                        }
                        by_id
                    }
                    Err(err) => {
                        warn!(unresolved = unknown.len(), "Classification failed: {err}");
                        categorization_failed = true;
                        HashMap::new()
                    }
                };

            for (position, item) in unknown {
                let (category, confidence) =
                    resolve_answer(answers.get(&item.id), active_categories);
                results.push((
                    position,
                    CategorizedItem::from_input(item, category, CategorySource::Ai, confidence),
                ));
            }
        }

        let ai = results.len() - learned;
        record_categorization_metrics(learned, ai, categorization_failed);
        info!(learned, ai, categorization_failed, "Items categorized");

        results.sort_by_key(|(position, _)| *position);
        CategorizationOutcome {
            items: results.into_iter().map(|(_, item)| item).collect(),
            categorization_failed,
        }
    }
}

/// Category and confidence for one oracle answer; anything outside the
/// active vocabulary becomes the catch-all at zero confidence
fn resolve_answer(
    answer: Option<&ClassificationResult>,
    active_categories: &[String],
) -> (String, f64) {
    let Some(answer) = answer else {
        return (CATCH_ALL_CATEGORY.to_string(), 0.0);
    };
    match answer.category.as_deref() {
        Some(category) if active_categories.iter().any(|c| c == category) => {
            let confidence = answer.confidence.unwrap_or(DEFAULT_AI_CONFIDENCE).clamp(0.0, 1.0);
            (category.to_string(), confidence)
        }
        other => {
            debug!(
                id = answer.id,
                category = ?other,
                "Oracle category outside the active vocabulary"
            );
            (CATCH_ALL_CATEGORY.to_string(), 0.0)
        }
    }
}

fn ensure_active(category: &str, active_categories: &[String], operation: &str) -> AppResult<()> {
    if active_categories.iter().any(|c| c == category) {
        return Ok(());
    }
    let err = AppError::Validation(format!("Unknown category: '{}'", category));
    error_logging::log_validation_error(&err, operation, "category", Some(category));
    Err(err)
}

/// Persist one mapping per approved item.
///
/// Every category is checked against the vocabulary before anything is
/// written. Items whose raw name normalizes to an empty key are skipped.
pub async fn commit_approved_mappings<S: MappingStore>(
    store: &S,
    items: &[CategorizedItem],
    active_categories: &[String],
) -> AppResult<Vec<MappingEntry>> {
    for item in items {
        ensure_active(&item.category, active_categories, "commit_approved_mappings")?;
    }

    let upserts: Vec<MappingUpsert> = items
        .iter()
        .filter_map(|item| {
            let source = match item.category_source {
                CategorySource::Manual => MappingSource::Manual,
                _ => MappingSource::Ai,
            };
            let upsert = MappingUpsert::new(&item.raw_name, item.category.clone(), source);
            if upsert.normalized_key.is_empty() {
                debug!(raw_name = %item.raw_name, "Skipping item without a usable key");
                return None;
            }
            let name = item
                .clean_name
                .as_deref()
                .filter(|n| !n.trim().is_empty())
                .unwrap_or(&item.raw_name);
            Some(upsert.with_display_name(title_case(name.trim())))
        })
        .collect();

    if upserts.is_empty() {
        return Ok(Vec::new());
    }

    let written = store.upsert_batch(&upserts).await?;
    info!(count = written.len(), "Approved mappings committed");
    Ok(written)
}

/// Replace an item's category with a human choice
pub fn apply_manual_correction(
    item: &mut CategorizedItem,
    category: &str,
    active_categories: &[String],
) -> AppResult<()> {
    ensure_active(category, active_categories, "apply_manual_correction")?;
    item.category = category.to_string();
    item.category_source = CategorySource::Manual;
    item.corrected = true;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active() -> Vec<String> {
        vec!["Produce".to_string(), "Dairy & Eggs".to_string(), "Other".to_string()]
    }

    #[test]
    fn test_resolve_answer_defaults_confidence() {
        let answer = ClassificationResult {
            id: 1,
            category: Some("Produce".to_string()),
            confidence: None,
        };
        assert_eq!(resolve_answer(Some(&answer), &active()), ("Produce".to_string(), 0.7));
    }

    #[test]
    fn test_resolve_answer_rejects_unknown_category() {
        let answer = ClassificationResult {
            id: 1,
            category: Some("Electronics".to_string()),
            confidence: Some(0.95),
        };
        assert_eq!(resolve_answer(Some(&answer), &active()), ("Other".to_string(), 0.0));
        assert_eq!(resolve_answer(None, &active()), ("Other".to_string(), 0.0));
    }

    #[test]
    fn test_manual_correction() {
        let input = ItemInput::new(4, "KS STEAKSTRIP");
        let mut item = CategorizedItem::from_input(&input, "Other", CategorySource::Ai, 0.0);

        let err = apply_manual_correction(&mut item, "Snacks", &active()).unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(item.category, "Other");
        assert!(!item.corrected);

        apply_manual_correction(&mut item, "Produce", &active()).unwrap();
        assert_eq!(item.category, "Produce");
        assert_eq!(item.category_source, CategorySource::Manual);
        assert!(item.corrected);
    }
}
