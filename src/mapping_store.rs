//! # Mapping Store
//!
//! The learned `normalized_key → category` memory and the category
//! vocabulary. Writes follow a two-level source priority, `manual > ai`:
//! an AI write never downgrades a human correction.
//!
//! [`InMemoryMappingStore`] keeps everything in process; the PostgreSQL
//! implementation lives in [`crate::db`].

use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{AppError, AppResult};
use crate::normalize::{display_name, normalize_key};

/// Default category vocabulary, in display order
pub const BUILTIN_CATEGORIES: &[&str] = &[
    "Produce",
    "Meat & Seafood",
    "Dairy & Eggs",
    "Snacks",
    "Beverages",
    "Pantry",
    "Frozen",
    "Household",
    "Other",
];

/// Seed `normalized_key → category` pairs installed as manual mappings
pub const SEED_MAPPINGS: &[(&str, &str)] = &[
    ("milk", "Dairy & Eggs"),
    ("eggs", "Dairy & Eggs"),
    ("butter", "Dairy & Eggs"),
    ("cheese", "Dairy & Eggs"),
    ("yogurt", "Dairy & Eggs"),
    ("bananas", "Produce"),
    ("apples", "Produce"),
    ("bread", "Pantry"),
    ("pasta", "Pantry"),
    ("rice", "Pantry"),
    ("chicken", "Meat & Seafood"),
    ("groundbeef", "Meat & Seafood"),
    ("salmon", "Meat & Seafood"),
    ("orangejuice", "Beverages"),
    ("soda", "Beverages"),
    ("water", "Beverages"),
    ("chips", "Snacks"),
    ("crackers", "Snacks"),
    ("icecream", "Frozen"),
    ("frozenpizza", "Frozen"),
    ("soap", "Household"),
    ("laundry", "Household"),
    ("papertowels", "Household"),
];

/// Origin of a learned mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingSource {
    Manual,
    Ai,
}

impl MappingSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            MappingSource::Manual => "manual",
            MappingSource::Ai => "ai",
        }
    }
}

impl FromStr for MappingSource {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(MappingSource::Manual),
            "ai" => Ok(MappingSource::Ai),
            other => Err(AppError::Validation(format!(
                "Unknown mapping source: '{}'",
                other
            ))),
        }
    }
}

/// One row of learned memory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingEntry {
    pub normalized_key: String,
    pub display_name: String,
    pub category: String,
    pub source: MappingSource,
    pub times_seen: i64,
    pub last_seen: DateTime<Utc>,
}

/// A pending write to the mapping store
#[derive(Debug, Clone, PartialEq)]
pub struct MappingUpsert {
    pub normalized_key: String,
    pub category: String,
    pub source: MappingSource,
    pub display_name: String,
    /// Only an explicit display name replaces the stored one on update
    pub display_name_explicit: bool,
}

impl MappingUpsert {
    /// Key and default display name are derived from the item name
    pub fn new(raw_name: &str, category: impl Into<String>, source: MappingSource) -> Self {
        Self {
            normalized_key: normalize_key(raw_name),
            category: category.into(),
            source,
            display_name: display_name(raw_name),
            display_name_explicit: false,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self.display_name_explicit = true;
        self
    }

    fn validate(&self) -> AppResult<()> {
        if self.normalized_key.is_empty() {
            return Err(AppError::Validation(
                "Cannot store a mapping with an empty normalized key".to_string(),
            ));
        }
        Ok(())
    }
}

/// Apply the source-priority rule to an existing row.
///
/// `manual` writes always win; an `ai` write over a `manual` row keeps the
/// manual category and source. Every write bumps `times_seen`.
pub fn resolve_upsert(
    existing: Option<&MappingEntry>,
    upsert: &MappingUpsert,
    now: DateTime<Utc>,
) -> MappingEntry {
    let Some(existing) = existing else {
        return MappingEntry {
            normalized_key: upsert.normalized_key.clone(),
            display_name: upsert.display_name.clone(),
            category: upsert.category.clone(),
            source: upsert.source,
            times_seen: 1,
            last_seen: now,
        };
    };

    let keep_manual =
        upsert.source == MappingSource::Ai && existing.source == MappingSource::Manual;
    let (category, source) = if keep_manual {
        (existing.category.clone(), MappingSource::Manual)
    } else {
        (upsert.category.clone(), upsert.source)
    };

    MappingEntry {
        normalized_key: existing.normalized_key.clone(),
        display_name: if upsert.display_name_explicit {
            upsert.display_name.clone()
        } else {
            existing.display_name.clone()
        },
        category,
        source,
        times_seen: existing.times_seen + 1,
        last_seen: now,
    }
}

/// Member of the category vocabulary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    pub enabled: bool,
    pub sort_order: i32,
}

/// Persistence for learned mappings and the category vocabulary
pub trait MappingStore: Send + Sync {
    /// Every learned mapping whose category is in `active_categories`
    fn load_mappings(
        &self,
        active_categories: &[String],
    ) -> impl Future<Output = AppResult<HashMap<String, String>>> + Send;

    /// Atomic insert-or-update under the source-priority rule
    fn upsert_mapping(
        &self,
        upsert: &MappingUpsert,
    ) -> impl Future<Output = AppResult<MappingEntry>> + Send;

    /// Apply every upsert or none of them
    fn upsert_batch(
        &self,
        upserts: &[MappingUpsert],
    ) -> impl Future<Output = AppResult<Vec<MappingEntry>>> + Send;

    /// Enabled category names in display order
    fn list_active_categories(&self) -> impl Future<Output = AppResult<Vec<String>>> + Send;
}

/// Builtin vocabulary as owned strings
pub fn builtin_categories() -> Vec<String> {
    BUILTIN_CATEGORIES.iter().map(|c| c.to_string()).collect()
}

/// Process-local mapping store
#[derive(Debug, Default)]
pub struct InMemoryMappingStore {
    mappings: Mutex<HashMap<String, MappingEntry>>,
    categories: Mutex<Vec<Category>>,
}

impl InMemoryMappingStore {
    /// Empty store; the category list falls back to the builtin vocabulary
    pub fn new() -> Self {
        Self::default()
    }

    /// Builtin categories and seed mappings
    pub fn with_builtin() -> Self {
        let now = Utc::now();
        let categories = BUILTIN_CATEGORIES
            .iter()
            .enumerate()
            .map(|(idx, name)| Category {
                name: name.to_string(),
                enabled: true,
                sort_order: idx as i32,
            })
            .collect();
        let mappings = SEED_MAPPINGS
            .iter()
            .map(|(key, category)| {
                let entry = MappingEntry {
                    normalized_key: key.to_string(),
                    display_name: display_name(key),
                    category: category.to_string(),
                    source: MappingSource::Manual,
                    times_seen: 1,
                    last_seen: now,
                };
                (key.to_string(), entry)
            })
            .collect();
        Self {
            mappings: Mutex::new(mappings),
            categories: Mutex::new(categories),
        }
    }

    /// Add a category or update an existing one
    pub fn set_category(&self, name: &str, enabled: bool) {
        let mut categories = self.categories.lock();
        match categories.iter_mut().find(|c| c.name == name) {
            Some(category) => category.enabled = enabled,
            None => {
                let sort_order = categories.len() as i32;
                categories.push(Category {
                    name: name.to_string(),
                    enabled,
                    sort_order,
                });
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<MappingEntry> {
        self.mappings.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.mappings.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.lock().is_empty()
    }
}

impl MappingStore for InMemoryMappingStore {
    async fn load_mappings(
        &self,
        active_categories: &[String],
    ) -> AppResult<HashMap<String, String>> {
        let mappings = self.mappings.lock();
        Ok(mappings
            .values()
            .filter(|entry| active_categories.iter().any(|c| *c == entry.category))
            .map(|entry| (entry.normalized_key.clone(), entry.category.clone()))
            .collect())
    }

    async fn upsert_mapping(&self, upsert: &MappingUpsert) -> AppResult<MappingEntry> {
        upsert.validate()?;
        let mut mappings = self.mappings.lock();
        let entry = resolve_upsert(mappings.get(&upsert.normalized_key), upsert, Utc::now());
        mappings.insert(entry.normalized_key.clone(), entry.clone());
        debug!(
            key = %entry.normalized_key,
            category = %entry.category,
            source = entry.source.as_str(),
            "Mapping upserted"
        );
        Ok(entry)
    }

    async fn upsert_batch(&self, upserts: &[MappingUpsert]) -> AppResult<Vec<MappingEntry>> {
        for upsert in upserts {
            upsert.validate()?;
        }
        let now = Utc::now();
        let mut mappings = self.mappings.lock();
        let mut written = Vec::with_capacity(upserts.len());
        for upsert in upserts {
            let entry = resolve_upsert(mappings.get(&upsert.normalized_key), upsert, now);
            mappings.insert(entry.normalized_key.clone(), entry.clone());
            written.push(entry);
        }
        debug!(count = written.len(), "Mapping batch committed");
        Ok(written)
    }

    async fn list_active_categories(&self) -> AppResult<Vec<String>> {
        let categories = self.categories.lock();
        if categories.is_empty() {
            return Ok(builtin_categories());
        }
        let mut active: Vec<&Category> = categories.iter().filter(|c| c.enabled).collect();
        active.sort_by(|a, b| a.sort_order.cmp(&b.sort_order).then_with(|| a.name.cmp(&b.name)));
        Ok(active.into_iter().map(|c| c.name.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(category: &str, source: MappingSource) -> MappingEntry {
        MappingEntry {
            normalized_key: "milk".to_string(),
            display_name: "Milk".to_string(),
            category: category.to_string(),
            source,
            times_seen: 1,
            last_seen: Utc::now(),
        }
    }

    #[test]
    fn test_ai_never_downgrades_manual() {
        let existing = entry("Dairy & Eggs", MappingSource::Manual);
        let upsert = MappingUpsert::new("MILK", "Pantry", MappingSource::Ai);
        let resolved = resolve_upsert(Some(&existing), &upsert, Utc::now());
        assert_eq!(resolved.category, "Dairy & Eggs");
        assert_eq!(resolved.source, MappingSource::Manual);
        assert_eq!(resolved.times_seen, 2);
    }

    #[test]
    fn test_manual_overrides_everything() {
        let existing = entry("Dairy & Eggs", MappingSource::Manual);
        let upsert = MappingUpsert::new("MILK", "Beverages", MappingSource::Manual);
        let resolved = resolve_upsert(Some(&existing), &upsert, Utc::now());
        assert_eq!(resolved.category, "Beverages");
        assert_eq!(resolved.source, MappingSource::Manual);
    }

    #[test]
    fn test_ai_updates_ai() {
        let existing = entry("Beverages", MappingSource::Ai);
        let upsert = MappingUpsert::new("MILK", "Other", MappingSource::Ai);
        let resolved = resolve_upsert(Some(&existing), &upsert, Utc::now());
        assert_eq!(resolved.category, "Other");
        assert_eq!(resolved.source, MappingSource::Ai);
    }

    #[test]
    fn test_display_name_only_replaced_when_explicit() {
        let existing = entry("Dairy & Eggs", MappingSource::Ai);
        let implicit = MappingUpsert::new("MILK 1 GAL", "Dairy & Eggs", MappingSource::Ai);
        assert_eq!(
            resolve_upsert(Some(&existing), &implicit, Utc::now()).display_name,
            "Milk"
        );
        let explicit = implicit.with_display_name("Whole Milk");
        assert_eq!(
            resolve_upsert(Some(&existing), &explicit, Utc::now()).display_name,
            "Whole Milk"
        );
    }

    #[test]
    fn test_upsert_defaults() {
        let upsert = MappingUpsert::new("  KS STEAKSTRIP ", "Meat & Seafood", MappingSource::Ai);
        assert_eq!(upsert.normalized_key, "kssteakstrip");
        assert_eq!(upsert.display_name, "Ks Steakstrip");
        let created = resolve_upsert(None, &upsert, Utc::now());
        assert_eq!(created.times_seen, 1);
    }

    #[test]
    fn test_source_parsing() {
        assert_eq!("manual".parse::<MappingSource>().ok(), Some(MappingSource::Manual));
        assert_eq!("ai".parse::<MappingSource>().ok(), Some(MappingSource::Ai));
        assert!("learned".parse::<MappingSource>().is_err());
    }

    #[tokio::test]
    async fn test_in_memory_load_filters_disabled_categories() {
        let store = InMemoryMappingStore::with_builtin();
        store.set_category("Household", false);
        let active = store.list_active_categories().await.unwrap();
        assert!(!active.contains(&"Household".to_string()));

        let mappings = store.load_mappings(&active).await.unwrap();
        assert_eq!(mappings.get("milk").map(String::as_str), Some("Dairy & Eggs"));
        assert!(!mappings.contains_key("soap"));
        // excluded from matching, not deleted
        assert!(store.get("soap").is_some());
    }

    #[tokio::test]
    async fn test_in_memory_batch_is_all_or_nothing() {
        let store = InMemoryMappingStore::new();
        let batch = vec![
            MappingUpsert::new("BREAD", "Pantry", MappingSource::Ai),
            MappingUpsert::new("12345", "Other", MappingSource::Ai),
        ];
        assert!(store.upsert_batch(&batch).await.is_err());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_empty_store_lists_builtin_categories() {
        let store = InMemoryMappingStore::new();
        assert_eq!(
            store.list_active_categories().await.unwrap(),
            builtin_categories()
        );
    }
}
