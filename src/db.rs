//! PostgreSQL persistence for learned mappings and the category vocabulary.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{PgExecutor, Row};
use tracing::{debug, info, Instrument};

use crate::config::DatabaseConfig;
use crate::errors::{error_logging, AppError, AppResult};
use crate::mapping_store::{
    builtin_categories, MappingEntry, MappingSource, MappingStore, MappingUpsert,
    BUILTIN_CATEGORIES, SEED_MAPPINGS,
};
use crate::normalize::display_name;
use crate::observability::{db_span, record_db_metrics};

const UPSERT_MAPPING_SQL: &str = "
    INSERT INTO item_mappings (normalized_key, display_name, category, source, times_seen, last_seen)
    VALUES ($1, $2, $3, $4, 1, CURRENT_TIMESTAMP)
    ON CONFLICT (normalized_key) DO UPDATE SET
        category = CASE
            WHEN EXCLUDED.source = 'manual' THEN EXCLUDED.category
            WHEN item_mappings.source = 'manual' THEN item_mappings.category
            ELSE EXCLUDED.category
        END,
        source = CASE
            WHEN EXCLUDED.source = 'manual' OR item_mappings.source = 'manual' THEN 'manual'
            ELSE EXCLUDED.source
        END,
        display_name = CASE
            WHEN $5 THEN EXCLUDED.display_name
            ELSE item_mappings.display_name
        END,
        times_seen = item_mappings.times_seen + 1,
        last_seen = CURRENT_TIMESTAMP
    RETURNING normalized_key, display_name, category, source, times_seen, last_seen";

/// Open a connection pool sized from the configuration
pub async fn connect(config: &DatabaseConfig) -> Result<PgPool> {
    let url = config
        .url
        .as_deref()
        .context("DATABASE_URL is not configured")?;

    info!(
        max_connections = config.max_connections,
        "Initializing database connection"
    );

    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .connect(url)
        .await
        .context("Failed to connect to PostgreSQL")
}

/// Initialize the database schema and seed the builtin vocabulary
pub async fn init_database_schema(pool: &PgPool) -> Result<()> {
    info!("Initializing database schema");

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS categories (
            id BIGSERIAL PRIMARY KEY,
            name TEXT UNIQUE NOT NULL,
            is_disabled BOOLEAN NOT NULL DEFAULT FALSE,
            sort_order INTEGER NOT NULL DEFAULT 0
        )",
    )
    .execute(pool)
    .await
    .context("Failed to create categories table")?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS item_mappings (
            id BIGSERIAL PRIMARY KEY,
            normalized_key TEXT UNIQUE NOT NULL,
            display_name TEXT NOT NULL,
            category TEXT NOT NULL,
            source TEXT NOT NULL DEFAULT 'ai' CHECK (source IN ('manual', 'ai')),
            times_seen BIGINT NOT NULL DEFAULT 1,
            last_seen TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
    )
    .execute(pool)
    .await
    .context("Failed to create item_mappings table")?;

    sqlx::query("CREATE INDEX IF NOT EXISTS item_mappings_category_idx ON item_mappings(category)")
        .execute(pool)
        .await
        .context("Failed to create item_mappings category index")?;

    for (idx, name) in BUILTIN_CATEGORIES.iter().enumerate() {
        sqlx::query(
            "INSERT INTO categories (name, sort_order) VALUES ($1, $2) ON CONFLICT (name) DO NOTHING",
        )
        .bind(*name)
        .bind(idx as i32)
        .execute(pool)
        .await
        .context("Failed to seed categories")?;
    }

    for (key, category) in SEED_MAPPINGS {
        sqlx::query(
            "INSERT INTO item_mappings (normalized_key, display_name, category, source)
             VALUES ($1, $2, $3, 'manual')
             ON CONFLICT (normalized_key) DO NOTHING",
        )
        .bind(*key)
        .bind(display_name(key))
        .bind(*category)
        .execute(pool)
        .await
        .context("Failed to seed item mappings")?;
    }

    info!("Database schema initialized successfully");
    Ok(())
}

fn entry_from_row(row: &PgRow) -> Result<MappingEntry> {
    let source: String = row.try_get("source")?;
    Ok(MappingEntry {
        normalized_key: row.try_get("normalized_key")?,
        display_name: row.try_get("display_name")?,
        category: row.try_get("category")?,
        source: source.parse::<MappingSource>()?,
        times_seen: row.try_get("times_seen")?,
        last_seen: row.try_get::<DateTime<Utc>, _>("last_seen")?,
    })
}

/// Key → category for mappings whose category is active
pub async fn load_mappings(
    pool: &PgPool,
    active_categories: &[String],
) -> Result<HashMap<String, String>> {
    debug!(categories = active_categories.len(), "Loading learned mappings");

    let rows = sqlx::query(
        "SELECT normalized_key, category FROM item_mappings WHERE category = ANY($1)",
    )
    .bind(active_categories)
    .fetch_all(pool)
    .await
    .context("Failed to load item mappings")?;

    let mut mappings = HashMap::with_capacity(rows.len());
    for row in rows {
        mappings.insert(row.try_get("normalized_key")?, row.try_get("category")?);
    }
    debug!(count = mappings.len(), "Learned mappings loaded");
    Ok(mappings)
}

/// Single-statement conditional upsert
pub async fn upsert_mapping<'e, E>(executor: E, upsert: &MappingUpsert) -> Result<MappingEntry>
where
    E: PgExecutor<'e>,
{
    let row = sqlx::query(UPSERT_MAPPING_SQL)
        .bind(&upsert.normalized_key)
        .bind(&upsert.display_name)
        .bind(&upsert.category)
        .bind(upsert.source.as_str())
        .bind(upsert.display_name_explicit)
        .fetch_one(executor)
        .await
        .with_context(|| format!("Failed to upsert mapping '{}'", upsert.normalized_key))?;

    entry_from_row(&row)
}

/// All upserts in one transaction
pub async fn upsert_batch(pool: &PgPool, upserts: &[MappingUpsert]) -> Result<Vec<MappingEntry>> {
    let mut tx = pool.begin().await.context("Failed to begin transaction")?;

    let mut written = Vec::with_capacity(upserts.len());
    for upsert in upserts {
        written.push(upsert_mapping(&mut *tx, upsert).await?);
    }

    tx.commit().await.context("Failed to commit mapping batch")?;
    debug!(count = written.len(), "Mapping batch committed");
    Ok(written)
}

/// Enabled category names by sort order; builtin list when none exist
pub async fn list_active_categories(pool: &PgPool) -> Result<Vec<String>> {
    let rows = sqlx::query(
        "SELECT name FROM categories WHERE is_disabled = FALSE ORDER BY sort_order, name",
    )
    .fetch_all(pool)
    .await
    .context("Failed to list categories")?;

    if rows.is_empty() {
        return Ok(builtin_categories());
    }
    rows.iter()
        .map(|row| row.try_get::<String, _>("name").map_err(Into::into))
        .collect()
}

/// Enable or disable a category, inserting it when missing
pub async fn set_category_enabled(pool: &PgPool, name: &str, enabled: bool) -> Result<()> {
    sqlx::query(
        "INSERT INTO categories (name, is_disabled, sort_order)
         VALUES ($1, $2, (SELECT COALESCE(MAX(sort_order), -1) + 1 FROM categories))
         ON CONFLICT (name) DO UPDATE SET is_disabled = EXCLUDED.is_disabled",
    )
    .bind(name)
    .bind(!enabled)
    .execute(pool)
    .await
    .with_context(|| format!("Failed to update category '{}'", name))?;
    Ok(())
}

/// Read one mapping by key
pub async fn get_mapping(pool: &PgPool, key: &str) -> Result<Option<MappingEntry>> {
    let row = sqlx::query(
        "SELECT normalized_key, display_name, category, source, times_seen, last_seen
         FROM item_mappings WHERE normalized_key = $1",
    )
    .bind(key)
    .fetch_optional(pool)
    .await
    .context("Failed to read item mapping")?;

    row.as_ref().map(entry_from_row).transpose()
}

/// [`MappingStore`] backed by PostgreSQL
#[derive(Debug, Clone)]
pub struct PgMappingStore {
    pool: PgPool,
}

impl PgMappingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn store_error(err: anyhow::Error, operation: &str, key_count: Option<usize>) -> AppError {
    error_logging::log_database_error(&format!("{:#}", err), operation, key_count);
    match err.downcast::<AppError>() {
        Ok(app) => app,
        Err(err) => AppError::Database(format!("{:#}", err)),
    }
}

impl MappingStore for PgMappingStore {
    async fn load_mappings(
        &self,
        active_categories: &[String],
    ) -> AppResult<HashMap<String, String>> {
        let start = Instant::now();
        let mappings = load_mappings(&self.pool, active_categories)
            .instrument(db_span("load_mappings", "item_mappings"))
            .await
            .map_err(|e| store_error(e, "load_mappings", None))?;
        record_db_metrics("load_mappings", start.elapsed(), mappings.len());
        Ok(mappings)
    }

    async fn upsert_mapping(&self, upsert: &MappingUpsert) -> AppResult<MappingEntry> {
        if upsert.normalized_key.is_empty() {
            return Err(AppError::Validation(
                "Cannot store a mapping with an empty normalized key".to_string(),
            ));
        }
        let start = Instant::now();
        let entry = upsert_mapping(&self.pool, upsert)
            .instrument(db_span("upsert_mapping", "item_mappings"))
            .await
            .map_err(|e| store_error(e, "upsert_mapping", Some(1)))?;
        record_db_metrics("upsert_mapping", start.elapsed(), 1);
        Ok(entry)
    }

    async fn upsert_batch(&self, upserts: &[MappingUpsert]) -> AppResult<Vec<MappingEntry>> {
        if upserts.iter().any(|u| u.normalized_key.is_empty()) {
            return Err(AppError::Validation(
                "Cannot store a mapping with an empty normalized key".to_string(),
            ));
        }
        let start = Instant::now();
        let written = upsert_batch(&self.pool, upserts)
            .instrument(db_span("upsert_batch", "item_mappings"))
            .await
            .map_err(|e| store_error(e, "upsert_batch", Some(upserts.len())))?;
        record_db_metrics("upsert_batch", start.elapsed(), written.len());
        Ok(written)
    }

    async fn list_active_categories(&self) -> AppResult<Vec<String>> {
        let start = Instant::now();
        let categories = list_active_categories(&self.pool)
            .instrument(db_span("list_active_categories", "categories"))
            .await
            .map_err(|e| store_error(e, "list_active_categories", None))?;
        record_db_metrics("list_active_categories", start.elapsed(), categories.len());
        Ok(categories)
    }
}
