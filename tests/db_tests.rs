use anyhow::{Context, Result};
use sqlx::PgPool;
use std::env;
use tabulate::db::*;
use tabulate::mapping_store::{MappingSource, MappingStore, MappingUpsert};
use tabulate::normalize_key;

/// Helper macro to skip tests when database is not available
macro_rules! skip_if_no_db {
    ($test_fn:expr) => {
        match setup_test_db().await {
            Ok(pool) => $test_fn(&pool).await,
            Err(_) => {
                eprintln!("Skipping test: Database not available");
                Ok(())
            }
        }
    };
}

async fn setup_test_db() -> Result<PgPool> {
    let database_url = match env::var("DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("Skipping database tests: DATABASE_URL not set");
            return Err(anyhow::anyhow!("Test database not configured"));
        }
    };

    let pool = PgPool::connect(&database_url)
        .await
        .context("Failed to connect to test database")?;

    init_database_schema(&pool).await?;

    Ok(pool)
}

/// Item name whose key no other test (or earlier run) uses.
/// Keys drop digits, so the nanosecond stamp is spelled with letters.
fn unique_name(base: &str) -> String {
    let stamp: String = chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or_default()
        .to_string()
        .chars()
        .map(|d| (b'a' + d.to_digit(10).unwrap_or(0) as u8) as char)
        .collect();
    format!("{} {}", base, stamp)
}

#[tokio::test]
async fn test_schema_seeds_vocabulary() -> Result<()> {
    skip_if_no_db!(test_schema_seeds_vocabulary_impl)
}

async fn test_schema_seeds_vocabulary_impl(pool: &PgPool) -> Result<()> {
    // running twice must not duplicate anything
    init_database_schema(pool).await?;

    let categories = list_active_categories(pool).await?;
    assert!(categories.iter().any(|c| c == "Other"));

    let milk = get_mapping(pool, "milk").await?.expect("seed mapping present");
    assert_eq!(milk.source, MappingSource::Manual);

    Ok(())
}

#[tokio::test]
async fn test_priority_rules_in_sql() -> Result<()> {
    skip_if_no_db!(test_priority_rules_in_sql_impl)
}

async fn test_priority_rules_in_sql_impl(pool: &PgPool) -> Result<()> {
    let name = unique_name("coconut milk");
    let key = normalize_key(&name);

    let ai = MappingUpsert::new(&name, "Beverages", MappingSource::Ai);
    let first = upsert_mapping(pool, &ai).await?;
    assert_eq!(first.times_seen, 1);

    let manual =
        upsert_mapping(pool, &MappingUpsert::new(&name, "Pantry", MappingSource::Manual)).await?;
    assert_eq!(manual.category, "Pantry");
    assert_eq!(manual.source, MappingSource::Manual);

    let ai_again = upsert_mapping(pool, &ai).await?;
    assert_eq!(ai_again.category, "Pantry");
    assert_eq!(ai_again.source, MappingSource::Manual);
    assert_eq!(ai_again.times_seen, 3);
    assert!(ai_again.last_seen >= first.last_seen);

    let stored = get_mapping(pool, &key).await?.expect("mapping stored");
    assert_eq!(stored, ai_again);

    Ok(())
}

#[tokio::test]
async fn test_display_name_only_replaced_when_explicit() -> Result<()> {
    skip_if_no_db!(test_display_name_only_replaced_when_explicit_impl)
}

async fn test_display_name_only_replaced_when_explicit_impl(pool: &PgPool) -> Result<()> {
    let name = unique_name("ks steakstrip");

    let first =
        upsert_mapping(pool, &MappingUpsert::new(&name, "Snacks", MappingSource::Ai)).await?;
    let lowercase = MappingUpsert::new(&name.to_lowercase(), "Snacks", MappingSource::Ai);
    let second = upsert_mapping(pool, &lowercase).await?;
    assert_eq!(second.display_name, first.display_name);

    let third = upsert_mapping(
        pool,
        &MappingUpsert::new(&name, "Snacks", MappingSource::Ai).with_display_name("Steak Strips"),
    )
    .await?;
    assert_eq!(third.display_name, "Steak Strips");

    Ok(())
}

#[tokio::test]
async fn test_store_batch_and_category_filter() -> Result<()> {
    skip_if_no_db!(test_store_batch_and_category_filter_impl)
}

async fn test_store_batch_and_category_filter_impl(pool: &PgPool) -> Result<()> {
    let store = PgMappingStore::new(pool.clone());
    let category = unique_name("Seasonal");
    set_category_enabled(pool, &category, true).await?;

    let names = [unique_name("pumpkin pie"), unique_name("eggnog")];
    let upserts: Vec<MappingUpsert> = names
        .iter()
        .map(|n| MappingUpsert::new(n, category.clone(), MappingSource::Manual))
        .collect();
    let written = store.upsert_batch(&upserts).await?;
    assert_eq!(written.len(), 2);

    let active = store.list_active_categories().await?;
    assert_eq!(active.last(), Some(&category));
    let mappings = store.load_mappings(&active).await?;
    assert_eq!(mappings.get(&normalize_key(&names[0])), Some(&category));

    set_category_enabled(pool, &category, false).await?;
    let active = store.list_active_categories().await?;
    assert!(!active.contains(&category));
    let mappings = store.load_mappings(&active).await?;
    assert!(!mappings.contains_key(&normalize_key(&names[1])));

    Ok(())
}

#[tokio::test]
async fn test_store_rejects_empty_key() -> Result<()> {
    skip_if_no_db!(test_store_rejects_empty_key_impl)
}

async fn test_store_rejects_empty_key_impl(pool: &PgPool) -> Result<()> {
    let store = PgMappingStore::new(pool.clone());
    let result = store
        .upsert_mapping(&MappingUpsert::new("12 34", "Other", MappingSource::Ai))
        .await;
    assert!(result.is_err());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_upserts_are_atomic() -> Result<()> {
    skip_if_no_db!(test_concurrent_upserts_are_atomic_impl)
}

async fn test_concurrent_upserts_are_atomic_impl(pool: &PgPool) -> Result<()> {
    const WRITERS: usize = 50;
    let name = unique_name("oat milk");

    let handles: Vec<_> = (0..WRITERS)
        .map(|i| {
            let store = PgMappingStore::new(pool.clone());
            let upsert = if i == WRITERS / 2 {
                MappingUpsert::new(&name, "Dairy & Eggs", MappingSource::Manual)
            } else {
                MappingUpsert::new(&name, "Beverages", MappingSource::Ai)
            };
            tokio::spawn(async move { store.upsert_mapping(&upsert).await })
        })
        .collect();

    for handle in handles {
        handle.await.context("Upsert task panicked")??;
    }

    let stored = get_mapping(pool, &normalize_key(&name))
        .await?
        .context("mapping stored")?;
    assert_eq!(stored.times_seen, WRITERS as i64);
    assert_eq!(stored.category, "Dairy & Eggs");
    assert_eq!(stored.source, MappingSource::Manual);

    Ok(())
}
