use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tabulate::classifier::AnthropicClassifier;
use tabulate::config::AppConfig;
use tabulate::db::{self, PgMappingStore};
use tabulate::mapping_store::{InMemoryMappingStore, MappingStore};
use tabulate::observability;
use tabulate::ocr;
use tabulate::oracle::MessagesClient;
use tabulate::pipeline::ReceiptProcessor;
use tabulate::vision::AnthropicVisionOracle;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "tabulate", about = "Parse grocery receipts and categorize their items.")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse a receipt and print the categorized result as JSON.
    Process {
        /// OCR text file, or an image with --image
        file: PathBuf,
        /// Treat the file as a receipt image and run OCR
        #[arg(long)]
        image: bool,
        /// Store the resulting categories as learned mappings
        #[arg(long)]
        approve: bool,
    },
    /// List the active category vocabulary.
    Categories,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file first
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let config = AppConfig::from_env()?;
    config.validate()?;

    let metrics_handle = observability::init_observability(&config.observability)?;
    info!("{}", config.summary());
    ocr::log_ocr_backend();

    match &config.database.url {
        Some(_) => {
            let pool = db::connect(&config.database).await?;
            if config.database.init_schema {
                db::init_database_schema(&pool).await?;
            }
            run(&cli.command, &config, PgMappingStore::new(pool)).await?;
        }
        None => {
            warn!("DATABASE_URL not set, learned mappings live only for this run");
            run(&cli.command, &config, InMemoryMappingStore::with_builtin()).await?;
        }
    }

    if let Some(handle) = metrics_handle {
        if config.observability.dump_metrics {
            eprintln!("{}", handle.render());
        }
    }
    Ok(())
}

async fn run<S: MappingStore>(command: &Commands, config: &AppConfig, store: S) -> Result<()> {
    match command {
        Commands::Categories => {
            for category in store.list_active_categories().await? {
                println!("{}", category);
            }
            Ok(())
        }
        Commands::Process { file, image, approve } => {
            let client = MessagesClient::new(config.oracle.clone())?;
            let vision = config
                .oracle
                .vision_enabled
                .then(|| AnthropicVisionOracle::new(client.clone()));
            let processor = ReceiptProcessor::new(
                config.parsing.clone(),
                store,
                AnthropicClassifier::new(client),
                vision,
            );

            let bytes = std::fs::read(file)
                .with_context(|| format!("Failed to read {}", file.display()))?;

            let processed = if *image {
                #[cfg(feature = "tesseract")]
                let engine = ocr::TesseractOcr::new(config.ocr.clone());
                #[cfg(not(feature = "tesseract"))]
                let engine = ocr::UnavailableOcr;
                processor.process_image(&engine, &bytes).await?
            } else {
                let text = String::from_utf8_lossy(&bytes);
                processor.process_text(&text).await?
            };

            println!("{}", serde_json::to_string_pretty(&processed)?);

            if *approve {
                let written = processor.commit_approved(&processed.items).await?;
                info!(count = written.len(), "Mappings saved");
            }
            Ok(())
        }
    }
}
