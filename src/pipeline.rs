//! End-to-end receipt processing: OCR text (and optionally the image) in,
//! categorized items and a total verification out.

use std::time::Instant;

use serde::Serialize;
use tracing::{info, Instrument};

use crate::categorizer::{commit_approved_mappings, Categorizer};
use crate::classifier::ClassificationOracle;
use crate::errors::AppResult;
use crate::mapping_store::{MappingEntry, MappingStore};
use crate::matcher::FuzzyMatcher;
use crate::observability::{pipeline_span, record_parse_metrics, record_verification_metrics};
use crate::ocr::OcrEngine;
use crate::receipt::{normalize_receipt_date, CategorizedItem, ItemInput, ParsedReceipt};
use crate::text_processing::{ParserTables, ParsingConfig, ReceiptParser};
use crate::verification::{TotalVerification, TotalVerifier};
use crate::vision::{enrich_with_vision, VisionOracle};

/// Result handed back to the caller for review
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessedReceipt {
    pub receipt: ParsedReceipt,
    /// `YYYY-MM-DD` form of the receipt date when it could be read
    pub receipt_date_iso: Option<String>,
    pub verification: TotalVerification,
    pub items: Vec<CategorizedItem>,
    pub categorization_failed: bool,
}

/// Parser, vision pass, verifier and categorizer wired to their collaborators
#[derive(Debug)]
pub struct ReceiptProcessor<S, C, V> {
    parser: ReceiptParser,
    verifier: TotalVerifier,
    categorizer: Categorizer,
    store: S,
    classifier: C,
    vision: V,
}

impl<S, C, V> ReceiptProcessor<S, C, V>
where
    S: MappingStore,
    C: ClassificationOracle,
    V: VisionOracle,
{
    pub fn new(config: ParsingConfig, store: S, classifier: C, vision: V) -> Self {
        Self::with_parser(
            ReceiptParser::new(ParserTables::default(), config),
            store,
            classifier,
            vision,
        )
    }

    /// Use a parser with custom tables or line formats
    pub fn with_parser(parser: ReceiptParser, store: S, classifier: C, vision: V) -> Self {
        let verifier = TotalVerifier::new(parser.config().total_tolerance);
        let categorizer = Categorizer::new(FuzzyMatcher::new(parser.config().min_length_ratio));
        Self {
            parser,
            verifier,
            categorizer,
            store,
            classifier,
            vision,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Process OCR text that is already available
    pub async fn process_text(&self, text: &str) -> AppResult<ProcessedReceipt> {
        async {
            let receipt = self.parse(text);
            self.verify_and_categorize(receipt).await
        }
        .instrument(pipeline_span("process_text"))
        .await
    }

    /// OCR an image, parse it, run the vision pass, then verify and categorize.
    ///
    /// OCR failure is returned as an error; vision failures fall back silently.
    pub async fn process_image<O: OcrEngine>(
        &self,
        ocr: &O,
        image: &[u8],
    ) -> AppResult<ProcessedReceipt> {
        async {
            let text = ocr.extract_text(image).await?;
            let heuristic = self.parse(&text);
            let receipt = enrich_with_vision(&self.vision, image, heuristic).await;
            self.verify_and_categorize(receipt).await
        }
        .instrument(pipeline_span("process_image"))
        .await
    }

    /// Persist mappings for reviewed items
    pub async fn commit_approved(&self, items: &[CategorizedItem]) -> AppResult<Vec<MappingEntry>> {
        let active = self.store.list_active_categories().await?;
        commit_approved_mappings(&self.store, items, &active)
            .instrument(pipeline_span("commit_approved"))
            .await
    }

    fn parse(&self, text: &str) -> ParsedReceipt {
        let start = Instant::now();
        let receipt = self.parser.parse(text);
        record_parse_metrics(
            receipt.items.len(),
            receipt.store_name.is_some(),
            receipt.total.is_some(),
            start.elapsed(),
        );
        receipt
    }

    async fn verify_and_categorize(
        &self,
        mut receipt: ParsedReceipt,
    ) -> AppResult<ProcessedReceipt> {
        let verification = self.verifier.verify(&mut receipt);
        record_verification_metrics(verification.is_valid);

        let active = self.store.list_active_categories().await?;
        let mappings = self.store.load_mappings(&active).await?;
        let inputs = ItemInput::from_raw_items(&receipt.items);

        let outcome = self
            .categorizer
            .categorize(
                &inputs,
                receipt.store_name.as_deref(),
                &mappings,
                &active,
                &self.classifier,
            )
            .await;

        info!(
            items = outcome.items.len(),
            total_valid = verification.is_valid,
            categorization_failed = outcome.categorization_failed,
            "Receipt processed"
        );

        Ok(ProcessedReceipt {
            receipt_date_iso: receipt.receipt_date.as_deref().and_then(normalize_receipt_date),
            receipt,
            verification,
            items: outcome.items,
            categorization_failed: outcome.categorization_failed,
        })
    }
}
