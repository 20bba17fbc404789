
use tabulate::mapping_store::{InMemoryMappingStore, MappingSource};
use tabulate::ocr::UnavailableOcr;
use tabulate::receipt::CategorySource;
use tabulate::text_processing::ParsingConfig;
use tabulate::vision::{NoVision, VisionExtraction, VisionItem};
use tabulate::{AppError, ReceiptProcessor};
use test_helpers::{FailingClassifier, MockClassifier, MockOcr, MockVision, SAMPLE_RECEIPT};

fn classifier() -> MockClassifier {
    MockClassifier::new()
        .answer("Avocado Large", "Produce", Some(0.95))
        .answer("Whole Milk", "Dairy & Eggs", Some(0.9))
}

#[tokio::test]
async fn test_process_text_with_seeded_store() {
    let processor = ReceiptProcessor::new(
        ParsingConfig::default(),
        InMemoryMappingStore::with_builtin(),
        classifier(),
        NoVision,
    );

    let processed = processor.process_text(SAMPLE_RECEIPT).await.unwrap();

    assert!(processed.verification.is_valid);
    assert_eq!(processed.receipt_date_iso.as_deref(), Some("2026-02-14"));
    assert!(!processed.categorization_failed);

    let categories: Vec<(&str, CategorySource)> = processed
        .items
        .iter()
        .map(|i| (i.category.as_str(), i.category_source))
        .collect();
    assert_eq!(
        categories,
        vec![
            ("Produce", CategorySource::Learned),
            ("Produce", CategorySource::Ai),
            ("Dairy & Eggs", CategorySource::Ai),
        ]
    );
}

#[tokio::test]
async fn test_approval_teaches_the_store() {
    let processor = ReceiptProcessor::new(
        ParsingConfig::default(),
        InMemoryMappingStore::with_builtin(),
        classifier(),
        NoVision,
    );

    let first = processor.process_text(SAMPLE_RECEIPT).await.unwrap();
    processor.commit_approved(&first.items).await.unwrap();

    let entry = processor.store().get("avocadolarge").unwrap();
    assert_eq!(entry.category, "Produce");
    assert_eq!(entry.source, MappingSource::Ai);
    assert_eq!(entry.display_name, "Avocado Large");

    // seeded manual mapping keeps its source
    let bananas = processor.store().get("bananas").unwrap();
    assert_eq!(bananas.source, MappingSource::Manual);

    let second = processor.process_text(SAMPLE_RECEIPT).await.unwrap();
    assert!(second
        .items
        .iter()
        .all(|i| i.category_source == CategorySource::Learned));
}

#[tokio::test]
async fn test_failing_classifier_degrades() {
    let processor = ReceiptProcessor::new(
        ParsingConfig::default(),
        InMemoryMappingStore::with_builtin(),
        FailingClassifier::default(),
        NoVision,
    );

    let processed = processor.process_text(SAMPLE_RECEIPT).await.unwrap();

    assert!(processed.categorization_failed);
    assert_eq!(processed.items.len(), 3);
    assert_eq!(processed.items[0].category_source, CategorySource::Learned);
    assert_eq!(processed.items[1].category, "Other");
    assert_eq!(processed.items[1].ai_confidence, Some(0.0));
}

#[tokio::test]
async fn test_process_image_uses_vision_items() {
    let vision = MockVision::returning(VisionExtraction {
        store_name: Some("H-E-B".to_string()),
        receipt_date: Some("2026-02-14".to_string()),
        tax: Some(0.0),
        total: Some(7.76),
        items: vec![VisionItem {
            name: Some("OTB CAFE TORT CHIPS".to_string()),
            display_name: Some("Otb Cafe Tortilla Chips".to_string()),
            quantity: Some(2.0),
            price: Some(7.76),
            line_total: Some(7.76),
        }],
        ..Default::default()
    });
    let processor = ReceiptProcessor::new(
        ParsingConfig::default(),
        InMemoryMappingStore::with_builtin(),
        MockClassifier::new().answer("Otb Cafe Tortilla Chips", "Snacks", Some(0.8)),
        vision,
    );

    let processed = processor
        .process_image(&MockOcr(SAMPLE_RECEIPT.to_string()), b"\xff\xd8\xff fake jpeg")
        .await
        .unwrap();

    assert_eq!(processed.items.len(), 1);
    assert_eq!(processed.items[0].raw_name, "OTB CAFE TORT CHIPS");
    assert_eq!(processed.items[0].category, "Snacks");
    assert_eq!(processed.receipt.items[0].price, 3.88);
    assert!(processed.verification.is_valid);
    assert_eq!(processed.receipt.raw_text, SAMPLE_RECEIPT);
}

#[tokio::test]
async fn test_vision_failure_keeps_ocr_parse() {
    let processor = ReceiptProcessor::new(
        ParsingConfig::default(),
        InMemoryMappingStore::with_builtin(),
        classifier(),
        MockVision::failing(),
    );

    let processed = processor
        .process_image(&MockOcr(SAMPLE_RECEIPT.to_string()), b"\x89PNG")
        .await
        .unwrap();

    assert_eq!(processed.items.len(), 3);
    assert_eq!(processed.receipt.receipt_date.as_deref(), Some("02/14/2026"));
}

#[tokio::test]
async fn test_missing_ocr_engine_is_an_error() {
    let processor = ReceiptProcessor::new(
        ParsingConfig::default(),
        InMemoryMappingStore::with_builtin(),
        classifier(),
        NoVision,
    );

    let err = processor
        .process_image(&UnavailableOcr, b"\x89PNG")
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Ocr(_)));
}
