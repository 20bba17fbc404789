
use std::io::Cursor;

use image::{DynamicImage, ImageFormat, RgbImage};
use tabulate::text_processing::parse_receipt_text;
use tabulate::vision::{
    enrich_with_vision, prepare_image_for_vision, VisionExtraction, VisionItem,
    MAX_VISION_DIMENSION,
};
use test_helpers::{MockVision, SAMPLE_RECEIPT};

fn png(width: u32, height: u32) -> Vec<u8> {
    let pixel = image::Rgb([250, 250, 245]);
    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, pixel));
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png).unwrap();
    bytes
}

#[tokio::test]
async fn test_ocr_text_is_passed_as_hint() {
    let vision = MockVision::returning(VisionExtraction::default());
    let heuristic = parse_receipt_text(SAMPLE_RECEIPT);

    let enriched = enrich_with_vision(&vision, &png(4, 4), heuristic.clone()).await;

    assert_eq!(vision.hints(), vec![SAMPLE_RECEIPT.to_string()]);
    // empty extraction keeps the OCR items and header fields
    assert_eq!(enriched.items, heuristic.items);
    assert_eq!(enriched.store_name, heuristic.store_name);
    assert_eq!(enriched.total, Some(10.72));
}

#[tokio::test]
async fn test_vision_items_replace_ocr_items() {
    let vision = MockVision::returning(VisionExtraction {
        total: Some(4.49),
        items: vec![
            VisionItem {
                name: Some("3LB ORG GALA".to_string()),
                display_name: Some("Organic Gala Apples 3 lb".to_string()),
                quantity: Some(1.0),
                price: Some(4.49),
                line_total: Some(4.49),
            },
            VisionItem {
                name: Some("SUBTOTAL".to_string()),
                price: None,
                ..Default::default()
            },
        ],
        ..Default::default()
    });

    let heuristic = parse_receipt_text(SAMPLE_RECEIPT);
    let enriched = enrich_with_vision(&vision, &png(4, 4), heuristic).await;

    assert_eq!(enriched.items.len(), 1);
    assert_eq!(enriched.items[0].clean_name, "Organic Gala Apples 3 lb");
    assert_eq!(enriched.store_name.as_deref(), Some("H-E-B"));
    assert_eq!(enriched.total, Some(4.49));
}

#[tokio::test]
async fn test_disabled_or_failing_vision_is_a_no_op() {
    let heuristic = parse_receipt_text(SAMPLE_RECEIPT);

    let disabled: Option<MockVision> = None;
    assert_eq!(enrich_with_vision(&disabled, b"\x89PNG", heuristic.clone()).await, heuristic);

    let failing = Some(MockVision::failing());
    assert_eq!(enrich_with_vision(&failing, b"\x89PNG", heuristic.clone()).await, heuristic);
}

#[test]
fn test_tall_receipt_photo_is_downscaled() {
    let prepared = prepare_image_for_vision(&png(400, 3000)).unwrap();
    assert_eq!(prepared.media_type, "image/jpeg");

    let decoded = image::load_from_memory(&prepared.bytes).unwrap();
    assert_eq!(decoded.height(), MAX_VISION_DIMENSION);
    assert!(decoded.width() < 400);
}

#[test]
fn test_small_image_keeps_its_size() {
    let prepared = prepare_image_for_vision(&png(300, 500)).unwrap();
    let decoded = image::load_from_memory(&prepared.bytes).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (300, 500));
}
