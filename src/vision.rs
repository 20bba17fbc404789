//! # Vision Enrichment Pass
//!
//! Optional second read of the receipt through an image-understanding
//! oracle. The OCR text travels along as an alignment hint and the
//! heuristic parse stays the fallback for every field the oracle cannot
//! supply.

use std::future::Future;
use std::io::Cursor;

use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageDecoder, ImageReader};
use serde::{Deserialize, Deserializer};
use tracing::{debug, info, warn};

use crate::observability::record_vision_metrics;
use crate::oracle::{
    parse_json_reply, ContentBlock, MessagesClient, MessagesRequest, OracleError,
};
use crate::receipt::{round_cents, round_to, ParsedReceipt, RawItem};

/// Longest image side sent to the oracle
pub const MAX_VISION_DIMENSION: u32 = 1568;
pub const VISION_JPEG_QUALITY: u8 = 92;
/// Items priced at or above this are treated as misreads
pub const MAX_VISION_ITEM_PRICE: f64 = 1000.0;
const LINE_TOTAL_TOLERANCE: f64 = 0.02;

/// Structured reply of the vision oracle.
///
/// Numbers may arrive quoted and `items` may be null; neither rejects the reply.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct VisionExtraction {
    #[serde(default)]
    pub store_name: Option<String>,
    #[serde(default)]
    pub receipt_date: Option<String>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub subtotal: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub tax: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub discounts: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub total: Option<f64>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub items: Vec<VisionItem>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct VisionItem {
    /// Verbatim receipt text
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub quantity: Option<f64>,
    /// Unit price
    #[serde(default, deserialize_with = "lenient_number")]
    pub price: Option<f64>,
    #[serde(default, deserialize_with = "lenient_number")]
    pub line_total: Option<f64>,
}

/// Number, numeric string or null; unreadable strings become `None`
fn lenient_number<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrText {
        Number(f64),
        Text(String),
    }

    Ok(match Option::<NumberOrText>::deserialize(deserializer)? {
        Some(NumberOrText::Number(value)) => Some(value),
        Some(NumberOrText::Text(text)) => text.trim().trim_start_matches('$').parse().ok(),
        None => None,
    })
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// External image-understanding oracle
pub trait VisionOracle: Send + Sync {
    fn extract_structured(
        &self,
        image: &[u8],
        ocr_hint: &str,
    ) -> impl Future<Output = Result<VisionExtraction, OracleError>> + Send;
}

/// Oracle used when the vision pass is disabled
#[derive(Debug, Clone, Copy, Default)]
pub struct NoVision;

impl VisionOracle for NoVision {
    async fn extract_structured(
        &self,
        _image: &[u8],
        _ocr_hint: &str,
    ) -> Result<VisionExtraction, OracleError> {
        Err(OracleError::Unsupported("Vision pass is disabled".to_string()))
    }
}

/// `None` disables the pass
impl<V: VisionOracle> VisionOracle for Option<V> {
    async fn extract_structured(
        &self,
        image: &[u8],
        ocr_hint: &str,
    ) -> Result<VisionExtraction, OracleError> {
        match self {
            Some(oracle) => oracle.extract_structured(image, ocr_hint).await,
            None => NoVision.extract_structured(image, ocr_hint).await,
        }
    }
}

/// Media type from the file's magic bytes; unknown formats are sent as JPEG
pub fn detect_media_type(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"\x89PNG") {
        "image/png"
    } else if bytes.starts_with(b"\xff\xd8\xff") {
        "image/jpeg"
    } else if bytes.starts_with(b"MM\x00\x2a") || bytes.starts_with(b"II\x2a\x00") {
        "image/tiff"
    } else if bytes.starts_with(b"%PDF") {
        "application/pdf"
    } else {
        "image/jpeg"
    }
}

/// Image bytes ready for upload
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedImage {
    pub bytes: Vec<u8>,
    pub media_type: &'static str,
}

impl PreparedImage {
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.bytes)
    }
}

/// Orient, downscale and re-encode an image for the vision oracle.
///
/// PDFs are rejected. Images that fail to decode are passed through with
/// their sniffed media type.
pub fn prepare_image_for_vision(bytes: &[u8]) -> Result<PreparedImage, OracleError> {
    let media_type = detect_media_type(bytes);
    if media_type == "application/pdf" {
        return Err(OracleError::Unsupported(
            "PDF receipts cannot be sent to the vision pass".to_string(),
        ));
    }

    match reencode_for_vision(bytes) {
        Ok(jpeg) => {
            debug!(
                original_kb = bytes.len() / 1024,
                prepared_kb = jpeg.len() / 1024,
                "Image prepared for vision"
            );
            Ok(PreparedImage {
                bytes: jpeg,
                media_type: "image/jpeg",
            })
        }
        Err(e) => {
            warn!("Image preparation failed ({e}), sending original bytes");
            Ok(PreparedImage {
                bytes: bytes.to_vec(),
                media_type,
            })
        }
    }
}

fn reencode_for_vision(bytes: &[u8]) -> image::ImageResult<Vec<u8>> {
    let mut decoder = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()?
        .into_decoder()?;
    let orientation = decoder.orientation()?;
    let mut img = DynamicImage::from_decoder(decoder)?;
    img.apply_orientation(orientation);

    let (width, height) = (img.width(), img.height());
    if width.max(height) > MAX_VISION_DIMENSION {
        img = img.resize(MAX_VISION_DIMENSION, MAX_VISION_DIMENSION, FilterType::Lanczos3);
        debug!(
            "Resized image {}x{} -> {}x{}",
            width,
            height,
            img.width(),
            img.height()
        );
    }

    let rgb = img.to_rgb8();
    let mut out = Vec::new();
    JpegEncoder::new_with_quality(&mut out, VISION_JPEG_QUALITY).encode_image(&rgb)?;
    Ok(out)
}

const VISION_INSTRUCTIONS: &str = r#"You are a receipt data extractor. Read this grocery receipt image line by line as printed, then output structured JSON.

For every purchased item record:
  - quantity: units bought (1 when not stated)
  - price: the unit price
  - line_total: the rightmost amount charged for the line

Check that price x quantity equals line_total within $0.02; re-read the line when it does not.

Leading numbers such as "3  HEB TX ROOTS CAMPARI TOMA FW   3.47" are line or SKU numbers, not quantities.
An indented detail line ("2 Ea. @ 1/ 3.88   7.76", "0.69 Lbs @ 1/ 1.28   0.88") belongs to the numbered item above it.
For weighed items use the charged amount as the price with quantity 1.
"#;

const VISION_SCHEMA: &str = r#"Output ONLY this JSON, no prose and no markdown:

{
  "store_name": "string or null",
  "receipt_date": "string or null, YYYY-MM-DD",
  "subtotal": number or null,
  "tax": number or null,
  "discounts": number,
  "total": number or null,
  "items": [
    {
      "name": "verbatim receipt text in capitals with the printed abbreviations and truncation; this is used as a lookup key",
      "display_name": "readable title-case name with obvious abbreviations expanded",
      "quantity": number,
      "price": number,
      "line_total": number
    }
  ]
}"#;

/// Extraction prompt, with the OCR text as an alignment hint when present
pub fn build_vision_prompt(ocr_hint: &str) -> String {
    let hint = ocr_hint.trim();
    let hint_block = if hint.is_empty() {
        String::new()
    } else {
        format!(
            "\nOCR text of the same receipt follows. It may be incomplete or wrong; the image is authoritative, \
             but use the text to keep item names aligned with their prices.\n\n<ocr_text>\n{}\n</ocr_text>\n",
            hint
        )
    };
    format!("{}{}\n{}", VISION_INSTRUCTIONS, hint_block, VISION_SCHEMA)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Vision item → receipt item, or `None` when unusable
fn reconcile_item(item: VisionItem) -> Option<RawItem> {
    let name = non_empty(item.name)?;
    let mut price = item.price.filter(|p| *p > 0.0 && *p < MAX_VISION_ITEM_PRICE)?;
    let quantity = item.quantity.unwrap_or(1.0).max(1.0);

    if let Some(line_total) = item.line_total.filter(|t| *t > 0.0) {
        let computed = round_cents(price * quantity);
        if (computed - round_cents(line_total)).abs() > LINE_TOTAL_TOLERANCE {
            let corrected = round_to(line_total / quantity, 4);
            debug!(
                "Price mismatch for '{}': {} x {} = {} but line total {}; unit price now {}",
                name, price, quantity, computed, line_total, corrected
            );
            price = corrected;
        }
    }

    let clean_name = non_empty(item.display_name).unwrap_or_else(|| name.clone());
    Some(RawItem::new(name.to_uppercase(), clean_name, price, quantity))
}

/// Merge an oracle extraction with the heuristic parse
pub fn reconcile_vision(extraction: VisionExtraction, heuristic: &ParsedReceipt) -> ParsedReceipt {
    let items: Vec<RawItem> = extraction
        .items
        .into_iter()
        .filter_map(reconcile_item)
        .collect();

    let items = if items.is_empty() && !heuristic.items.is_empty() {
        warn!("Vision returned no usable items, keeping OCR items");
        heuristic.items.clone()
    } else {
        items
    };

    ParsedReceipt {
        store_name: non_empty(extraction.store_name).or_else(|| heuristic.store_name.clone()),
        receipt_date: non_empty(extraction.receipt_date).or_else(|| heuristic.receipt_date.clone()),
        subtotal: extraction.subtotal,
        tax: extraction.tax,
        discounts: extraction.discounts.unwrap_or(0.0),
        total: extraction.total.filter(|t| *t != 0.0).or(heuristic.total),
        items,
        raw_text: heuristic.raw_text.clone(),
    }
}

/// Run the vision pass; any oracle failure returns the heuristic parse unchanged
pub async fn enrich_with_vision<V: VisionOracle>(
    oracle: &V,
    image: &[u8],
    heuristic: ParsedReceipt,
) -> ParsedReceipt {
    match oracle.extract_structured(image, &heuristic.raw_text).await {
        Ok(extraction) => {
            let enriched = reconcile_vision(extraction, &heuristic);
            info!(items = enriched.items.len(), "Receipt enriched by vision pass");
            record_vision_metrics("enriched");
            enriched
        }
        Err(err @ (OracleError::Unsupported(_) | OracleError::MissingApiKey)) => {
            debug!("Vision pass skipped: {err}");
            record_vision_metrics("skipped");
            heuristic
        }
        Err(err) => {
            warn!("Vision pass failed: {err}, using OCR parse");
            record_vision_metrics("fallback");
            heuristic
        }
    }
}

/// Vision oracle backed by the Messages API
#[derive(Debug, Clone)]
pub struct AnthropicVisionOracle {
    client: MessagesClient,
}

impl AnthropicVisionOracle {
    pub fn new(client: MessagesClient) -> Self {
        Self { client }
    }
}

impl VisionOracle for AnthropicVisionOracle {
    async fn extract_structured(
        &self,
        image: &[u8],
        ocr_hint: &str,
    ) -> Result<VisionExtraction, OracleError> {
        let prepared = prepare_image_for_vision(image)?;
        let encoded = prepared.to_base64();
        info!(
            size_kb = encoded.len() / 1024,
            media_type = prepared.media_type,
            "Sending receipt image to vision oracle"
        );

        let config = self.client.config();
        let request = MessagesRequest::user(
            config.vision_model.clone(),
            config.vision_max_tokens,
            vec![
                ContentBlock::image(prepared.media_type, encoded),
                ContentBlock::text(build_vision_prompt(ocr_hint)),
            ],
        );

        let reply = self.client.create_message("vision_extract", &request).await?;
        parse_json_reply(&reply)
    }
}
