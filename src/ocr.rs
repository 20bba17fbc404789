//! # OCR Processing Module
//!
//! Text extraction from receipt photos. The [`OcrEngine`] trait is the seam
//! the pipeline depends on; the Tesseract implementation (via `leptess`) is
//! compiled in with the `tesseract` feature.
//!
//! Receipt photos are preprocessed before recognition:
//!
//! - grayscale conversion
//! - upscaling narrow images to at least [`MIN_OCR_WIDTH`] pixels
//! - inversion of dark horizontal bands (white-on-black total boxes)
//! - contrast boost and sharpening

use std::future::Future;

use image::imageops::FilterType;
use image::{DynamicImage, GrayImage};
use tracing::{debug, info};

pub use crate::ocr_config::OcrConfig;
pub use crate::ocr_errors::OcrError;

/// Images narrower than this are upscaled before recognition
pub const MIN_OCR_WIDTH: u32 = 800;
/// Bands darker than this mean luminance are inverted
pub const DARK_BAND_THRESHOLD: f64 = 80.0;
const BAND_COUNT: u32 = 40;
const CONTRAST_FACTOR: f32 = 2.0;
const SHARPEN_KERNEL: [f32; 9] = [
    -0.125, -0.125, -0.125, //
    -0.125, 2.0, -0.125, //
    -0.125, -0.125, -0.125,
];

/// External OCR collaborator
pub trait OcrEngine: Send + Sync {
    /// Recognize the text of an encoded image
    fn extract_text(&self, image: &[u8]) -> impl Future<Output = Result<String, OcrError>> + Send;
}

/// Engine used when no OCR backend is compiled in
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableOcr;

impl OcrEngine for UnavailableOcr {
    async fn extract_text(&self, _image: &[u8]) -> Result<String, OcrError> {
        Err(OcrError::Unavailable(
            "built without the `tesseract` feature".to_string(),
        ))
    }
}

/// Reject empty or oversized uploads before decoding
pub fn validate_image_bytes(image: &[u8], config: &OcrConfig) -> Result<(), OcrError> {
    if image.is_empty() {
        return Err(OcrError::ImageLoad("image is empty".to_string()));
    }
    if image.len() as u64 > config.max_file_size {
        return Err(OcrError::ImageLoad(format!(
            "image is {} bytes, limit is {} bytes",
            image.len(),
            config.max_file_size
        )));
    }
    Ok(())
}

/// Trim every line and drop empty ones
pub fn clean_ocr_text(text: &str) -> String {
    text.trim()
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<&str>>()
        .join("\n")
}

/// Grayscale, upscale, invert dark bands, boost contrast and sharpen
pub fn preprocess_receipt_image(image: &DynamicImage) -> GrayImage {
    let mut gray = image.to_luma8();

    let (width, height) = gray.dimensions();
    if width > 0 && width < MIN_OCR_WIDTH {
        let scale = MIN_OCR_WIDTH as f64 / width as f64;
        let new_height = ((height as f64 * scale) as u32).max(1);
        gray = image::imageops::resize(&gray, MIN_OCR_WIDTH, new_height, FilterType::Lanczos3);
        debug!("Upscaled image {}x{} -> {}x{}", width, height, MIN_OCR_WIDTH, new_height);
    }

    let inverted = invert_dark_bands(&mut gray);
    if inverted > 0 {
        debug!(bands = inverted, "Inverted dark background bands");
    }

    enhance_contrast(&mut gray, CONTRAST_FACTOR);
    DynamicImage::ImageLuma8(gray).filter3x3(&SHARPEN_KERNEL).to_luma8()
}

/// Invert every horizontal band whose mean is below [`DARK_BAND_THRESHOLD`];
/// returns the number of bands inverted
fn invert_dark_bands(gray: &mut GrayImage) -> usize {
    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 {
        return 0;
    }
    let band_height = (height / BAND_COUNT).max(1);
    let mut inverted = 0;

    let mut top = 0;
    while top < height {
        let bottom = (top + band_height).min(height);
        let mut sum = 0u64;
        for y in top..bottom {
            for x in 0..width {
                sum += gray.get_pixel(x, y).0[0] as u64;
            }
        }
        let mean = sum as f64 / ((bottom - top) as u64 * width as u64) as f64;
        if mean < DARK_BAND_THRESHOLD {
            for y in top..bottom {
                for x in 0..width {
                    let pixel = gray.get_pixel_mut(x, y);
                    pixel.0[0] = 255 - pixel.0[0];
                }
            }
            inverted += 1;
        }
        top = bottom;
    }
    inverted
}

/// Scale each pixel's distance from the image mean by `factor`
fn enhance_contrast(gray: &mut GrayImage, factor: f32) {
    let count = gray.pixels().len();
    if count == 0 {
        return;
    }
    let mean = gray.pixels().map(|p| p.0[0] as f32).sum::<f32>() / count as f32;
    for pixel in gray.pixels_mut() {
        let value = mean + (pixel.0[0] as f32 - mean) * factor;
        pixel.0[0] = value.round().clamp(0.0, 255.0) as u8;
    }
}

#[cfg(feature = "tesseract")]
mod tesseract {
    use std::io::Cursor;
    use std::time::{Duration, Instant};

    use leptess::{LepTess, Variable};
    use tracing::{info, Instrument};

    use super::{clean_ocr_text, preprocess_receipt_image, validate_image_bytes, OcrEngine};
    use crate::errors::error_logging;
    use crate::observability::{ocr_span, record_ocr_metrics};
    use crate::ocr_config::OcrConfig;
    use crate::ocr_errors::OcrError;

    /// Tesseract engine configured from [`OcrConfig`]
    #[derive(Debug, Clone)]
    pub struct TesseractOcr {
        config: OcrConfig,
    }

    impl TesseractOcr {
        pub fn new(config: OcrConfig) -> Self {
            Self { config }
        }

        fn recognize(config: &OcrConfig, image: &[u8]) -> Result<String, OcrError> {
            let input = if config.preprocess {
                let decoded = image::load_from_memory(image)?;
                let prepared = preprocess_receipt_image(&decoded);
                let mut png = Vec::new();
                image::DynamicImage::ImageLuma8(prepared)
                    .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)?;
                png
            } else {
                image.to_vec()
            };

            let mut tess = LepTess::new(None, &config.languages)
                .map_err(|e| {
                    OcrError::Unavailable(format!("Failed to initialize Tesseract: {e}"))
                })?;
            tess.set_variable(Variable::TesseditPagesegMode, config.psm_mode.as_str())
                .map_err(|e| OcrError::Extraction(format!("Failed to set PSM mode: {e}")))?;
            if let Some(whitelist) = &config.character_whitelist {
                tess.set_variable(Variable::TesseditCharWhitelist, whitelist)
                    .map_err(|e| {
                        OcrError::Extraction(format!("Failed to set character whitelist: {e}"))
                    })?;
            }

            tess.set_image_from_mem(&input)
                .map_err(|e| OcrError::ImageLoad(format!("Failed to load image for OCR: {e}")))?;
            let text = tess
                .get_utf8_text()
                .map_err(|e| {
                    OcrError::Extraction(format!("Failed to extract text from image: {e}"))
                })?;
            Ok(clean_ocr_text(&text))
        }
    }

    impl OcrEngine for TesseractOcr {
        async fn extract_text(&self, image: &[u8]) -> Result<String, OcrError> {
            let start = Instant::now();
            let size = image.len() as u64;
            let config = self.config.clone();
            let bytes = image.to_vec();

            let result = async move {
                validate_image_bytes(&bytes, &config)?;
                let timeout_secs = config.timeout_secs;
                let task = tokio::task::spawn_blocking(move || Self::recognize(&config, &bytes));
                match tokio::time::timeout(Duration::from_secs(timeout_secs), task).await {
                    Ok(joined) => joined
                        .map_err(|e| OcrError::Extraction(format!("OCR task failed: {e}")))?,
                    Err(_) => Err(OcrError::Timeout(format!("no result after {timeout_secs}s"))),
                }
            }
            .instrument(ocr_span("extract_text"))
            .await;

            record_ocr_metrics(result.is_ok(), start.elapsed(), size);
            match &result {
                Ok(text) => info!(
                    duration_ms = start.elapsed().as_millis() as u64,
                    chars = text.len(),
                    "OCR extraction completed"
                ),
                Err(err) => error_logging::log_ocr_error(
                    err,
                    "extract_text",
                    Some(size as usize),
                    Some(start.elapsed()),
                ),
            }
            result
        }
    }
}

#[cfg(feature = "tesseract")]
pub use tesseract::TesseractOcr;

/// Log which OCR backend this build carries
pub fn log_ocr_backend() {
    if cfg!(feature = "tesseract") {
        info!("OCR backend: tesseract");
    } else {
        info!("OCR backend: none (text input only)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_clean_ocr_text() {
        assert_eq!(clean_ocr_text("  MILK 3.49 \n\n   \n EGGS 2.99\n"), "MILK 3.49\nEGGS 2.99");
    }

    #[test]
    fn test_validate_image_bytes() {
        let config = OcrConfig {
            max_file_size: 4,
            ..Default::default()
        };
        assert!(validate_image_bytes(b"", &config).is_err());
        assert!(validate_image_bytes(b"12345", &config).is_err());
        assert!(validate_image_bytes(b"1234", &config).is_ok());
    }

    #[test]
    fn test_narrow_images_are_upscaled() {
        let image = DynamicImage::new_luma8(400, 100);
        let prepared = preprocess_receipt_image(&image);
        assert_eq!(prepared.dimensions(), (800, 200));
    }

    #[test]
    fn test_dark_bands_are_inverted() {
        // white receipt with a black band in the upper half
        let mut gray = GrayImage::from_pixel(10, 80, Luma([255]));
        for y in 0..40 {
            for x in 0..10 {
                gray.put_pixel(x, y, Luma([10]));
            }
        }
        let inverted = invert_dark_bands(&mut gray);
        assert_eq!(inverted, 20);
        assert_eq!(gray.get_pixel(0, 0).0[0], 245);
        assert_eq!(gray.get_pixel(0, 79).0[0], 255);
    }

    #[test]
    fn test_contrast_spreads_values() {
        let mut gray =
            GrayImage::from_fn(2, 1, |x, _| if x == 0 { Luma([100]) } else { Luma([150]) });
        enhance_contrast(&mut gray, 2.0);
        assert_eq!(gray.get_pixel(0, 0).0[0], 75);
        assert_eq!(gray.get_pixel(1, 0).0[0], 175);
    }

    #[tokio::test]
    async fn test_unavailable_engine() {
        let err = UnavailableOcr.extract_text(b"anything").await.unwrap_err();
        assert!(matches!(err, OcrError::Unavailable(_)));
    }
}
