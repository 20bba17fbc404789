//! # Receipt Text Processing
//!
//! Heuristic extraction of store, date, totals and line items from raw OCR
//! text of grocery receipts.
//!
//! ## Features
//!
//! - Known-chain store detection over the full text, so garbled headers such
//!   as `"OPAL VAULT COSTCO pee WV HOL ESALE"` still resolve
//! - Header fallback for unknown stores
//! - Date validation that rejects OCR noise like `99/99/9999`
//! - Subtotal, tax, summed discounts and last-match grand total
//! - Multi-format line items (see [`crate::line_formats`]) with a plausibility
//!   filter against address fragments and barcodes

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, info, trace};

use crate::line_formats::{default_formats, LineFormat, DEFAULT_MAX_MULTIPLIER};
use crate::normalize::title_case;
use crate::receipt::{ParsedReceipt, RawItem};

lazy_static! {
    static ref TOTAL_LINE: Regex =
        Regex::new(r"(?i)(?:\btotal\b[^\d\n]{0,25}?|amount:)\s*\$?\s*(\d+\.\d{2})")
            .expect("Total pattern should be valid");
    static ref SUBTOTAL_LINE: Regex =
        Regex::new(r"(?i)sub\s*-?\s*total[^\d\n]{0,15}?\$?\s*(\d+\.\d{2})")
            .expect("Subtotal pattern should be valid");
    static ref TAX_LINE: Regex = Regex::new(r"(?i)\btax\b[^\d\n]{0,10}?\$?\s*(\d+\.\d{2})")
        .expect("Tax pattern should be valid");
    static ref DISCOUNT_LINE: Regex =
        Regex::new(r"(?i)(savings|discount|coupon)[^a-z\d]*-?\$?\s*(\d+\.\d{2})")
            .expect("Discount pattern should be valid");
    static ref DATE_TOKEN: Regex = Regex::new(r"(\d{1,2}[/\-]\d{1,2}[/\-]\d{2,4})")
        .expect("Date pattern should be valid");
    static ref STORE_HEADER: Regex = Regex::new(r"^([A-Z][A-Z\s&']{3,30}?)(?:\s+#\d+)?$")
        .expect("Store header pattern should be valid");
    static ref LONG_DIGIT_RUN: Regex =
        Regex::new(r"\d{3,}").expect("Digit run pattern should be valid");
}

/// Known chain keyword → canonical store name, matched in order
pub const KNOWN_STORES: &[(&str, &str)] = &[
    ("costco", "Costco"),
    ("wholesale", "Costco"),
    ("sam's club", "Sam's Club"),
    ("sams club", "Sam's Club"),
    ("walmart", "Walmart"),
    ("wal-mart", "Walmart"),
    ("target", "Target"),
    ("kroger", "Kroger"),
    ("heb", "H-E-B"),
    ("h-e-b", "H-E-B"),
    ("whole foods", "Whole Foods"),
    ("wholefoods", "Whole Foods"),
    ("trader joe", "Trader Joe's"),
    ("trader joes", "Trader Joe's"),
    ("aldi", "Aldi"),
    ("publix", "Publix"),
    ("safeway", "Safeway"),
    ("albertsons", "Albertsons"),
    ("meijer", "Meijer"),
    ("wegmans", "Wegmans"),
    ("sprouts", "Sprouts"),
    ("fresh market", "The Fresh Market"),
    ("market basket", "Market Basket"),
    ("stop & shop", "Stop & Shop"),
    ("stop and shop", "Stop & Shop"),
    ("giant", "Giant"),
    ("food lion", "Food Lion"),
    ("winn-dixie", "Winn-Dixie"),
    ("winndixie", "Winn-Dixie"),
    ("dollar general", "Dollar General"),
    ("dollar tree", "Dollar Tree"),
    ("cvs", "CVS"),
    ("walgreens", "Walgreens"),
];

/// Substrings marking totals, payment and loyalty lines that are never items
pub const STOP_KEYWORDS: &[&str] = &[
    "subtotal",
    "sub total",
    "sub-total",
    "tax",
    "total",
    "change",
    "cash",
    "credit",
    "debit",
    "visa",
    "mastercard",
    "amex",
    "approved",
    "balance",
    "savings",
    "discount",
    "points",
    "reward",
    "thank",
    "receipt",
    "store",
    "manager",
    "phone",
    "tel:",
    "www.",
    ".com",
    "member",
    "card#",
    "transaction",
    "ref#",
    "auth",
    "batch",
    "item",
    "qty",
    "price",
    "amount",
];

/// Static lookup tables injected into the parser
#[derive(Debug, Clone)]
pub struct ParserTables {
    /// `(lowercase keyword, canonical name)` pairs
    pub known_stores: Vec<(String, String)>,
    /// Lowercase substrings that disqualify a line from item extraction
    pub stop_keywords: Vec<String>,
}

impl Default for ParserTables {
    fn default() -> Self {
        Self {
            known_stores: KNOWN_STORES
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            stop_keywords: STOP_KEYWORDS.iter().map(|k| k.to_string()).collect(),
        }
    }
}

/// Tunable thresholds for parsing, matching and verification
#[derive(Debug, Clone, PartialEq)]
pub struct ParsingConfig {
    /// Item prices must fall strictly below this
    pub max_item_price: f64,
    /// Minimum title-cased name length
    pub min_name_length: usize,
    /// Alphabetic characters / name length must exceed this
    pub min_alpha_ratio: f64,
    /// At least one word must carry this many letters
    pub min_word_letters: usize,
    /// `"N x"` multipliers above this become 1
    pub max_multiplier: f64,
    /// Non-empty lines inspected by the store header fallback
    pub header_scan_lines: usize,
    /// Lines scanned for a date before falling back to the whole text
    pub date_scan_lines: usize,
    pub min_year: i32,
    pub max_year: i32,
    /// Fuzzy matcher length ratio
    pub min_length_ratio: f64,
    /// Allowed gap between the computed and printed totals
    pub total_tolerance: f64,
}

impl Default for ParsingConfig {
    fn default() -> Self {
        Self {
            max_item_price: 500.0,
            min_name_length: 4,
            min_alpha_ratio: 0.4,
            min_word_letters: 3,
            max_multiplier: DEFAULT_MAX_MULTIPLIER,
            header_scan_lines: 5,
            date_scan_lines: 10,
            min_year: 2010,
            max_year: 2035,
            min_length_ratio: crate::matcher::DEFAULT_MIN_LENGTH_RATIO,
            total_tolerance: crate::verification::DEFAULT_TOTAL_TOLERANCE,
        }
    }
}

impl ParsingConfig {
    /// Validate parsing configuration parameters
    pub fn validate(&self) -> crate::errors::AppResult<()> {
        if self.max_item_price <= 0.0 {
            return Err(crate::errors::AppError::Config(
                "max_item_price must be greater than 0".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.min_alpha_ratio) {
            return Err(crate::errors::AppError::Config(format!(
                "min_alpha_ratio ({}) must be in [0, 1)",
                self.min_alpha_ratio
            )));
        }
        if self.max_multiplier < 1.0 {
            return Err(crate::errors::AppError::Config(
                "max_multiplier must be at least 1".to_string(),
            ));
        }
        if self.min_year > self.max_year {
            return Err(crate::errors::AppError::Config(format!(
                "min_year ({}) cannot exceed max_year ({})",
                self.min_year, self.max_year
            )));
        }
        if !(0.0..=1.0).contains(&self.min_length_ratio) {
            return Err(crate::errors::AppError::Config(format!(
                "min_length_ratio ({}) must be in [0, 1]",
                self.min_length_ratio
            )));
        }
        if self.total_tolerance < 0.0 {
            return Err(crate::errors::AppError::Config(
                "total_tolerance cannot be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Heuristic receipt text parser
pub struct ReceiptParser {
    tables: ParserTables,
    config: ParsingConfig,
    formats: Vec<Box<dyn LineFormat>>,
}

impl Default for ReceiptParser {
    fn default() -> Self {
        Self::new(ParserTables::default(), ParsingConfig::default())
    }
}

impl std::fmt::Debug for ReceiptParser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiptParser")
            .field("known_stores", &self.tables.known_stores.len())
            .field("stop_keywords", &self.tables.stop_keywords.len())
            .field(
                "formats",
                &self.formats.iter().map(|f| f.name()).collect::<Vec<_>>(),
            )
            .field("config", &self.config)
            .finish()
    }
}

impl ReceiptParser {
    pub fn new(tables: ParserTables, config: ParsingConfig) -> Self {
        let formats = default_formats(config.max_multiplier);
        Self {
            tables,
            config,
            formats,
        }
    }

    /// Replace the ordered list of line formats
    pub fn with_formats(mut self, formats: Vec<Box<dyn LineFormat>>) -> Self {
        self.formats = formats;
        self
    }

    pub fn config(&self) -> &ParsingConfig {
        &self.config
    }

    /// Parse OCR text into a [`ParsedReceipt`]
    pub fn parse(&self, text: &str) -> ParsedReceipt {
        let lines: Vec<&str> = text.split('\n').collect();

        let mut receipt = ParsedReceipt {
            store_name: self.detect_store(text, &lines),
            receipt_date: self.detect_date(&lines),
            raw_text: text.to_string(),
            ..Default::default()
        };
        self.extract_amounts(text, &lines, &mut receipt);
        receipt.items = self.extract_items(&lines);

        info!(
            store = ?receipt.store_name,
            date = ?receipt.receipt_date,
            total = ?receipt.total,
            items = receipt.items.len(),
            "Parsed receipt text"
        );
        receipt
    }

    /// Known chain keyword anywhere in the text, else a header-looking line
    pub fn detect_store(&self, text: &str, lines: &[&str]) -> Option<String> {
        let lower = text.to_lowercase();
        if let Some((keyword, name)) = self
            .tables
            .known_stores
            .iter()
            .find(|(keyword, _)| lower.contains(keyword.as_str()))
        {
            debug!(keyword = %keyword, store = %name, "Store detected by keyword");
            return Some(name.clone());
        }

        lines
            .iter()
            .map(|line| line.trim())
            .filter(|line| !line.is_empty())
            .take(self.config.header_scan_lines)
            .find(|line| {
                line.chars().count() > 3
                    && STORE_HEADER.is_match(&line.to_uppercase())
                    && !LONG_DIGIT_RUN.is_match(line)
            })
            .map(|line| {
                debug!(header = %line, "Store detected from header line");
                title_case(line)
            })
    }

    /// First plausible date token in the header, else anywhere in the text
    pub fn detect_date(&self, lines: &[&str]) -> Option<String> {
        lines
            .iter()
            .take(self.config.date_scan_lines)
            .find_map(|line| self.find_date(line))
            .or_else(|| lines.iter().find_map(|line| self.find_date(line)))
            .map(str::to_string)
    }

    fn find_date<'a>(&self, line: &'a str) -> Option<&'a str> {
        DATE_TOKEN
            .captures(line)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
            .filter(|token| self.is_plausible_date(token))
    }

    fn is_plausible_date(&self, token: &str) -> bool {
        let parts: Vec<&str> = token.split(['/', '-']).collect();
        if parts.len() != 3 {
            return false;
        }
        let nums: Vec<i32> = match parts.iter().map(|p| p.parse::<i32>()).collect() {
            Ok(nums) => nums,
            Err(_) => return false,
        };
        let year = match parts[2].len() {
            4 => nums[2],
            2 => 2000 + nums[2],
            _ => return false,
        };
        if year < self.config.min_year || year > self.config.max_year {
            trace!(token = %token, "Date rejected: year out of range");
            return false;
        }
        (1..=31).contains(&nums[0]) && (1..=31).contains(&nums[1])
    }

    fn extract_amounts(&self, text: &str, lines: &[&str], receipt: &mut ParsedReceipt) {
        // a zero subtotal or tax keeps looking for a later non-zero line
        let unset = |value: Option<f64>| value.filter(|v| *v != 0.0).is_none();
        for line in lines {
            if unset(receipt.subtotal) {
                receipt.subtotal = first_amount(&SUBTOTAL_LINE, line, 1).or(receipt.subtotal);
            }
            if unset(receipt.tax) {
                receipt.tax = first_amount(&TAX_LINE, line, 1).or(receipt.tax);
            }
            if let Some(discount) = first_amount(&DISCOUNT_LINE, line, 2) {
                receipt.discounts += discount;
            }
        }

        receipt.total = TOTAL_LINE
            .captures_iter(text)
            .filter_map(|caps| caps.get(1)?.as_str().parse::<f64>().ok())
            .last();
    }

    fn extract_items(&self, lines: &[&str]) -> Vec<RawItem> {
        let mut items = Vec::new();
        for line in lines {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let lower = line.to_lowercase();
            if let Some(keyword) = self
                .tables
                .stop_keywords
                .iter()
                .find(|kw| lower.contains(kw.as_str()))
            {
                trace!(line = %line, keyword = %keyword, "Skipping metadata line");
                continue;
            }

            let upper = line.to_uppercase();
            let Some((format, candidate)) = self
                .formats
                .iter()
                .find_map(|format| format.parse_line(&upper).map(|c| (format.name(), c)))
            else {
                continue;
            };

            let clean_name = title_case(&candidate.name);
            if !self.is_plausible_item(&clean_name, candidate.price) {
                debug!(line = %line, format, "Rejected implausible item");
                continue;
            }

            trace!(format, name = %candidate.name, price = candidate.price, "Line item extracted");
            items.push(RawItem {
                raw_name: candidate.name,
                clean_name,
                price: candidate.price,
                quantity: candidate.quantity,
            });
        }
        items
    }

    /// Price range, name length, alphabetic ratio and a real word
    fn is_plausible_item(&self, name: &str, price: f64) -> bool {
        if !(price > 0.0 && price < self.config.max_item_price) {
            return false;
        }
        let length = name.chars().count();
        if length < self.config.min_name_length {
            return false;
        }
        let alpha = name.chars().filter(|c| c.is_alphabetic()).count();
        if alpha as f64 / length.max(1) as f64 <= self.config.min_alpha_ratio {
            return false;
        }
        name.split_whitespace().any(|word| {
            word.chars().filter(|c| c.is_alphabetic()).count() >= self.config.min_word_letters
        })
    }
}

fn first_amount(pattern: &Regex, line: &str, group: usize) -> Option<f64> {
    pattern
        .captures(line)
        .and_then(|caps| caps.get(group))
        .and_then(|m| m.as_str().parse().ok())
}

/// Parse with default tables and thresholds
pub fn parse_receipt_text(text: &str) -> ParsedReceipt {
    ReceiptParser::default().parse(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_keyword_anywhere_in_text() {
        let parser = ReceiptParser::default();
        let text = "OPAL VAULT\nCOSTCO pee WV HOL ESALE\nKS WATER   4.99";
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(parser.detect_store(text, &lines).as_deref(), Some("Costco"));
    }

    #[test]
    fn test_store_header_fallback() {
        let parser = ReceiptParser::default();
        let text = "\n  CORNER GROCER #12\n123 MAIN ST\n";
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            parser.detect_store(text, &lines).as_deref(),
            Some("Corner Grocer #12")
        );
    }

    #[test]
    fn test_store_header_rejects_long_digits() {
        let parser = ReceiptParser::default();
        let text = "NEIGHBORHOOD MART #1234\n42 RIVER RD";
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(parser.detect_store(text, &lines), None);
    }

    #[test]
    fn test_date_validation() {
        let parser = ReceiptParser::default();
        assert!(parser.is_plausible_date("02/14/2026"));
        assert!(parser.is_plausible_date("2-14-26"));
        assert!(!parser.is_plausible_date("99/99/9999"));
        assert!(!parser.is_plausible_date("02/14/1999"));
        assert!(!parser.is_plausible_date("00/14/2026"));
        assert!(!parser.is_plausible_date("02/14/026"));
    }

    #[test]
    fn test_date_prefers_header_then_full_text() {
        let parser = ReceiptParser::default();
        let mut lines = vec!["99/99/9999"];
        lines.extend(std::iter::repeat("filler").take(12));
        lines.push("03/01/2025 12:44");
        assert_eq!(parser.detect_date(&lines).as_deref(), Some("03/01/2025"));
    }

    #[test]
    fn test_amounts() {
        let text = "SUBTOTAL 10.00\nTAX 0.83\nCOUPON -1.00\nSAVINGS $0.50\nTOTAL $10.33\n";
        let receipt = parse_receipt_text(text);
        assert_eq!(receipt.subtotal, Some(10.00));
        assert_eq!(receipt.tax, Some(0.83));
        assert!((receipt.discounts - 1.50).abs() < 1e-9);
        assert_eq!(receipt.total, Some(10.33));
    }

    #[test]
    fn test_zero_tax_line_does_not_hide_later_tax() {
        let text = "TAX 0.00\nMILK    3.49\nSALES TAX 0.29\nTOTAL 3.78\n";
        let mut receipt = parse_receipt_text(text);
        assert_eq!(receipt.tax, Some(0.29));
        assert_eq!(receipt.items.len(), 1);
        assert!(crate::verification::verify_total(&mut receipt).is_valid);

        let receipt = parse_receipt_text("SUBTOTAL 0.00\nSUBTOTAL 4.10\nTAX 0.00\nTOTAL 4.10\n");
        assert_eq!(receipt.subtotal, Some(4.10));
        assert_eq!(receipt.tax, Some(0.0));
    }

    #[test]
    fn test_grand_total_is_last_match() {
        let text = "TOTAL 5.00\nmore stuff\nTOTAL SALE 12.34\n";
        assert_eq!(parse_receipt_text(text).total, Some(12.34));
    }

    #[test]
    fn test_amount_colon_counts_as_total() {
        let text = "AMOUNT: $45.10\n";
        assert_eq!(parse_receipt_text(text).total, Some(45.10));
    }

    #[test]
    fn test_plausibility_filter() {
        let parser = ReceiptParser::default();
        assert!(parser.is_plausible_item("Avocado Large", 5.98));
        assert!(!parser.is_plausible_item("Avocado Large", 0.0));
        assert!(!parser.is_plausible_item("Avocado Large", 500.0));
        assert!(!parser.is_plausible_item("Ab", 1.00));
        assert!(!parser.is_plausible_item("12 34 56 Ab", 1.00));
        assert!(!parser.is_plausible_item("Ab Cd Ef", 1.00));
    }

    #[test]
    fn test_stop_keywords_skip_lines() {
        let receipt = parse_receipt_text("SUBTOTAL   10.00\nVISA CREDIT   10.00\n");
        assert!(receipt.items.is_empty());
    }

    #[test]
    fn test_raw_and_clean_names() {
        let receipt = parse_receipt_text("KS STEAKSTRIP   12.99\n");
        assert_eq!(receipt.items.len(), 1);
        assert_eq!(receipt.items[0].raw_name, "KS STEAKSTRIP");
        assert_eq!(receipt.items[0].clean_name, "Ks Steakstrip");
    }

    #[test]
    fn test_parsing_config_validation() {
        let mut config = ParsingConfig::default();
        assert!(config.validate().is_ok());
        config.min_year = 2040;
        assert!(config.validate().is_err());
        config.min_year = 2010;
        config.min_length_ratio = 1.5;
        assert!(config.validate().is_err());
    }
}
