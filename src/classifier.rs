//! Stage 2 classification oracle: assigns categories to items the learned
//! mappings could not resolve.

use std::future::Future;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::oracle::{parse_json_reply, ContentBlock, MessagesClient, MessagesRequest, OracleError};

/// Confidence assumed when the oracle omits one
pub const DEFAULT_AI_CONFIDENCE: f64 = 0.7;

/// One item sent to the oracle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationRequest {
    pub id: u64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<String>,
}

/// One oracle answer; fields are optional because replies are untrusted
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClassificationResult {
    pub id: u64,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// Classification failed as a whole
#[derive(Debug, Clone, PartialEq)]
pub enum CategorizationError {
    Oracle(OracleError),
    /// Oracle-independent failure (e.g. a mock or a misconfigured backend)
    Other(String),
}

impl std::fmt::Display for CategorizationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CategorizationError::Oracle(err) => write!(f, "[CATEGORIZATION] {}", err),
            CategorizationError::Other(msg) => write!(f, "[CATEGORIZATION] {}", msg),
        }
    }
}

impl std::error::Error for CategorizationError {}

impl From<OracleError> for CategorizationError {
    fn from(err: OracleError) -> Self {
        CategorizationError::Oracle(err)
    }
}

/// External classifier constrained to a closed category vocabulary
pub trait ClassificationOracle: Send + Sync {
    fn classify(
        &self,
        items: &[ClassificationRequest],
        categories: &[String],
    ) -> impl Future<Output = Result<Vec<ClassificationResult>, CategorizationError>> + Send;
}

/// System prompt listing the allowed categories
pub fn build_system_prompt(categories: &[String]) -> String {
    format!(
        "You are a grocery receipt item categorizer.\n\
         Your job is to assign each grocery item to exactly one of these categories:\n\
         {}\n\
         \n\
         Rules:\n\
         - Use only the listed category names, spelled exactly as given.\n\
         - Base your decision on the item name and store context.\n\
         - When unsure, prefer a specific category over \"Other\".\n\
         - Return ONLY a JSON array. No prose, no markdown fences.\n\
         \n\
         Input format: JSON array of objects with \"id\" and \"name\" fields, plus optional \"store\".\n\
         Output format: JSON array of objects with \"id\", \"category\", and \"confidence\" (0.0–1.0).",
        categories.join(", ")
    )
}

/// Classifier backed by the Messages API
#[derive(Debug, Clone)]
pub struct AnthropicClassifier {
    client: MessagesClient,
}

impl AnthropicClassifier {
    pub fn new(client: MessagesClient) -> Self {
        Self { client }
    }
}

impl ClassificationOracle for AnthropicClassifier {
    async fn classify(
        &self,
        items: &[ClassificationRequest],
        categories: &[String],
    ) -> Result<Vec<ClassificationResult>, CategorizationError> {
        let payload = serde_json::to_string(items)
            .map_err(|e| CategorizationError::Other(format!("Failed to encode items: {}", e)))?;
        let config = self.client.config();

        let request = MessagesRequest::user(
            config.classification_model.clone(),
            config.classification_max_tokens,
            vec![ContentBlock::text(payload)],
        )
        .with_system(build_system_prompt(categories));

        let reply = self.client.create_message("classify", &request).await?;
        let results: Vec<ClassificationResult> = parse_json_reply(&reply)?;
        debug!(requested = items.len(), returned = results.len(), "Classification reply parsed");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_prompt_lists_categories() {
        let prompt = build_system_prompt(&["Produce".to_string(), "Other".to_string()]);
        assert!(prompt.contains("Produce, Other"));
        assert!(prompt.contains("Return ONLY a JSON array"));
    }

    #[test]
    fn test_request_omits_missing_store() {
        let request = ClassificationRequest {
            id: 3,
            name: "Oat Milk".to_string(),
            store: None,
        };
        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(json, r#"{"id":3,"name":"Oat Milk"}"#);
    }

    #[test]
    fn test_lenient_result_parsing() {
        let reply = r#"[{"id": 1, "category": "Produce", "confidence": 0.9}, {"id": 2}]"#;
        let results: Vec<ClassificationResult> = parse_json_reply(reply).unwrap();
        assert_eq!(results[0].category.as_deref(), Some("Produce"));
        assert_eq!(results[1].category, None);
        assert_eq!(results[1].confidence, None);
    }
}
