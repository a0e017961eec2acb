//! Anthropic messages API

use crate::error::{AskflowError, Result};
use crate::provider::{ModelError, ModelProvider};
use crate::tier::TierProfile;
use async_trait::async_trait;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const API_VERSION: &str = "2023-06-01";

/// Provider calling the Anthropic HTTP API; generation only
pub struct AnthropicProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    timeout: Duration,
}

impl AnthropicProvider {
    pub fn new(api_key: Option<String>, base_url: Option<&str>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AskflowError::Provider(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url
                .unwrap_or(DEFAULT_BASE_URL)
                .trim_end_matches('/')
                .to_string(),
            timeout,
        })
    }
}

/// Concatenate the text blocks of a messages response
fn parse_messages_response(json: &serde_json::Value) -> std::result::Result<String, ModelError> {
    let blocks = json
        .get("content")
        .and_then(|c| c.as_array())
        .ok_or_else(|| ModelError::InvalidResponse("missing content array".to_string()))?;

    let text: Vec<&str> = blocks
        .iter()
        .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
        .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
        .collect();

    if text.is_empty() {
        return Err(ModelError::InvalidResponse("no text content".to_string()));
    }
    Ok(text.join("").trim().to_string())
}

#[async_trait]
impl ModelProvider for AnthropicProvider {
    async fn generate(&self, prompt: &str, profile: &TierProfile) -> std::result::Result<String, ModelError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ModelError::NotConfigured("Anthropic API key is not set".to_string()))?;

        let body = serde_json::json!({
            "model": profile.model,
            "max_tokens": profile.max_tokens,
            "temperature": profile.temperature,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", api_key)
            .header("anthropic-version", API_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelError::from_reqwest(e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(ModelError::from_status(status.as_u16(), body_text));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ModelError::InvalidResponse(e.to_string()))?;
        parse_messages_response(&json)
    }

    async fn embed(&self, _text: &str) -> std::result::Result<Vec<f32>, ModelError> {
        Err(ModelError::Unsupported("embeddings".to_string()))
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_messages_response() {
        let json = serde_json::json!({
            "content": [
                { "type": "text", "text": "第一段" },
                { "type": "tool_use", "name": "x" },
                { "type": "text", "text": "第二段" }
            ]
        });
        assert_eq!(parse_messages_response(&json).unwrap(), "第一段第二段");

        let json = serde_json::json!({ "content": [] });
        assert!(parse_messages_response(&json).is_err());
    }

    #[tokio::test]
    async fn test_embed_unsupported() {
        let provider = AnthropicProvider::new(None, None, Duration::from_secs(1)).unwrap();
        assert!(matches!(
            provider.embed("x").await,
            Err(ModelError::Unsupported(_))
        ));
    }
}
