//! OpenAI chat completions and embeddings

use crate::error::{AskflowError, Result};
use crate::provider::{ModelError, ModelProvider};
use crate::tier::TierProfile;
use async_trait::async_trait;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Provider calling the OpenAI HTTP API
///
/// Works against any server exposing the same `chat/completions` and
/// `embeddings` routes when `base_url` is set.
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    embedding_model: Option<String>,
    timeout: Duration,
}

impl OpenAiProvider {
    pub fn new(
        api_key: Option<String>,
        base_url: Option<&str>,
        embedding_model: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
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
            embedding_model,
            timeout,
        })
    }

    fn api_key(&self) -> std::result::Result<&str, ModelError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ModelError::NotConfigured("OpenAI API key is not set".to_string()))
    }

    async fn post(&self, route: &str, body: serde_json::Value) -> std::result::Result<serde_json::Value, ModelError> {
        let api_key = self.api_key()?;

        let response = self
            .client
            .post(format!("{}/{}", self.base_url, route))
            .header("Authorization", format!("Bearer {}", api_key))
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

        response
            .json()
            .await
            .map_err(|e| ModelError::InvalidResponse(e.to_string()))
    }
}

/// Extract `choices[0].message.content`
fn parse_chat_response(json: &serde_json::Value) -> std::result::Result<String, ModelError> {
    json.get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| ModelError::InvalidResponse("missing choices[0].message.content".to_string()))
}

/// Extract `data[0].embedding`
fn parse_embedding_response(json: &serde_json::Value) -> std::result::Result<Vec<f32>, ModelError> {
    let embedding = json
        .get("data")
        .and_then(|d| d.get(0))
        .and_then(|item| item.get("embedding"))
        .and_then(|e| e.as_array())
        .ok_or_else(|| ModelError::InvalidResponse("missing data[0].embedding".to_string()))?;

    Ok(embedding
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

#[async_trait]
impl ModelProvider for OpenAiProvider {
    async fn generate(&self, prompt: &str, profile: &TierProfile) -> std::result::Result<String, ModelError> {
        let body = serde_json::json!({
            "model": profile.model,
            "messages": [{ "role": "user", "content": prompt }],
            "temperature": profile.temperature,
            "max_tokens": profile.max_tokens,
        });

        let json = self.post("chat/completions", body).await?;
        parse_chat_response(&json)
    }

    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, ModelError> {
        let model = self
            .embedding_model
            .as_deref()
            .ok_or_else(|| ModelError::NotConfigured("embedding.model".to_string()))?;

        let body = serde_json::json!({
            "model": model,
            "input": text,
        });

        let json = self.post("embeddings", body).await?;
        parse_embedding_response(&json)
    }

    fn name(&self) -> &str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tier::ModelTier;

    #[test]
    fn test_parse_chat_response() {
        let json = serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": "  MXJ6-10 的行程為 10mm。 " } }]
        });
        assert_eq!(parse_chat_response(&json).unwrap(), "MXJ6-10 的行程為 10mm。");

        let json = serde_json::json!({ "choices": [] });
        assert!(matches!(
            parse_chat_response(&json),
            Err(ModelError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_parse_embedding_response() {
        let json = serde_json::json!({ "data": [{ "embedding": [0.5, -0.25] }] });
        assert_eq!(parse_embedding_response(&json).unwrap(), vec![0.5, -0.25]);
    }

    #[tokio::test]
    async fn test_missing_key_is_not_configured() {
        let provider = OpenAiProvider::new(None, None, None, Duration::from_secs(1)).unwrap();
        let profile = TierProfile {
            tier: ModelTier::Simple,
            model: "gpt-4o-mini".to_string(),
            fallback_model: None,
            temperature: 0.0,
            max_tokens: 10,
            prompt_template: String::new(),
        };
        let err = provider.generate("hi", &profile).await.unwrap_err();
        assert!(matches!(err, ModelError::NotConfigured(_)));
        assert!(!err.is_transient());
    }
}
