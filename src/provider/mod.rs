//! Model providers and the retry/fallback router
//!
//! Providers are selected by configuration name (`openai`, `anthropic`,
//! `local`). The [`ModelRouter`] wraps a primary provider with bounded retry
//! and an optional fallback provider that runs under the same tier profile.

mod anthropic;
mod local;
mod openai;
mod retry;

pub use anthropic::AnthropicProvider;
pub use local::{extract_section, LocalProvider};
pub use openai::OpenAiProvider;
pub use retry::{retry_with_backoff, Attempted, RetryPolicy};

use crate::config::Config;
use crate::error::{AskflowError, Result};
use crate::tier::TierProfile;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single model call
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("client error {status}: {message}")]
    Client { status: u16, message: String },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("{0} is not supported by this provider")]
    Unsupported(String),

    #[error("provider not configured: {0}")]
    NotConfigured(String),
}

impl ModelError {
    /// Whether retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_) | Self::Server { .. } | Self::Timeout(_) | Self::Network(_)
        )
    }

    /// Classify a non-success HTTP status
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            429 => Self::RateLimited(body),
            500..=599 => Self::Server {
                status,
                message: body,
            },
            _ => Self::Client {
                status,
                message: body,
            },
        }
    }

    pub(crate) fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            Self::Timeout(timeout)
        } else if err.is_decode() {
            Self::InvalidResponse(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

/// Model capability interface
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Generate a completion for a rendered prompt
    async fn generate(&self, prompt: &str, profile: &TierProfile) -> std::result::Result<String, ModelError>;

    /// Embed a text into the dense retrieval space
    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, ModelError>;

    fn name(&self) -> &str;
}

/// Result of a routed generation
#[derive(Debug, Clone)]
pub struct GenerationOutcome {
    pub result: std::result::Result<String, ModelError>,
    /// Attempts across primary and fallback
    pub attempts: u32,
    /// Provider that produced the final result
    pub provider: String,
    pub used_fallback: bool,
}

/// Primary provider with retry, optional fallback, and the embedding provider
pub struct ModelRouter {
    primary: Arc<dyn ModelProvider>,
    fallback: Option<Arc<dyn ModelProvider>>,
    embedder: Arc<dyn ModelProvider>,
    policy: RetryPolicy,
}

impl ModelRouter {
    pub fn new(primary: Arc<dyn ModelProvider>, policy: RetryPolicy) -> Self {
        Self {
            embedder: Arc::clone(&primary),
            primary,
            fallback: None,
            policy,
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn ModelProvider>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn ModelProvider>) -> Self {
        self.embedder = embedder;
        self
    }

    /// Build providers named in configuration
    pub fn from_config(config: &Config) -> Result<Self> {
        let policy = RetryPolicy::from_config(&config.llm);
        let llm = &config.llm;

        let primary = build_provider(
            &llm.provider,
            Some(&llm.api_key_env),
            llm.base_url.as_deref(),
            None,
            policy.timeout,
        )?;

        let embedder = build_provider(
            &config.embedding.provider,
            Some(&llm.api_key_env),
            llm.base_url.as_deref(),
            Some(&config.embedding.model),
            policy.timeout,
        )?;

        let mut router = Self::new(primary, policy).with_embedder(embedder);

        if let Some(name) = &llm.fallback_provider {
            let fallback = build_provider(
                name,
                llm.fallback_api_key_env.as_deref(),
                llm.fallback_base_url.as_deref(),
                None,
                router.policy.timeout,
            )?;
            router = router.with_fallback(fallback);
        }

        tracing::info!(
            primary = router.primary.name(),
            fallback = router.fallback.as_ref().map(|p| p.name()),
            embedder = router.embedder.name(),
            "Model providers ready"
        );

        Ok(router)
    }

    pub fn primary_name(&self) -> &str {
        self.primary.name()
    }

    pub fn embedder(&self) -> Arc<dyn ModelProvider> {
        Arc::clone(&self.embedder)
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Generate with retry on the primary, then the fallback
    pub async fn generate(&self, prompt: &str, profile: &TierProfile) -> GenerationOutcome {
        let primary = retry_with_backoff(&self.policy, |_| self.primary.generate(prompt, profile)).await;

        let primary_err = match primary.result {
            Ok(text) => {
                return GenerationOutcome {
                    result: Ok(text),
                    attempts: primary.attempts,
                    provider: self.primary.name().to_string(),
                    used_fallback: false,
                }
            }
            Err(e) => e,
        };

        let Some(fallback) = &self.fallback else {
            return GenerationOutcome {
                result: Err(primary_err),
                attempts: primary.attempts,
                provider: self.primary.name().to_string(),
                used_fallback: false,
            };
        };

        tracing::warn!(
            provider = self.primary.name(),
            attempts = primary.attempts,
            error = %primary_err,
            "Primary provider failed, trying fallback"
        );

        let fallback_profile = profile.for_fallback();
        let secondary =
            retry_with_backoff(&self.policy, |_| fallback.generate(prompt, &fallback_profile)).await;

        GenerationOutcome {
            result: secondary.result,
            attempts: primary.attempts + secondary.attempts,
            provider: fallback.name().to_string(),
            used_fallback: true,
        }
    }
}

fn build_provider(
    name: &str,
    api_key_env: Option<&str>,
    base_url: Option<&str>,
    embedding_model: Option<&str>,
    timeout: Duration,
) -> Result<Arc<dyn ModelProvider>> {
    let api_key = api_key_env.and_then(|var| std::env::var(var).ok());

    let provider: Arc<dyn ModelProvider> = match name {
        "openai" => {
            if api_key.is_none() {
                tracing::warn!(env = ?api_key_env, "OpenAI API key not set; calls will fail");
            }
            Arc::new(OpenAiProvider::new(
                api_key,
                base_url,
                embedding_model.map(str::to_string),
                timeout,
            )?)
        }
        "anthropic" => {
            if api_key.is_none() {
                tracing::warn!(env = ?api_key_env, "Anthropic API key not set; calls will fail");
            }
            Arc::new(AnthropicProvider::new(api_key, base_url, timeout)?)
        }
        "local" => Arc::new(LocalProvider::new(embedding_model.map(str::to_string))?),
        other => {
            return Err(AskflowError::Provider(format!(
                "Unknown provider '{}'. Expected openai, anthropic or local",
                other
            )))
        }
    };

    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tier::ModelTier;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Scripted {
        name: String,
        calls: AtomicU32,
        script: Vec<std::result::Result<String, ModelError>>,
    }

    impl Scripted {
        fn new(name: &str, script: Vec<std::result::Result<String, ModelError>>) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                calls: AtomicU32::new(0),
                script,
            })
        }
    }

    #[async_trait]
    impl ModelProvider for Scripted {
        async fn generate(&self, _prompt: &str, profile: &TierProfile) -> std::result::Result<String, ModelError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            let step = self.script.get(n).or(self.script.last()).cloned();
            step.unwrap_or_else(|| Ok(profile.model.clone()))
        }

        async fn embed(&self, _text: &str) -> std::result::Result<Vec<f32>, ModelError> {
            Err(ModelError::Unsupported("embeddings".to_string()))
        }

        fn name(&self) -> &str {
            &self.name
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            timeout: Duration::from_secs(5),
        }
    }

    fn profile() -> TierProfile {
        TierProfile {
            tier: ModelTier::Complex,
            model: "primary-model".to_string(),
            fallback_model: Some("fallback-model".to_string()),
            temperature: 0.2,
            max_tokens: 100,
            prompt_template: "{question}".to_string(),
        }
    }

    fn server_error() -> std::result::Result<String, ModelError> {
        Err(ModelError::Server {
            status: 503,
            message: "unavailable".to_string(),
        })
    }

    #[test]
    fn test_status_classification() {
        assert!(ModelError::from_status(429, String::new()).is_transient());
        assert!(ModelError::from_status(502, String::new()).is_transient());
        assert!(!ModelError::from_status(400, String::new()).is_transient());
        assert!(!ModelError::from_status(401, String::new()).is_transient());
        assert!(ModelError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!ModelError::NotConfigured("key".into()).is_transient());
    }

    #[tokio::test]
    async fn test_transient_error_is_retried() {
        let primary = Scripted::new("primary", vec![server_error(), Ok("answer".to_string())]);
        let router = ModelRouter::new(primary.clone(), policy());

        let outcome = router.generate("q", &profile()).await;
        assert_eq!(outcome.result.unwrap(), "answer");
        assert_eq!(outcome.attempts, 2);
        assert!(!outcome.used_fallback);
    }

    #[tokio::test]
    async fn test_client_error_goes_straight_to_fallback() {
        let primary = Scripted::new(
            "primary",
            vec![Err(ModelError::Client {
                status: 400,
                message: "bad".to_string(),
            })],
        );
        let fallback = Scripted::new("fallback", vec![]);
        let router = ModelRouter::new(primary.clone(), policy()).with_fallback(fallback.clone());

        let outcome = router.generate("q", &profile()).await;
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert!(outcome.used_fallback);
        assert_eq!(outcome.provider, "fallback");
        // The fallback runs the same tier under its own model id
        assert_eq!(outcome.result.unwrap(), "fallback-model");
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts() {
        let primary = Scripted::new("primary", vec![server_error()]);
        let fallback = Scripted::new("fallback", vec![server_error()]);
        let router = ModelRouter::new(primary.clone(), policy()).with_fallback(fallback.clone());

        let outcome = router.generate("q", &profile()).await;
        assert!(outcome.result.is_err());
        assert_eq!(primary.calls.load(Ordering::SeqCst), 3);
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.attempts, 6);
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let mut config = Config::default();
        config.llm.provider = "cohere".to_string();
        assert!(ModelRouter::from_config(&config).is_err());
    }

    #[test]
    fn test_offline_router_builds() {
        let mut config = Config::default();
        config.apply_profile("offline").unwrap();
        config.llm.fallback_provider = None;
        let router = ModelRouter::from_config(&config).unwrap();
        assert_eq!(router.embedder().name(), "local");
    }
}
