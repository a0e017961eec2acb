//! Offline provider: fastembed embeddings and extractive answers

use crate::error::{AskflowError, Result};
use crate::prompt::NO_CONTEXT;
use crate::provider::{ModelError, ModelProvider};
use crate::retrieval::tokenize;
use crate::tier::TierProfile;
use async_trait::async_trait;
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::OnceCell;

const MAX_EXTRACTED_BLOCKS: usize = 3;

/// Local provider needing no network access
///
/// Embeddings come from a fastembed model loaded on first use (downloaded to
/// the Hugging Face cache if absent). Generation is extractive: it returns the
/// context blocks of the prompt that best overlap the question.
pub struct LocalProvider {
    embedding: Option<(String, EmbeddingModel)>,
    model: OnceCell<Arc<TextEmbedding>>,
}

impl LocalProvider {
    /// Create a provider; `embedding_model` of `None` disables embeddings
    pub fn new(embedding_model: Option<String>) -> Result<Self> {
        let embedding = embedding_model
            .map(|name| {
                let model = match name.as_str() {
                    "all-MiniLM-L6-v2" | "all-minilm-l6-v2" => EmbeddingModel::AllMiniLML6V2,
                    "bge-small-en-v1.5" => EmbeddingModel::BGESmallENV15,
                    "bge-base-en-v1.5" => EmbeddingModel::BGEBaseENV15,
                    "multilingual-e5-small" => EmbeddingModel::MultilingualE5Small,
                    "multilingual-e5-base" => EmbeddingModel::MultilingualE5Base,
                    other => {
                        return Err(AskflowError::Provider(format!(
                            "Unsupported local embedding model: {}. Supported: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5, multilingual-e5-small, multilingual-e5-base",
                            other
                        )))
                    }
                };
                Ok((name, model))
            })
            .transpose()?;

        Ok(Self {
            embedding,
            model: OnceCell::new(),
        })
    }

    /// Provider that only generates extractive answers
    pub fn extractive_only() -> Self {
        Self {
            embedding: None,
            model: OnceCell::new(),
        }
    }

    async fn model(&self) -> std::result::Result<Arc<TextEmbedding>, ModelError> {
        let (name, model) = self
            .embedding
            .clone()
            .ok_or_else(|| ModelError::NotConfigured("local embedding model".to_string()))?;

        self.model
            .get_or_try_init(|| async move {
                tracing::info!("Initializing embedding model: {}", name);
                tokio::task::spawn_blocking(move || {
                    let options = InitOptions::new(model).with_show_download_progress(true);
                    TextEmbedding::try_new(options).map(Arc::new)
                })
                .await
                .map_err(|e| ModelError::Unsupported(format!("embedding worker failed: {}", e)))?
                .map_err(|e| ModelError::NotConfigured(format!("embedding model failed to load: {}", e)))
            })
            .await
            .cloned()
    }

    fn is_e5(&self) -> bool {
        self.embedding
            .as_ref()
            .is_some_and(|(name, _)| name.starts_with("multilingual-e5"))
    }
}

/// Body of a `### <header>` section of a rendered prompt
pub fn extract_section<'a>(prompt: &'a str, header: &str) -> Option<&'a str> {
    let marker = format!("### {}\n", header);
    let start = prompt.find(&marker)? + marker.len();
    let rest = &prompt[start..];
    let end = rest.find("\n### ").unwrap_or(rest.len());
    Some(rest[..end].trim())
}

fn extractive_answer(prompt: &str) -> String {
    let context = extract_section(prompt, "Context").unwrap_or_default();
    let question = extract_section(prompt, "Question").unwrap_or_default();

    if context.is_empty() || context == NO_CONTEXT {
        return "No supporting material is available for this question.".to_string();
    }

    let wanted: HashSet<String> = tokenize(question).into_iter().collect();
    let blocks: Vec<&str> = context
        .split("\n\n")
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .collect();

    let mut scored: Vec<(usize, usize)> = blocks
        .iter()
        .enumerate()
        .map(|(i, block)| {
            let overlap = tokenize(block)
                .into_iter()
                .collect::<HashSet<_>>()
                .intersection(&wanted)
                .count();
            (i, overlap)
        })
        .filter(|(_, overlap)| *overlap > 0)
        .collect();
    scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    scored.truncate(MAX_EXTRACTED_BLOCKS);
    scored.sort_by_key(|(i, _)| *i);

    let selected: Vec<&str> = if scored.is_empty() {
        blocks.iter().take(1).copied().collect()
    } else {
        scored.iter().map(|(i, _)| blocks[*i]).collect()
    };

    format!(
        "Based on the retrieved material:\n\n{}",
        selected.join("\n\n")
    )
}

#[async_trait]
impl ModelProvider for LocalProvider {
    async fn generate(&self, prompt: &str, _profile: &TierProfile) -> std::result::Result<String, ModelError> {
        Ok(extractive_answer(prompt))
    }

    async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, ModelError> {
        if text.trim().is_empty() {
            return Err(ModelError::InvalidResponse("empty text".to_string()));
        }

        let model = self.model().await?;
        let input = if self.is_e5() {
            format!("query: {}", text)
        } else {
            text.to_string()
        };

        let embeddings = tokio::task::spawn_blocking(move || model.embed(vec![input], None))
            .await
            .map_err(|e| ModelError::InvalidResponse(format!("embedding worker failed: {}", e)))?
            .map_err(|e| ModelError::InvalidResponse(e.to_string()))?;

        embeddings
            .into_iter()
            .next()
            .ok_or_else(|| ModelError::InvalidResponse("No embeddings generated".to_string()))
    }

    fn name(&self) -> &str {
        "local"
    }
}
