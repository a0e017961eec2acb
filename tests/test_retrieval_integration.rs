//! Hybrid retrieval over a realistic product corpus

mod common;

use askflow::config::Config;
use askflow::lexicon::Lexicon;
use askflow::provider::{ModelError, ModelProvider};
use askflow::retrieval::{
    CallerIdentity, ChunkIndex, ChunkRecord, ChunkSource, HybridRetriever, JsonlChunkSource,
    RetrievalRequest, Scope,
};
use askflow::tier::TierProfile;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::TempDir;

fn retriever(embedder: Arc<dyn ModelProvider>) -> HybridRetriever {
    let lexicon = Arc::new(Lexicon::builtin().unwrap());
    HybridRetriever::new(lexicon, embedder, Config::default().retrieval).unwrap()
}

fn public() -> BTreeSet<Scope> {
    BTreeSet::from([Scope::Public])
}

fn index() -> ChunkIndex {
    ChunkIndex::build(common::corpus(), &Config::default().retrieval)
}

#[tokio::test]
async fn test_exact_product_code_ranks_first() {
    let retriever = retriever(common::CountingProvider::new());
    let index = index();

    let result = retriever
        .retrieve(&index, &RetrievalRequest::new("MXJ6-10 的行程規格", public(), 3))
        .await;

    assert_eq!(result.identifiers, vec!["MXJ6-10".to_string()]);
    assert!(result.has_exact_hit());
    let top = &result.chunks[0];
    assert_eq!(top.chunk.id, "mxj-1");
    assert!(top.is_exact());
    assert!(result.lane_errors.is_empty());
}

#[tokio::test]
async fn test_scopes_limit_visible_chunks() {
    let retriever = retriever(common::CountingProvider::new());
    let index = index();

    let result = retriever
        .retrieve(&index, &RetrievalRequest::new("MXJ6-10", public(), 10))
        .await;
    let ids = result.chunk_ids();
    assert!(ids.contains(&"mxj-1"));
    assert!(!ids.contains(&"sales-1"));
    assert!(!ids.contains(&"notes-1"));

    let caller = CallerIdentity::new(Some("u1".to_string()), Some("sales".to_string()));
    let result = retriever
        .retrieve(
            &index,
            &RetrievalRequest::new("MXJ6-10", caller.accessible_scopes(), 10),
        )
        .await;
    let ids = result.chunk_ids();
    assert!(ids.contains(&"sales-1"));
    assert!(ids.contains(&"notes-1"));
}

#[tokio::test]
async fn test_empty_scope_returns_nothing() {
    let retriever = retriever(common::CountingProvider::new());
    let index = index();

    let scopes = BTreeSet::from([Scope::Personal("nobody".to_string())]);
    let result = retriever
        .retrieve(&index, &RetrievalRequest::new("MXJ6-10", scopes, 5))
        .await;

    assert!(result.is_empty());
    assert_eq!(result.confidence(), 0.0);
    // Identifiers are still reported for tier selection
    assert_eq!(result.identifiers, vec!["MXJ6-10".to_string()]);
}

#[tokio::test]
async fn test_sparse_lane_without_identifiers() {
    let retriever = retriever(common::CountingProvider::new());
    let index = index();

    let result = retriever
        .retrieve(&index, &RetrievalRequest::new("電磁閥線圈過熱怎麼辦", public(), 3))
        .await;

    assert!(!result.has_exact_hit());
    assert_eq!(result.chunks[0].chunk.id, "sy-1");
    assert!(result.chunks[0].lanes.sparse.is_some());
}

#[tokio::test]
async fn test_jsonl_source_skips_malformed_lines() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("chunks.jsonl");
    common::write_corpus(&path, &common::corpus());
    let mut content = std::fs::read_to_string(&path).unwrap();
    content.push_str("\n{not json}\n\n");
    std::fs::write(&path, content).unwrap();

    let source = JsonlChunkSource::new(&path);
    let records = source.load().await.unwrap();
    assert_eq!(records.len(), common::corpus().len());
    assert!(source.describe().starts_with("jsonl:"));

    let missing = JsonlChunkSource::new(temp.path().join("missing.jsonl"));
    assert!(missing.load().await.is_err());
}

/// Embeds every text as the same unit vector
struct FixedEmbedder;

#[async_trait]
impl ModelProvider for FixedEmbedder {
    async fn generate(&self, _prompt: &str, _profile: &TierProfile) -> Result<String, ModelError> {
        Err(ModelError::Unsupported("generation".to_string()))
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ModelError> {
        Ok(vec![1.0, 0.0, 0.0])
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

#[tokio::test]
async fn test_dense_lane_finds_semantic_match() {
    let record = |id: &str, text: &str, embedding: Vec<f32>| ChunkRecord {
        id: id.to_string(),
        doc_id: id.to_string(),
        doc_name: None,
        modified_at: None,
        scope: Scope::Public,
        text: text.to_string(),
        embedding: Some(embedding),
    };
    let index = ChunkIndex::build(
        vec![
            record("aligned", "pneumatic actuator overview", vec![0.9, 0.1, 0.0]),
            record("orthogonal", "shipping schedule", vec![0.0, 0.0, 1.0]),
        ],
        &Config::default().retrieval,
    );

    let retriever = retriever(Arc::new(FixedEmbedder));
    let result = retriever
        .retrieve(&index, &RetrievalRequest::new("air cylinder", public(), 2))
        .await;

    assert_eq!(result.chunks[0].chunk.id, "aligned");
    assert!(result.chunks[0].lanes.dense.is_some());
    assert!(result.chunks[0].lanes.sparse.is_none());
}

#[tokio::test]
async fn test_failing_dense_lane_is_reported() {
    let record = ChunkRecord {
        id: "c1".to_string(),
        doc_id: "d1".to_string(),
        doc_name: None,
        modified_at: None,
        scope: Scope::Public,
        text: "MXH10-20 滑台氣缸".to_string(),
        embedding: Some(vec![0.5, 0.5]),
    };
    let index = ChunkIndex::build(vec![record], &Config::default().retrieval);

    // CountingProvider cannot embed, so only the dense lane fails
    let retriever = retriever(common::CountingProvider::new());
    let result = retriever
        .retrieve(&index, &RetrievalRequest::new("MXH10-20", public(), 2))
        .await;

    assert_eq!(result.chunks.len(), 1);
    assert_eq!(result.lane_errors.len(), 1);
    assert!(result.lane_errors[0].starts_with("dense:"));
}
