//! Hybrid search combining exact, sparse and dense lanes

use crate::config::RetrievalConfig;
use crate::error::{AskflowError, Result};
use crate::lexicon::Lexicon;
use crate::provider::ModelProvider;
use crate::retrieval::{
    bm25_lane, deduplicate_candidates, exact_lane, reciprocal_rank_fusion, tokenize, Bm25Params,
    ChunkIndex, FusedCandidate, FusionConfig, RerankError, Reranker, RetrievalRequest,
    RetrievalResult, RetrievedChunk,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Hybrid retriever over a [`ChunkIndex`]
pub struct HybridRetriever {
    lexicon: Arc<Lexicon>,
    embedder: Arc<dyn ModelProvider>,
    reranker: Option<Arc<dyn Reranker>>,
    fusion: FusionConfig,
    config: RetrievalConfig,
}

impl HybridRetriever {
    /// Create a new hybrid retriever
    pub fn new(
        lexicon: Arc<Lexicon>,
        embedder: Arc<dyn ModelProvider>,
        config: RetrievalConfig,
    ) -> Result<Self> {
        let fusion = FusionConfig::new(
            config.rrf_k,
            config.exact_weight,
            config.sparse_weight,
            config.dense_weight,
            config.exact_override_weight,
        )
        .map_err(|e| AskflowError::Config(e.to_string()))?;

        Ok(Self {
            lexicon,
            embedder,
            reranker: None,
            fusion,
            config,
        })
    }

    /// Attach a cross-encoder for head reranking
    pub fn with_reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn has_reranker(&self) -> bool {
        self.reranker.is_some()
    }

    /// Retrieve the top chunks for a request
    ///
    /// Never fails: a failing lane contributes nothing and is reported in
    /// `lane_errors`, and an empty scoped corpus yields an empty result.
    pub async fn retrieve(&self, index: &ChunkIndex, request: &RetrievalRequest) -> RetrievalResult {
        let identifiers: Vec<String> = self
            .lexicon
            .extract_identifiers(&request.query)
            .into_iter()
            .map(|id| id.canonical)
            .collect();

        let scoped = index.scoped(&request.scopes);
        if scoped.is_empty() || request.top_n == 0 {
            tracing::debug!(scopes = request.scopes.len(), "No chunks in scope");
            return RetrievalResult {
                identifiers,
                ..RetrievalResult::empty(request.scopes.clone())
            };
        }

        let search_limit = request.top_n * self.config.search_multiplier.max(1);

        // Step 1: Run all lanes, fusion waits for every one of them
        let (exact, sparse, dense) = tokio::join!(
            async { exact_lane(index, &scoped, &identifiers) },
            async { self.sparse_search(index, &scoped, &request.query, search_limit) },
            self.dense_search(index, &scoped, &request.query, search_limit)
        );

        let mut lane_errors = Vec::new();
        let dense = dense.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Dense lane failed, continuing without it");
            lane_errors.push(format!("dense: {}", e));
            Vec::new()
        });

        tracing::debug!(
            exact = exact.len(),
            sparse = sparse.len(),
            dense = dense.len(),
            "Lane results"
        );

        // Step 2: Reciprocal Rank Fusion with exact-band lift
        let fused = reciprocal_rank_fusion(index, &exact, &sparse, &dense, &self.fusion);

        // Step 3: Deduplicate by chunk id
        let fused = deduplicate_candidates(index, fused);

        // Step 4: Rerank the head if enabled
        let (mut ranked, rerank_scores) = match &self.reranker {
            Some(reranker) if fused.len() > 1 => {
                match self.rerank_head(reranker, index, &request.query, fused.clone()).await {
                    Ok(reranked) => reranked,
                    Err(e) => {
                        tracing::warn!(error = %e, "Reranking failed, keeping fused order");
                        (fused, HashMap::new())
                    }
                }
            }
            _ => (fused, HashMap::new()),
        };
        let reranked = !rerank_scores.is_empty();

        // Step 5: Bound to top-N and attach provenance
        ranked.truncate(request.top_n);
        let chunks = ranked
            .into_iter()
            .map(|candidate| {
                let mut chunk = RetrievedChunk::new(
                    Arc::clone(index.chunk(candidate.idx)),
                    candidate.score,
                    candidate.lanes,
                );
                chunk.rerank_score = rerank_scores.get(&candidate.idx).copied();
                chunk
            })
            .collect();

        RetrievalResult {
            chunks,
            scopes: request.scopes.clone(),
            identifiers,
            lane_errors,
            reranked,
        }
    }

    fn sparse_search(
        &self,
        index: &ChunkIndex,
        scoped: &[usize],
        query: &str,
        limit: usize,
    ) -> Vec<(usize, f32)> {
        let mut terms = tokenize(query);
        if self.config.enable_query_expansion {
            for expansion in self.lexicon.expand(query) {
                terms.extend(tokenize(&expansion));
            }
        }

        let params = Bm25Params {
            k1: self.config.bm25_k1,
            b: self.config.bm25_b,
        };
        bm25_lane(index, scoped, &terms, params, limit)
    }

    async fn dense_search(
        &self,
        index: &ChunkIndex,
        scoped: &[usize],
        query: &str,
        limit: usize,
    ) -> std::result::Result<Vec<(usize, f32)>, String> {
        if index.dense().dimension().is_none() || query.trim().is_empty() {
            return Ok(Vec::new());
        }

        let embedding = self
            .embedder
            .embed(query)
            .await
            .map_err(|e| e.to_string())?;

        if index.dense().dimension() != Some(embedding.len()) {
            return Err(format!(
                "query embedding has {} dimensions, index has {:?}",
                embedding.len(),
                index.dense().dimension()
            ));
        }

        Ok(index.dense().search(
            index,
            scoped,
            &embedding,
            limit,
            self.config.min_dense_similarity,
        ))
    }

    /// Rerank the first `rerank_candidates_limit` candidates
    ///
    /// The exact band and the remainder are reordered separately so exact
    /// hits stay on top; the tail keeps its fused order.
    async fn rerank_head(
        &self,
        reranker: &Arc<dyn Reranker>,
        index: &ChunkIndex,
        query: &str,
        mut candidates: Vec<FusedCandidate>,
    ) -> std::result::Result<(Vec<FusedCandidate>, HashMap<usize, f32>), RerankError> {
        let head_len = self.config.rerank_candidates_limit.min(candidates.len());
        let tail = candidates.split_off(head_len);
        let (band, rest): (Vec<_>, Vec<_>) = candidates.into_iter().partition(|c| c.is_exact());

        let texts = |segment: &[FusedCandidate]| -> Vec<String> {
            segment
                .iter()
                .map(|c| index.chunk(c.idx).text.clone())
                .collect()
        };
        let band_texts = texts(&band);
        let rest_texts = texts(&rest);

        let reranker = Arc::clone(reranker);
        let query = query.to_string();
        let (band_scores, rest_scores) = tokio::task::spawn_blocking(move || {
            let band = reranker.score(&query, &band_texts)?;
            let rest = reranker.score(&query, &rest_texts)?;
            Ok::<_, RerankError>((band, rest))
        })
        .await
        .map_err(|e| RerankError::RerankingError(e.to_string()))??;

        let mut scores = HashMap::new();
        let mut ordered = Vec::with_capacity(head_len + tail.len());
        for (segment, seg_scores) in [(band, band_scores), (rest, rest_scores)] {
            if seg_scores.len() != segment.len() {
                return Err(RerankError::RerankingError(format!(
                    "expected {} scores, got {}",
                    segment.len(),
                    seg_scores.len()
                )));
            }
            let mut paired: Vec<(FusedCandidate, f32)> = segment.into_iter().zip(seg_scores).collect();
            // Stable sort keeps fused order on equal scores
            paired.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
            for (candidate, score) in paired {
                scores.insert(candidate.idx, score);
                ordered.push(candidate);
            }
        }
        ordered.extend(tail);

        Ok((ordered, scores))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::provider::LocalProvider;
    use crate::retrieval::{ChunkRecord, Scope};
    use std::collections::BTreeSet;

    struct ReverseReranker;

    impl Reranker for ReverseReranker {
        fn score(&self, _query: &str, candidates: &[String]) -> std::result::Result<Vec<f32>, RerankError> {
            // Later candidates score higher
            Ok((0..candidates.len()).map(|i| i as f32).collect())
        }

        fn model_name(&self) -> &str {
            "reverse"
        }
    }

    struct BrokenReranker;

    impl Reranker for BrokenReranker {
        fn score(&self, _query: &str, _candidates: &[String]) -> std::result::Result<Vec<f32>, RerankError> {
            Err(RerankError::RerankingError("model crashed".to_string()))
        }

        fn model_name(&self) -> &str {
            "broken"
        }
    }

    fn corpus() -> ChunkIndex {
        let texts = [
            ("c0", "電磁閥 安裝 注意事項 電磁閥 配線"),
            ("c1", "電磁閥 規格 一覽"),
            ("c2", "型號 SY5120 電磁閥 說明"),
            ("c3", "氣缸 行程"),
        ];
        let records = texts
            .iter()
            .map(|(id, text)| ChunkRecord {
                id: id.to_string(),
                doc_id: format!("doc-{}", id),
                doc_name: None,
                modified_at: None,
                scope: Scope::Public,
                text: text.to_string(),
                embedding: None,
            })
            .collect();
        ChunkIndex::build(records, &Config::default().retrieval)
    }

    fn retriever() -> HybridRetriever {
        let lexicon = Arc::new(Lexicon::builtin().unwrap());
        let mut config = Config::default().retrieval;
        config.enable_query_expansion = false;
        HybridRetriever::new(lexicon, Arc::new(LocalProvider::extractive_only()), config).unwrap()
    }

    fn public() -> BTreeSet<Scope> {
        BTreeSet::from([Scope::Public])
    }

    #[tokio::test]
    async fn test_exact_hit_leads_result() {
        let index = corpus();
        let request = RetrievalRequest::new("SY5120 電磁閥", public(), 3);
        let result = retriever().retrieve(&index, &request).await;

        assert_eq!(result.chunks[0].chunk.id, "c2");
        assert!(result.chunks[0].is_exact());
        assert_eq!(result.confidence(), 1.0);
        assert_eq!(result.identifiers, vec!["SY5120".to_string()]);
    }

    #[tokio::test]
    async fn test_rerank_keeps_exact_band() {
        let index = corpus();
        let retriever = retriever().with_reranker(Arc::new(ReverseReranker));
        let request = RetrievalRequest::new("SY5120 電磁閥", public(), 3);
        let result = retriever.retrieve(&index, &request).await;

        assert!(result.reranked);
        assert_eq!(result.chunks[0].chunk.id, "c2");
        // Non-exact candidates are reversed relative to fused order
        let plain = retriever_without_rerank(&index, &request).await;
        assert_eq!(result.chunks[1].chunk.id, plain.last().cloned().unwrap());
    }

    async fn retriever_without_rerank(index: &ChunkIndex, request: &RetrievalRequest) -> Vec<String> {
        retriever()
            .retrieve(index, request)
            .await
            .chunks
            .iter()
            .filter(|c| !c.is_exact())
            .map(|c| c.chunk.id.clone())
            .collect()
    }

    #[tokio::test]
    async fn test_rerank_failure_keeps_fused_order() {
        let index = corpus();
        let request = RetrievalRequest::new("電磁閥", public(), 3);

        let plain = retriever().retrieve(&index, &request).await;
        let broken = retriever()
            .with_reranker(Arc::new(BrokenReranker))
            .retrieve(&index, &request)
            .await;

        assert!(!broken.reranked);
        assert_eq!(plain.chunk_ids(), broken.chunk_ids());
    }

    #[tokio::test]
    async fn test_empty_scope_is_empty_result() {
        let index = corpus();
        let scopes = BTreeSet::from([Scope::Personal("nobody".to_string())]);
        let result = retriever()
            .retrieve(&index, &RetrievalRequest::new("電磁閥", scopes, 5))
            .await;
        assert!(result.is_empty());
        assert!(result.lane_errors.is_empty());
    }

    #[tokio::test]
    async fn test_sparse_only_confidence() {
        let index = corpus();
        let result = retriever()
            .retrieve(&index, &RetrievalRequest::new("電磁閥", public(), 5))
            .await;
        assert_eq!(result.chunks.len(), 3);
        assert_eq!(result.confidence(), 0.5);
    }
}
