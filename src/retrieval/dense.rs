//! Dense lane: cosine similarity over precomputed chunk embeddings
//!
//! Small scoped sets are scanned exactly. Large corpora additionally get an
//! HNSW graph, which is used when the scoped set is too big to scan.

use crate::config::RetrievalConfig;
use crate::retrieval::{Chunk, ChunkIndex};
use hnsw_rs::prelude::*;
use std::sync::Arc;

/// How the dense lane searches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenseMode {
    /// No chunk carries an embedding
    Disabled,
    Exact,
    Approximate,
}

/// Dense search structure built alongside the chunk index
pub struct DenseIndex {
    hnsw: Option<Hnsw<'static, f32, DistCosine>>,
    dimension: Option<usize>,
    ann_threshold: usize,
    ef_search: usize,
}

/// Cosine similarity; zero when either vector has no magnitude
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut na = 0.0f32;
    let mut nb = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        na += x * x;
        nb += y * y;
    }
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na.sqrt() * nb.sqrt())
}

impl DenseIndex {
    pub fn empty() -> Self {
        Self {
            hnsw: None,
            dimension: None,
            ann_threshold: usize::MAX,
            ef_search: 0,
        }
    }

    /// Build from chunks, taking the most common embedding length as the dimension
    pub fn build(chunks: &[Arc<Chunk>], config: &RetrievalConfig) -> Self {
        let dimension = dominant_dimension(chunks);
        let Some(dim) = dimension else {
            return Self {
                ann_threshold: config.ann_threshold,
                ef_search: config.hnsw_ef_search,
                ..Self::empty()
            };
        };

        let embedded: Vec<(usize, &Vec<f32>)> = chunks
            .iter()
            .enumerate()
            .filter_map(|(idx, c)| c.embedding.as_ref().map(|e| (idx, e)))
            .filter(|(_, e)| e.len() == dim)
            .collect();

        let skipped = chunks.iter().filter(|c| c.embedding.is_some()).count() - embedded.len();
        if skipped > 0 {
            tracing::warn!(skipped, dimension = dim, "Skipping chunks with mismatched embedding dimension");
        }

        let hnsw = (embedded.len() > config.ann_threshold).then(|| {
            let hnsw = Hnsw::<f32, DistCosine>::new(
                config.hnsw_m,
                embedded.len(),
                16,
                config.hnsw_ef_construction,
                DistCosine,
            );
            for (idx, embedding) in &embedded {
                hnsw.insert((embedding.as_slice(), *idx));
            }
            hnsw
        });

        Self {
            hnsw,
            dimension,
            ann_threshold: config.ann_threshold,
            ef_search: config.hnsw_ef_search,
        }
    }

    pub fn mode(&self) -> DenseMode {
        match (&self.dimension, &self.hnsw) {
            (None, _) => DenseMode::Disabled,
            (Some(_), None) => DenseMode::Exact,
            (Some(_), Some(_)) => DenseMode::Approximate,
        }
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    /// Top `limit` scoped chunks by cosine similarity to `query`
    pub fn search(
        &self,
        index: &ChunkIndex,
        scoped: &[usize],
        query: &[f32],
        limit: usize,
        min_similarity: f32,
    ) -> Vec<(usize, f32)> {
        if self.dimension != Some(query.len()) || scoped.is_empty() || limit == 0 {
            return Vec::new();
        }

        let mut hits = match &self.hnsw {
            Some(hnsw) if scoped.len() > self.ann_threshold => {
                self.search_approximate(hnsw, index, scoped, query, limit)
            }
            _ => Self::search_exact(index, scoped, query),
        };

        hits.retain(|(_, score)| *score >= min_similarity);
        hits.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| index.chunk(a.0).id.cmp(&index.chunk(b.0).id))
        });
        hits.truncate(limit);
        hits
    }

    fn search_exact(index: &ChunkIndex, scoped: &[usize], query: &[f32]) -> Vec<(usize, f32)> {
        scoped
            .iter()
            .filter_map(|&idx| {
                let embedding = index.chunk(idx).embedding.as_ref()?;
                (embedding.len() == query.len()).then(|| (idx, cosine_similarity(query, embedding)))
            })
            .collect()
    }

    fn search_approximate(
        &self,
        hnsw: &Hnsw<'static, f32, DistCosine>,
        index: &ChunkIndex,
        scoped: &[usize],
        query: &[f32],
        limit: usize,
    ) -> Vec<(usize, f32)> {
        // Over-fetch so post-filtering by scope still leaves enough hits
        let fetch = (limit * 4).max(limit + 32).min(index.len());
        let ef = self.ef_search.max(fetch);
        let mut in_scope = vec![false; index.len()];
        for &idx in scoped {
            in_scope[idx] = true;
        }

        hnsw.search(query, fetch, ef)
            .into_iter()
            .filter(|n| n.d_id < in_scope.len() && in_scope[n.d_id])
            .map(|n| (n.d_id, 1.0 - n.distance))
            .collect()
    }
}

fn dominant_dimension(chunks: &[Arc<Chunk>]) -> Option<usize> {
    let mut counts: std::collections::BTreeMap<usize, usize> = std::collections::BTreeMap::new();
    for chunk in chunks {
        if let Some(e) = &chunk.embedding {
            if !e.is_empty() {
                *counts.entry(e.len()).or_insert(0) += 1;
            }
        }
    }
    counts
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(&a.0)))
        .map(|(dim, _)| dim)
}
