//! Hybrid retrieval over the scoped chunk corpus
//!
//! Three lanes (exact identifier match, BM25, dense cosine) run side by side
//! and are combined with weighted Reciprocal Rank Fusion. Exact identifier
//! hits are lifted into a top band that no other evidence can displace.

mod corpus;
mod deduplication;
mod dense;
mod exact;
mod fusion;
mod hybrid;
mod provenance;
mod reranker;
mod sparse;

pub use corpus::{
    tokenize, Chunk, ChunkIndex, ChunkRecord, ChunkSource, IndexStats, JsonlChunkSource,
    ScopeCounts, TermStats,
};
pub use deduplication::deduplicate_candidates;
pub use dense::{cosine_similarity, DenseIndex, DenseMode};
pub use exact::exact_lane;
pub use fusion::{fused_order, reciprocal_rank_fusion, FusedCandidate, FusionConfig, FusionError};
pub use hybrid::HybridRetriever;
pub use provenance::{
    distinct_sources, LaneHit, LaneScores, Provenance, RetrievedChunk, SourceKind, SourceRef,
};
pub use reranker::{FastEmbedReranker, RerankError, Reranker};
pub use sparse::{bm25_lane, Bm25Params};

use crate::classifier::{Classification, Domain};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;

/// Visibility scope of a chunk
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "lowercase")]
pub enum Scope {
    Public,
    Department(String),
    Personal(String),
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Public => f.write_str("public"),
            Self::Department(name) => write!(f, "department:{}", name),
            Self::Personal(user) => write!(f, "personal:{}", user),
        }
    }
}

/// Who is asking; decides which scopes are searchable
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub user_id: Option<String>,
    pub department: Option<String>,
}

impl CallerIdentity {
    pub fn new(user_id: Option<String>, department: Option<String>) -> Self {
        Self {
            user_id,
            department,
        }
    }

    /// Every scope this caller may read
    pub fn accessible_scopes(&self) -> BTreeSet<Scope> {
        let mut scopes = BTreeSet::new();
        scopes.insert(Scope::Public);
        if let Some(dept) = &self.department {
            scopes.insert(Scope::Department(dept.clone()));
        }
        if let Some(user) = &self.user_id {
            scopes.insert(Scope::Personal(user.clone()));
        }
        scopes
    }

    /// Scopes searched for a classification
    ///
    /// Business questions read no documents. Mixed questions search every
    /// accessible scope.
    pub fn scopes_for(&self, classification: &Classification) -> BTreeSet<Scope> {
        let mut scopes = BTreeSet::new();
        match classification.domain {
            Domain::Technical => {
                scopes.insert(Scope::Public);
                if let Some(dept) = &self.department {
                    scopes.insert(Scope::Department(dept.clone()));
                }
            }
            Domain::Personal => {
                if let Some(user) = &self.user_id {
                    scopes.insert(Scope::Personal(user.clone()));
                }
            }
            Domain::Mixed => scopes = self.accessible_scopes(),
            Domain::Business => {}
        }
        scopes
    }
}

/// One retrieval call
#[derive(Debug, Clone)]
pub struct RetrievalRequest {
    pub query: String,
    pub scopes: BTreeSet<Scope>,
    pub top_n: usize,
}

impl RetrievalRequest {
    pub fn new(query: impl Into<String>, scopes: BTreeSet<Scope>, top_n: usize) -> Self {
        Self {
            query: query.into(),
            scopes,
            top_n,
        }
    }
}

/// Ranked, deduplicated chunks for one query
#[derive(Debug, Clone, Default)]
pub struct RetrievalResult {
    pub chunks: Vec<RetrievedChunk>,
    pub scopes: BTreeSet<Scope>,
    /// Canonical identifiers recognized in the query
    pub identifiers: Vec<String>,
    /// Lanes that failed and contributed nothing
    pub lane_errors: Vec<String>,
    pub reranked: bool,
}

impl RetrievalResult {
    pub fn empty(scopes: BTreeSet<Scope>) -> Self {
        Self {
            scopes,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn has_exact_hit(&self) -> bool {
        self.chunks.iter().any(|c| c.lanes.exact.is_some())
    }

    /// Evidence strength in [0, 1]
    pub fn confidence(&self) -> f32 {
        if self.chunks.is_empty() {
            return 0.0;
        }
        if self.has_exact_hit() {
            return 1.0;
        }
        let best_dense = self
            .chunks
            .iter()
            .filter_map(|c| c.lanes.dense.as_ref().map(|hit| hit.score))
            .fold(None, |best: Option<f32>, s| Some(best.map_or(s, |b| b.max(s))));
        match best_dense {
            Some(score) => score.clamp(0.0, 1.0),
            None => 0.5,
        }
    }

    /// Ordered chunk ids, used for cache fingerprints
    pub fn chunk_ids(&self) -> Vec<&str> {
        self.chunks.iter().map(|c| c.chunk.id.as_str()).collect()
    }

    /// Number of distinct source documents
    pub fn distinct_documents(&self) -> usize {
        self.chunks
            .iter()
            .map(|c| c.chunk.doc_id.as_str())
            .collect::<HashSet<_>>()
            .len()
    }
}
