//! Provenance tracking and retrieved chunk structures

use crate::retrieval::{Chunk, Scope};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Where a chunk came from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// Source document id
    pub doc_id: String,

    /// Human readable document name
    pub doc_name: String,

    /// Visibility scope of the document
    pub scope: Scope,

    /// Last modification time of the document
    pub modified_at: DateTime<Utc>,
}

impl Provenance {
    pub fn of(chunk: &Chunk) -> Self {
        Self {
            doc_id: chunk.doc_id.clone(),
            doc_name: chunk.doc_name.clone(),
            scope: chunk.scope.clone(),
            modified_at: chunk.modified_at,
        }
    }
}

/// Position and raw score of a chunk within one lane
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LaneHit {
    /// Zero-based rank in the lane
    pub rank: usize,
    pub score: f32,
}

/// Per-lane evidence for a fused chunk
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LaneScores {
    /// Number of query identifiers the chunk contains
    pub exact: Option<LaneHit>,
    /// BM25 score
    pub sparse: Option<LaneHit>,
    /// Cosine similarity
    pub dense: Option<LaneHit>,
}

/// A fused chunk with scores and full provenance
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk: Arc<Chunk>,

    /// Fused score including the exact-band lift
    pub fused_score: f32,

    pub lanes: LaneScores,

    /// Cross-encoder score when the chunk went through reranking
    pub rerank_score: Option<f32>,

    pub provenance: Provenance,
}

impl RetrievedChunk {
    pub fn new(chunk: Arc<Chunk>, fused_score: f32, lanes: LaneScores) -> Self {
        let provenance = Provenance::of(&chunk);
        Self {
            chunk,
            fused_score,
            lanes,
            rerank_score: None,
            provenance,
        }
    }

    /// Whether the chunk sits in the exact-match band
    pub fn is_exact(&self) -> bool {
        self.lanes.exact.is_some()
    }

    /// Get a short preview of the text (first N characters)
    pub fn preview(&self, max_chars: usize) -> String {
        let text = &self.chunk.text;
        if text.chars().count() <= max_chars {
            text.clone()
        } else {
            let cut: String = text.chars().take(max_chars).collect();
            format!("{}...", cut)
        }
    }
}

/// What kind of material a source reference points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Document,
    BusinessData,
}

/// Citation returned with an answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub kind: SourceKind,
    pub doc_id: String,
    pub doc_name: String,
    pub scope: String,
    pub preview: String,
    pub score: f32,
}

impl SourceRef {
    pub fn from_chunk(retrieved: &RetrievedChunk, preview_chars: usize) -> Self {
        Self {
            kind: SourceKind::Document,
            doc_id: retrieved.provenance.doc_id.clone(),
            doc_name: retrieved.provenance.doc_name.clone(),
            scope: retrieved.provenance.scope.to_string(),
            preview: retrieved.preview(preview_chars),
            score: retrieved.rerank_score.unwrap_or(retrieved.fused_score),
        }
    }

    pub fn business_data(name: &str, summary: String) -> Self {
        Self {
            kind: SourceKind::BusinessData,
            doc_id: "business_data".to_string(),
            doc_name: name.to_string(),
            scope: "business".to_string(),
            preview: summary,
            score: 1.0,
        }
    }
}

/// One reference per document, in result order, at most `max_sources`
pub fn distinct_sources(chunks: &[RetrievedChunk], max_sources: usize, preview_chars: usize) -> Vec<SourceRef> {
    let mut seen = std::collections::HashSet::new();
    chunks
        .iter()
        .filter(|c| seen.insert(c.provenance.doc_id.as_str()))
        .take(max_sources)
        .map(|c| SourceRef::from_chunk(c, preview_chars))
        .collect()
}
