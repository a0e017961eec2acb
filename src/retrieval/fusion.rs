//! Reciprocal Rank Fusion across the exact, sparse and dense lanes

use crate::retrieval::{ChunkIndex, LaneHit, LaneScores};
use std::cmp::Ordering;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FusionError {
    #[error("Invalid weight configuration: lane weights must be positive")]
    InvalidWeights,

    #[error("Exact override weight {weight} must exceed the fused score ceiling {ceiling}")]
    OverrideTooSmall { weight: f32, ceiling: f32 },
}

/// Configuration for fusion algorithm
#[derive(Debug, Clone)]
pub struct FusionConfig {
    /// RRF K constant (typically 60)
    pub rrf_k: f32,

    pub exact_weight: f32,
    pub sparse_weight: f32,
    pub dense_weight: f32,

    /// Lift added to every exact-lane hit
    pub exact_override_weight: f32,
}

impl FusionConfig {
    pub fn new(
        rrf_k: f32,
        exact_weight: f32,
        sparse_weight: f32,
        dense_weight: f32,
        exact_override_weight: f32,
    ) -> Result<Self, FusionError> {
        if exact_weight <= 0.0 || sparse_weight <= 0.0 || dense_weight <= 0.0 {
            return Err(FusionError::InvalidWeights);
        }

        let config = Self {
            rrf_k,
            exact_weight,
            sparse_weight,
            dense_weight,
            exact_override_weight,
        };

        let ceiling = config.score_ceiling();
        if exact_override_weight <= ceiling {
            return Err(FusionError::OverrideTooSmall {
                weight: exact_override_weight,
                ceiling,
            });
        }

        Ok(config)
    }

    /// Highest fused score a chunk can reach without the exact lift
    pub fn score_ceiling(&self) -> f32 {
        (self.exact_weight + self.sparse_weight + self.dense_weight) / (self.rrf_k + 1.0)
    }

    fn rrf(&self, weight: f32, rank: usize) -> f32 {
        weight / (self.rrf_k + rank as f32 + 1.0)
    }
}

/// Candidate after fusion, keyed by its position in the chunk index
#[derive(Debug, Clone, PartialEq)]
pub struct FusedCandidate {
    pub idx: usize,
    pub score: f32,
    pub lanes: LaneScores,
}

impl FusedCandidate {
    pub fn is_exact(&self) -> bool {
        self.lanes.exact.is_some()
    }
}

/// Apply weighted Reciprocal Rank Fusion to the three lane rankings
///
/// RRF formula: score(id) = sum over lanes of: weight / (k + rank + 1)
///
/// Every exact-lane hit additionally receives `exact_override_weight`, which
/// exceeds any score reachable without it, so exact hits form the top band.
///
/// # Returns
/// Fused candidates in final order (see [`fused_order`])
pub fn reciprocal_rank_fusion(
    index: &ChunkIndex,
    exact: &[(usize, f32)],
    sparse: &[(usize, f32)],
    dense: &[(usize, f32)],
    config: &FusionConfig,
) -> Vec<FusedCandidate> {
    let mut fused: HashMap<usize, FusedCandidate> = HashMap::new();

    let lanes: [(&[(usize, f32)], f32); 3] = [
        (exact, config.exact_weight),
        (sparse, config.sparse_weight),
        (dense, config.dense_weight),
    ];

    for (lane_no, (ranking, weight)) in lanes.iter().enumerate() {
        for (rank, (idx, raw)) in ranking.iter().enumerate() {
            let entry = fused.entry(*idx).or_insert_with(|| FusedCandidate {
                idx: *idx,
                score: 0.0,
                lanes: LaneScores::default(),
            });
            entry.score += config.rrf(*weight, rank);

            let hit = Some(LaneHit { rank, score: *raw });
            match lane_no {
                0 => {
                    entry.lanes.exact = hit;
                    entry.score += config.exact_override_weight;
                }
                1 => entry.lanes.sparse = hit,
                _ => entry.lanes.dense = hit,
            }
        }
    }

    let mut results: Vec<FusedCandidate> = fused.into_values().collect();
    results.sort_by(|a, b| fused_order(index, a, b));
    results
}

/// Final ordering: fused score desc, newest document first, then chunk id
pub fn fused_order(index: &ChunkIndex, a: &FusedCandidate, b: &FusedCandidate) -> Ordering {
    let (ca, cb) = (index.chunk(a.idx), index.chunk(b.idx));
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| cb.modified_at.cmp(&ca.modified_at))
        .then_with(|| ca.id.cmp(&cb.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::retrieval::{ChunkRecord, Scope};
    use chrono::{TimeZone, Utc};

    fn index(n: usize) -> ChunkIndex {
        let records = (0..n)
            .map(|i| ChunkRecord {
                id: format!("c{}", i),
                doc_id: format!("d{}", i),
                doc_name: None,
                modified_at: Some(Utc.with_ymd_and_hms(2024, 1, 1 + i as u32, 0, 0, 0).unwrap()),
                scope: Scope::Public,
                text: String::new(),
                embedding: None,
            })
            .collect();
        ChunkIndex::build(records, &Config::default().retrieval)
    }

    fn config() -> FusionConfig {
        FusionConfig::new(60.0, 1.0, 1.0, 1.0, 1.0).unwrap()
    }

    #[test]
    fn test_rrf_basic() {
        let index = index(5);
        let sparse = vec![(1, 9.0), (2, 8.0), (3, 7.0)];
        let dense = vec![(2, 0.95), (1, 0.85), (4, 0.75)];

        let fused = reciprocal_rank_fusion(&index, &[], &sparse, &dense, &config());

        assert_eq!(fused.len(), 4);
        // 1 and 2 appear in both lanes and tie; the newer document wins
        assert_eq!(fused[0].idx, 2);
        assert_eq!(fused[1].idx, 1);
    }

    #[test]
    fn test_exact_hits_form_top_band() {
        let index = index(5);
        // Chunk 4 is last in every other lane but carries an exact hit
        let exact = vec![(4, 1.0)];
        let sparse = vec![(0, 9.0), (1, 8.0), (4, 1.0)];
        let dense = vec![(0, 0.99), (1, 0.9), (4, 0.1)];

        let fused = reciprocal_rank_fusion(&index, &exact, &sparse, &dense, &config());
        assert_eq!(fused[0].idx, 4);
        assert!(fused[0].is_exact());
        assert!(fused[0].lanes.sparse.is_some());
    }

    #[test]
    fn test_rrf_weighted() {
        let index = index(3);
        let weighted = FusionConfig::new(60.0, 1.0, 0.3, 0.7, 1.0).unwrap();
        let fused = reciprocal_rank_fusion(&index, &[], &[(1, 5.0)], &[(0, 0.9)], &weighted);
        assert_eq!(fused[0].idx, 0);
    }

    #[test]
    fn test_deterministic_order() {
        let index = index(6);
        let sparse = vec![(5, 1.0), (3, 1.0), (1, 1.0)];
        let dense = vec![(1, 0.5), (3, 0.5), (5, 0.5)];

        let a = reciprocal_rank_fusion(&index, &[], &sparse, &dense, &config());
        let b = reciprocal_rank_fusion(&index, &[], &sparse, &dense, &config());
        assert_eq!(a, b);
    }

    #[test]
    fn test_invalid_configuration() {
        assert_eq!(
            FusionConfig::new(60.0, 0.0, 1.0, 1.0, 1.0).unwrap_err(),
            FusionError::InvalidWeights
        );
        assert!(matches!(
            FusionConfig::new(60.0, 1.0, 1.0, 1.0, 0.01),
            Err(FusionError::OverrideTooSmall { .. })
        ));
    }
}
