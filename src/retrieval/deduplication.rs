//! Result deduplication by chunk ID

use crate::retrieval::{ChunkIndex, FusedCandidate};
use std::collections::HashSet;

/// Deduplicate candidates by chunk id, keeping the highest-scored instance
///
/// The corpus may carry the same chunk id more than once (re-ingested
/// documents). Input must already be in fused order.
///
/// # Returns
/// Deduplicated candidates, maintaining order
pub fn deduplicate_candidates(index: &ChunkIndex, candidates: Vec<FusedCandidate>) -> Vec<FusedCandidate> {
    let mut seen: HashSet<&str> = HashSet::new();

    candidates
        .into_iter()
        .filter(|candidate| seen.insert(index.chunk(candidate.idx).id.as_str()))
        .collect()
}
