//! Exact identifier lane

use crate::lexicon::contains_identifier;
use crate::retrieval::ChunkIndex;

/// Chunks containing any of the canonical identifiers
///
/// Score is the number of distinct identifiers found in the chunk. Ranking is
/// score desc, then newest document, then chunk id, so the lane is
/// deterministic.
pub fn exact_lane(index: &ChunkIndex, scoped: &[usize], identifiers: &[String]) -> Vec<(usize, f32)> {
    if identifiers.is_empty() {
        return Vec::new();
    }

    let mut hits: Vec<(usize, f32)> = scoped
        .iter()
        .filter_map(|&idx| {
            let chunk = index.chunk(idx);
            let matched = identifiers
                .iter()
                .filter(|id| contains_identifier(&chunk.compact, id))
                .count();
            (matched > 0).then_some((idx, matched as f32))
        })
        .collect();

    hits.sort_by(|a, b| {
        let (ca, cb) = (index.chunk(a.0), index.chunk(b.0));
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| cb.modified_at.cmp(&ca.modified_at))
            .then_with(|| ca.id.cmp(&cb.id))
    });

    hits
}
