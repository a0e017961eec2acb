//! BM25 sparse lane over the scoped corpus

use crate::retrieval::ChunkIndex;

/// BM25 saturation and length normalization
#[derive(Debug, Clone, Copy)]
pub struct Bm25Params {
    pub k1: f32,
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

/// Rank scoped chunks by BM25 against the query terms
///
/// Document frequencies and average length come from the scoped subset, so
/// one department's vocabulary does not skew another's ranking.
pub fn bm25_lane(
    index: &ChunkIndex,
    scoped: &[usize],
    query_terms: &[String],
    params: Bm25Params,
    limit: usize,
) -> Vec<(usize, f32)> {
    if scoped.is_empty() || query_terms.is_empty() || limit == 0 {
        return Vec::new();
    }

    let mut terms: Vec<&str> = query_terms.iter().map(|t| t.as_str()).collect();
    terms.sort_unstable();
    terms.dedup();

    let n = scoped.len() as f32;
    let total_len: u64 = scoped
        .iter()
        .map(|&idx| index.chunk(idx).terms.length as u64)
        .sum();
    let avgdl = (total_len as f32 / n).max(1.0);

    let idf: Vec<f32> = terms
        .iter()
        .map(|term| {
            let df = scoped
                .iter()
                .filter(|&&idx| index.chunk(idx).terms.tf(term) > 0)
                .count() as f32;
            (1.0 + (n - df + 0.5) / (df + 0.5)).ln()
        })
        .collect();

    let mut scored: Vec<(usize, f32)> = scoped
        .iter()
        .filter_map(|&idx| {
            let stats = &index.chunk(idx).terms;
            let dl = stats.length as f32;
            let norm = params.k1 * (1.0 - params.b + params.b * dl / avgdl);

            let score: f32 = terms
                .iter()
                .zip(&idf)
                .map(|(term, idf)| {
                    let tf = stats.tf(term) as f32;
                    if tf == 0.0 {
                        0.0
                    } else {
                        idf * tf * (params.k1 + 1.0) / (tf + norm)
                    }
                })
                .sum();

            (score > 0.0).then_some((idx, score))
        })
        .collect();

    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| index.chunk(a.0).id.cmp(&index.chunk(b.0).id))
    });
    scored.truncate(limit);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::retrieval::{tokenize, ChunkRecord, Scope};

    fn index(texts: &[&str]) -> ChunkIndex {
        let records = texts
            .iter()
            .enumerate()
            .map(|(i, text)| ChunkRecord {
                id: format!("c{}", i),
                doc_id: format!("d{}", i),
                doc_name: None,
                modified_at: None,
                scope: Scope::Public,
                text: text.to_string(),
                embedding: None,
            })
            .collect();
        ChunkIndex::build(records, &Config::default().retrieval)
    }

    fn all(index: &ChunkIndex) -> Vec<usize> {
        (0..index.len()).collect()
    }

    #[test]
    fn test_bm25_prefers_shorter_document() {
        let index = index(&[
            "gasket sheet material for flanges with many extra words about packing and assembly",
            "gasket sheet",
            "cylinder stroke",
        ]);
        let hits = bm25_lane(&index, &all(&index), &tokenize("gasket"), Bm25Params::default(), 10);

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, 1);
        assert!(hits[0].1 > hits[1].1);
    }

    #[test]
    fn test_length_normalization_switch() {
        let index = index(&[
            "gasket sheet material for flanges with many extra words about packing and assembly",
            "gasket sheet",
            "cylinder stroke",
        ]);
        let no_norm = Bm25Params { k1: 1.2, b: 0.0 };
        let hits = bm25_lane(&index, &all(&index), &tokenize("gasket"), no_norm, 10);

        // Without length normalization equal term counts score equally
        assert_eq!(hits.len(), 2);
        assert!((hits[0].1 - hits[1].1).abs() < 1e-6);
    }

    #[test]
    fn test_k1_controls_saturation() {
        let index = index(&["seal seal seal seal", "seal other words here", "unrelated text only"]);
        let terms = tokenize("seal");

        let low = bm25_lane(&index, &all(&index), &terms, Bm25Params { k1: 0.1, b: 0.0 }, 10);
        let high = bm25_lane(&index, &all(&index), &terms, Bm25Params { k1: 3.0, b: 0.0 }, 10);

        let ratio = |hits: &[(usize, f32)]| {
            let repeated = hits.iter().find(|h| h.0 == 0).map(|h| h.1).unwrap();
            let single = hits.iter().find(|h| h.0 == 1).map(|h| h.1).unwrap();
            repeated / single
        };
        // Higher k1 rewards repeated terms more
        assert!(ratio(&high) > ratio(&low));
    }

    #[test]
    fn test_cjk_bigram_matching() {
        let index = index(&["電磁閥的安裝方式", "氣缸行程規格"]);
        let hits = bm25_lane(&index, &all(&index), &tokenize("電磁閥安裝"), Bm25Params::default(), 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 0);
    }

    #[test]
    fn test_empty_scope() {
        let index = index(&["gasket"]);
        assert!(bm25_lane(&index, &[], &tokenize("gasket"), Bm25Params::default(), 10).is_empty());
    }
}
