//! Chunk corpus: on-disk records, tokenization and the in-memory index

use crate::config::RetrievalConfig;
use crate::error::{AskflowError, Result};
use crate::lexicon::compact_text;
use crate::retrieval::{DenseIndex, Scope};
use ahash::AHashMap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

/// One line of the chunk corpus file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: String,
    pub doc_id: String,
    #[serde(default)]
    pub doc_name: Option<String>,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
    pub scope: Scope,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// Sparse term statistics computed once per index build
#[derive(Debug, Clone, Default)]
pub struct TermStats {
    pub term_freqs: AHashMap<String, u32>,
    pub length: u32,
}

impl TermStats {
    pub fn from_text(text: &str) -> Self {
        let tokens = tokenize(text);
        let mut term_freqs = AHashMap::with_capacity(tokens.len());
        for token in &tokens {
            *term_freqs.entry(token.clone()).or_insert(0) += 1;
        }
        Self {
            term_freqs,
            length: tokens.len() as u32,
        }
    }

    pub fn tf(&self, term: &str) -> u32 {
        self.term_freqs.get(term).copied().unwrap_or(0)
    }
}

/// Unit of retrievable content
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub doc_id: String,
    pub doc_name: String,
    pub modified_at: DateTime<Utc>,
    pub scope: Scope,
    pub text: String,
    pub embedding: Option<Vec<f32>>,
    /// Uppercased text without whitespace, for identifier lookups
    pub compact: String,
    pub terms: TermStats,
}

impl Chunk {
    pub fn from_record(record: ChunkRecord) -> Self {
        let compact = compact_text(&record.text);
        let terms = TermStats::from_text(&record.text);
        Self {
            doc_name: record.doc_name.unwrap_or_else(|| record.doc_id.clone()),
            modified_at: record.modified_at.unwrap_or_default(),
            id: record.id,
            doc_id: record.doc_id,
            scope: record.scope,
            text: record.text,
            embedding: record.embedding,
            compact,
            terms,
        }
    }
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{3040}'..='\u{30FF}'
        | '\u{3400}'..='\u{4DBF}'
        | '\u{4E00}'..='\u{9FFF}'
        | '\u{F900}'..='\u{FAFF}'
        | '\u{AC00}'..='\u{D7AF}')
}

/// Split text into BM25 terms
///
/// ASCII alphanumeric runs become lowercase words. CJK runs become character
/// bigrams, or a unigram for a lone character.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    let mut cjk_run: Vec<char> = Vec::new();

    fn flush_cjk(run: &mut Vec<char>, tokens: &mut Vec<String>) {
        match run.len() {
            0 => {}
            1 => tokens.push(run[0].to_string()),
            _ => {
                for pair in run.windows(2) {
                    tokens.push(pair.iter().collect());
                }
            }
        }
        run.clear();
    }

    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            flush_cjk(&mut cjk_run, &mut tokens);
            word.push(c.to_ascii_lowercase());
        } else if is_cjk(c) {
            if !word.is_empty() {
                tokens.push(std::mem::take(&mut word));
            }
            cjk_run.push(c);
        } else {
            if !word.is_empty() {
                tokens.push(std::mem::take(&mut word));
            }
            flush_cjk(&mut cjk_run, &mut tokens);
        }
    }
    if !word.is_empty() {
        tokens.push(word);
    }
    flush_cjk(&mut cjk_run, &mut tokens);

    tokens
}

/// Documents and chunks held in one scope
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeCounts {
    pub documents: usize,
    pub chunks: usize,
}

/// Index summary for stats and reload reports
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub documents: usize,
    pub chunks: usize,
    pub embedded_chunks: usize,
    pub by_scope: BTreeMap<String, ScopeCounts>,
}

/// Read-only chunk index shared by all retrieval calls
pub struct ChunkIndex {
    chunks: Vec<Arc<Chunk>>,
    dense: DenseIndex,
    built_at: DateTime<Utc>,
}

impl ChunkIndex {
    /// Build the index from corpus records
    pub fn build(records: Vec<ChunkRecord>, config: &RetrievalConfig) -> Self {
        let chunks: Vec<Arc<Chunk>> = records
            .into_iter()
            .map(|record| Arc::new(Chunk::from_record(record)))
            .collect();
        let dense = DenseIndex::build(&chunks, config);

        tracing::info!(
            chunks = chunks.len(),
            dense_mode = ?dense.mode(),
            "Built chunk index"
        );

        Self {
            chunks,
            dense,
            built_at: Utc::now(),
        }
    }

    pub fn empty() -> Self {
        Self {
            chunks: Vec::new(),
            dense: DenseIndex::empty(),
            built_at: Utc::now(),
        }
    }

    pub fn chunks(&self) -> &[Arc<Chunk>] {
        &self.chunks
    }

    pub fn chunk(&self, idx: usize) -> &Arc<Chunk> {
        &self.chunks[idx]
    }

    pub fn dense(&self) -> &DenseIndex {
        &self.dense
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    /// Positions of chunks visible in the given scopes
    pub fn scoped(&self, scopes: &std::collections::BTreeSet<Scope>) -> Vec<usize> {
        self.chunks
            .iter()
            .enumerate()
            .filter(|(_, chunk)| scopes.contains(&chunk.scope))
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn stats(&self) -> IndexStats {
        let mut documents: HashSet<&str> = HashSet::new();
        let mut per_scope_docs: BTreeMap<String, HashSet<&str>> = BTreeMap::new();
        let mut by_scope: BTreeMap<String, ScopeCounts> = BTreeMap::new();

        for chunk in &self.chunks {
            let scope = chunk.scope.to_string();
            documents.insert(&chunk.doc_id);
            per_scope_docs
                .entry(scope.clone())
                .or_default()
                .insert(&chunk.doc_id);
            by_scope.entry(scope).or_default().chunks += 1;
        }
        for (scope, docs) in per_scope_docs {
            by_scope.entry(scope).or_default().documents = docs.len();
        }

        IndexStats {
            documents: documents.len(),
            chunks: self.chunks.len(),
            embedded_chunks: self
                .chunks
                .iter()
                .filter(|c| c.embedding.is_some())
                .count(),
            by_scope,
        }
    }
}

/// Supplier of chunk records for index builds
#[async_trait]
pub trait ChunkSource: Send + Sync {
    async fn load(&self) -> Result<Vec<ChunkRecord>>;

    /// Short description for logs
    fn describe(&self) -> String;
}

/// Chunk records stored one JSON object per line
pub struct JsonlChunkSource {
    path: PathBuf,
}

impl JsonlChunkSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ChunkSource for JsonlChunkSource {
    async fn load(&self) -> Result<Vec<ChunkRecord>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| AskflowError::Io {
                source: e,
                context: format!("Failed to read chunk corpus: {:?}", self.path),
            })?;

        let mut records = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<ChunkRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(line = line_no + 1, error = %e, "Skipping malformed chunk record");
                }
            }
        }

        Ok(records)
    }

    fn describe(&self) -> String {
        format!("jsonl:{}", self.path.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use tempfile::TempDir;

    fn record(id: &str, doc: &str, scope: Scope, text: &str) -> ChunkRecord {
        ChunkRecord {
            id: id.to_string(),
            doc_id: doc.to_string(),
            doc_name: None,
            modified_at: None,
            scope,
            text: text.to_string(),
            embedding: None,
        }
    }

    #[test]
    fn test_tokenize_mixed_script() {
        let tokens = tokenize("SMC氣缸 MXJ6-10 規格");
        assert_eq!(tokens, vec!["smc", "氣缸", "mxj6", "10", "規格"]);

        let tokens = tokenize("電磁閥");
        assert_eq!(tokens, vec!["電磁", "磁閥"]);

        assert_eq!(tokenize("閥"), vec!["閥"]);
        assert!(tokenize("  ,.  ").is_empty());
    }

    #[test]
    fn test_term_stats() {
        let stats = TermStats::from_text("seal seal gasket");
        assert_eq!(stats.length, 3);
        assert_eq!(stats.tf("seal"), 2);
        assert_eq!(stats.tf("ring"), 0);
    }

    #[test]
    fn test_index_stats_by_scope() {
        let records = vec![
            record("c1", "d1", Scope::Public, "a"),
            record("c2", "d1", Scope::Public, "b"),
            record("c3", "d2", Scope::Department("sales".into()), "c"),
            record("c4", "d3", Scope::Personal("amy".into()), "d"),
        ];
        let index = ChunkIndex::build(records, &Config::default().retrieval);
        let stats = index.stats();

        assert_eq!(stats.documents, 3);
        assert_eq!(stats.chunks, 4);
        assert_eq!(stats.by_scope["public"].documents, 1);
        assert_eq!(stats.by_scope["public"].chunks, 2);
        assert_eq!(stats.by_scope["department:sales"].chunks, 1);
        assert_eq!(stats.embedded_chunks, 0);
    }

    #[tokio::test]
    async fn test_jsonl_source_skips_bad_lines() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("chunks.jsonl");
        std::fs::write(
            &path,
            concat!(
                r#"{"id":"c1","doc_id":"d1","scope":{"kind":"public"},"text":"hello"}"#,
                "\n",
                "not json\n",
                "\n",
                r#"{"id":"c2","doc_id":"d1","doc_name":"Manual","modified_at":"2024-05-01T00:00:00Z","scope":{"kind":"personal","name":"amy"},"text":"world","embedding":[0.1,0.2]}"#,
                "\n"
            ),
        )
        .unwrap();

        let source = JsonlChunkSource::new(&path);
        let records = source.load().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].scope, Scope::Personal("amy".to_string()));
        assert_eq!(records[1].embedding.as_ref().map(|e| e.len()), Some(2));
    }

    #[tokio::test]
    async fn test_jsonl_source_missing_file() {
        let source = JsonlChunkSource::new("/nonexistent/chunks.jsonl");
        assert!(source.load().await.is_err());
    }
}
