//! Lexicon registry for configuration-driven query analysis
//!
//! This module provides:
//! - Pre-compiled product and model code patterns (exact retrieval lane, complexity)
//! - Domain vocabularies used as classifier signals
//! - Branch synonym resolution for business questions
//! - Term expansion dictionary for the sparse lane

use crate::error::{AskflowError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Built-in lexicon, also written out by `askflow config init`
pub const LEXICON_TEMPLATE: &str = include_str!("../../config-templates/lexicon.toml");

/// Identifier pattern configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentifierConfig {
    pub name: String,
    pub pattern: String,
}

/// Branch with its canonical name and accepted short forms
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchConfig {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Brand with spelling variants in other languages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrandConfig {
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Dictionary entry mapping a term to its translations and synonyms
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TermConfig {
    pub term: String,
    pub expansions: Vec<String>,
}

/// Lexicon file structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LexiconConfig {
    #[serde(default)]
    pub technical_terms: Vec<String>,
    #[serde(default)]
    pub business_terms: Vec<String>,
    #[serde(default)]
    pub temporal_phrases: Vec<String>,
    #[serde(default)]
    pub aggregation_terms: Vec<String>,
    #[serde(default)]
    pub personal_markers: Vec<String>,
    #[serde(default)]
    pub comparison_terms: Vec<String>,
    #[serde(default)]
    pub analysis_terms: Vec<String>,
    #[serde(default)]
    pub proper_nouns: Vec<String>,
    #[serde(default)]
    pub customer_suffixes: Vec<String>,
    #[serde(default)]
    pub identifier: Vec<IdentifierConfig>,
    #[serde(default)]
    pub branch: Vec<BranchConfig>,
    #[serde(default)]
    pub brand: Vec<BrandConfig>,
    #[serde(default)]
    pub term: Vec<TermConfig>,
}

/// Compiled identifier pattern
#[derive(Debug, Clone)]
pub struct CompiledIdentifierPattern {
    pub name: String,
    pub regex: Regex,
}

/// Identifier recognized in a piece of text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identifier {
    /// Pattern name, or "proper_noun"
    pub kind: String,
    /// Text as it appeared
    pub value: String,
    /// Uppercased form without whitespace or a leading "No." marker
    pub canonical: String,
}

/// Branch resolved from a question
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchMatch {
    pub canonical: String,
    pub matched: String,
}

/// Lexicon with all patterns compiled
#[derive(Debug, Clone)]
pub struct Lexicon {
    pub identifiers: Vec<CompiledIdentifierPattern>,
    pub technical_terms: Vec<String>,
    pub business_terms: Vec<String>,
    pub temporal_phrases: Vec<String>,
    pub aggregation_terms: Vec<String>,
    pub personal_markers: Vec<String>,
    pub comparison_terms: Vec<String>,
    pub analysis_terms: Vec<String>,
    pub proper_nouns: Vec<String>,
    pub customer_suffixes: Vec<String>,
    pub branches: Vec<BranchConfig>,
    pub brands: Vec<BrandConfig>,
    pub terms: Vec<TermConfig>,
}

impl Lexicon {
    /// Lexicon compiled from the embedded template
    pub fn builtin() -> Result<Self> {
        let config: LexiconConfig = toml::from_str(LEXICON_TEMPLATE)?;
        Self::from_config(config)
    }

    /// Load a lexicon from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| AskflowError::Io {
            source: e,
            context: format!("Failed to read lexicon: {:?}", path),
        })?;
        let config: LexiconConfig = toml::from_str(&content)?;
        Self::from_config(config)
    }

    /// Build a lexicon from parsed configuration
    pub fn from_config(config: LexiconConfig) -> Result<Self> {
        let identifiers = config
            .identifier
            .iter()
            .map(|ic| {
                Regex::new(&ic.pattern)
                    .map(|regex| CompiledIdentifierPattern {
                        name: ic.name.clone(),
                        regex,
                    })
                    .map_err(|e| {
                        AskflowError::Config(format!(
                            "Invalid identifier pattern '{}': {}",
                            ic.name, e
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        // Longest alias first so "台南營所" wins over "台南"
        let mut branches = config.branch;
        for branch in &mut branches {
            branch
                .aliases
                .sort_by_key(|alias| std::cmp::Reverse(alias.chars().count()));
        }

        let mut customer_suffixes = config.customer_suffixes;
        customer_suffixes.sort_by_key(|s| std::cmp::Reverse(s.chars().count()));

        Ok(Self {
            identifiers,
            technical_terms: config.technical_terms,
            business_terms: config.business_terms,
            temporal_phrases: config.temporal_phrases,
            aggregation_terms: config.aggregation_terms,
            personal_markers: config.personal_markers,
            comparison_terms: config.comparison_terms,
            analysis_terms: config.analysis_terms,
            proper_nouns: config.proper_nouns,
            customer_suffixes,
            branches,
            brands: config.brand,
            terms: config.term,
        })
    }

    /// Extract product codes and configured proper nouns, deduplicated by canonical form
    pub fn extract_identifiers(&self, text: &str) -> Vec<Identifier> {
        let mut found: Vec<Identifier> = Vec::new();

        for pattern in &self.identifiers {
            for m in pattern.regex.find_iter(text) {
                if !has_ascii_boundaries(text, m.start(), m.end()) {
                    continue;
                }
                let canonical = canonical_identifier(m.as_str());
                if canonical.is_empty() || found.iter().any(|i| i.canonical == canonical) {
                    continue;
                }
                found.push(Identifier {
                    kind: pattern.name.clone(),
                    value: m.as_str().to_string(),
                    canonical,
                });
            }
        }

        let lowered = text.to_lowercase();
        for noun in &self.proper_nouns {
            if lowered.contains(&noun.to_lowercase()) {
                let canonical = canonical_identifier(noun);
                if !found.iter().any(|i| i.canonical == canonical) {
                    found.push(Identifier {
                        kind: "proper_noun".to_string(),
                        value: noun.clone(),
                        canonical,
                    });
                }
            }
        }

        found
    }

    /// Terms from `terms` that occur in `text`, ignoring ASCII case
    pub fn find_terms<'a>(terms: &'a [String], text: &str) -> Vec<&'a str> {
        let lowered = text.to_lowercase();
        terms
            .iter()
            .filter(|term| !term.is_empty() && lowered.contains(&term.to_lowercase()))
            .map(|term| term.as_str())
            .collect()
    }

    /// Resolve the branch a question refers to
    pub fn detect_branch(&self, text: &str) -> Option<BranchMatch> {
        if let Some(branch) = self.branches.iter().find(|b| text.contains(&b.name)) {
            return Some(BranchMatch {
                canonical: branch.name.clone(),
                matched: branch.name.clone(),
            });
        }

        self.branches.iter().find_map(|branch| {
            branch
                .aliases
                .iter()
                .find(|alias| !alias.is_empty() && text.contains(alias.as_str()))
                .map(|alias| BranchMatch {
                    canonical: branch.name.clone(),
                    matched: alias.clone(),
                })
        })
    }

    /// Known canonical branch names
    pub fn branch_names(&self) -> impl Iterator<Item = &str> {
        self.branches.iter().map(|b| b.name.as_str())
    }

    /// Translations, synonyms and brand aliases for terms found in `text`
    pub fn expand(&self, text: &str) -> Vec<String> {
        let lowered = text.to_lowercase();
        let mut expansions: Vec<String> = Vec::new();

        for entry in &self.terms {
            if lowered.contains(&entry.term.to_lowercase()) {
                for expansion in &entry.expansions {
                    if !expansions.contains(expansion) {
                        expansions.push(expansion.clone());
                    }
                }
            }
        }

        for brand in &self.brands {
            let mentioned = lowered.contains(&brand.name.to_lowercase())
                || brand
                    .aliases
                    .iter()
                    .any(|alias| lowered.contains(&alias.to_lowercase()));
            if mentioned {
                for variant in std::iter::once(&brand.name).chain(brand.aliases.iter()) {
                    if !expansions.contains(variant) {
                        expansions.push(variant.clone());
                    }
                }
            }
        }

        expansions
    }
}

/// Canonical identifier form used for literal matching
pub fn canonical_identifier(value: &str) -> String {
    let compact: String = value
        .chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(|c| c.to_uppercase())
        .collect();

    let stripped = compact
        .strip_prefix("NO.")
        .or_else(|| {
            compact
                .strip_prefix("NO")
                .filter(|rest| rest.starts_with(|c: char| c.is_ascii_digit()))
        })
        .unwrap_or(&compact);

    stripped.to_string()
}

/// Uppercased, whitespace-free form of a text for identifier lookups
pub fn compact_text(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(|c| c.to_uppercase())
        .collect()
}

/// Whether `compact` contains `canonical` as a standalone identifier
pub fn contains_identifier(compact: &str, canonical: &str) -> bool {
    if canonical.is_empty() {
        return false;
    }
    compact
        .match_indices(canonical)
        .any(|(start, m)| has_ascii_boundaries(compact, start, start + m.len()))
}

/// True when the match is not glued to surrounding ASCII letters or digits
fn has_ascii_boundaries(text: &str, start: usize, end: usize) -> bool {
    let before = text[..start].chars().next_back();
    let after = text[end..].chars().next();
    !before.is_some_and(|c| c.is_ascii_alphanumeric())
        && !after.is_some_and(|c| c.is_ascii_alphanumeric())
}
