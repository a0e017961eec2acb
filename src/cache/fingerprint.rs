//! Cache keys

use crate::retrieval::Scope;
use crate::tier::ModelTier;
use std::collections::BTreeSet;
use std::fmt;

/// blake3 digest identifying one answer computation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint(blake3::Hash);

impl Fingerprint {
    /// Hash the normalized query, scope set, tier and evidence
    ///
    /// `evidence` is the ordered top chunk ids and/or the business plan
    /// signature. Every field is length-prefixed so adjacent values cannot
    /// run together.
    pub fn compute<'a, I>(query: &str, scopes: &BTreeSet<Scope>, tier: ModelTier, evidence: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut hasher = blake3::Hasher::new();
        write_field(&mut hasher, &normalize_query(query));

        hasher.update(&(scopes.len() as u64).to_le_bytes());
        for scope in scopes {
            write_field(&mut hasher, &scope.to_string());
        }

        write_field(&mut hasher, &tier.to_string());

        for item in evidence {
            write_field(&mut hasher, item);
        }

        Self(hasher.finalize())
    }

    pub fn to_hex(&self) -> String {
        self.0.to_hex().to_string()
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form for logs
        write!(f, "{}", &self.to_hex()[..16])
    }
}

fn write_field(hasher: &mut blake3::Hasher, value: &str) {
    hasher.update(&(value.len() as u64).to_le_bytes());
    hasher.update(value.as_bytes());
}

/// Canonical form of a question for cache lookups
pub fn normalize_query(query: &str) -> String {
    let folded: String = query
        .chars()
        .map(|c| match c {
            '？' => '?',
            '！' => '!',
            '。' => '.',
            '，' => ',',
            '\u{3000}' => ' ',
            other => other,
        })
        .collect::<String>()
        .to_lowercase();

    let collapsed = folded.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed
        .trim_end_matches(|c: char| matches!(c, '?' | '!' | '.' | ',' | ';' | ':' | '、'))
        .trim_end()
        .to_string()
}
