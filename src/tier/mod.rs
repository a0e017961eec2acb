//! Model tier selection
//!
//! Rules are evaluated in order and the first match wins:
//! 1. explicit caller override
//! 2. business domain selects the business tier
//! 3. weak retrieval evidence or a complex question selects the complex tier
//! 4. everything else is simple

use crate::classifier::{Classification, Domain};
use crate::config::{TierConfig, TierProfileConfig};
use crate::lexicon::Lexicon;
use crate::retrieval::RetrievalResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Reasoning model tier; ordered simple < complex < business
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Simple,
    Complex,
    Business,
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Simple => "simple",
            Self::Complex => "complex",
            Self::Business => "business",
        };
        f.write_str(name)
    }
}

impl FromStr for ModelTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "simple" => Ok(Self::Simple),
            "complex" => Ok(Self::Complex),
            "business" => Ok(Self::Business),
            other => Err(format!(
                "Unknown tier '{}'. Expected simple, complex or business",
                other
            )),
        }
    }
}

/// Model settings bound to a tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierProfile {
    pub tier: ModelTier,
    pub model: String,
    pub fallback_model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub prompt_template: String,
}

impl TierProfile {
    pub fn from_config(tier: ModelTier, config: &TierProfileConfig) -> Self {
        Self {
            tier,
            model: config.model.clone(),
            fallback_model: config.fallback_model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            prompt_template: config.prompt_template.clone(),
        }
    }

    /// Same tier, addressed to the fallback provider's model
    pub fn for_fallback(&self) -> Self {
        Self {
            model: self
                .fallback_model
                .clone()
                .unwrap_or_else(|| self.model.clone()),
            ..self.clone()
        }
    }
}

/// Why a tier was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierReason {
    Override,
    BusinessDomain,
    MixedDomain,
    LowRetrievalConfidence,
    MultipleClauses,
    ComparisonTerms,
    AnalysisTerms,
    LongQuery,
    MultipleProductCodes,
    ManySourceDocuments,
    Default,
}

/// Selected tier with the reasons that led to it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierDecision {
    pub tier: ModelTier,
    pub reasons: Vec<TierReason>,
}

impl TierDecision {
    pub fn new(tier: ModelTier, reasons: Vec<TierReason>) -> Self {
        Self { tier, reasons }
    }

    /// Raise the tier; requests for a lower tier are ignored
    ///
    /// A request at the current tier only adds its reason. Raising the tier
    /// drops the `Default` reason. Returns whether the tier changed.
    pub fn escalate(&mut self, tier: ModelTier, reason: TierReason) -> bool {
        if tier < self.tier {
            return false;
        }
        let raised = tier > self.tier;
        if raised {
            self.tier = tier;
            self.reasons.retain(|r| *r != TierReason::Default);
        }
        if !self.reasons.contains(&reason) {
            self.reasons.push(reason);
        }
        raised
    }
}

/// Rule-based tier selector
pub struct TierSelector {
    lexicon: Arc<Lexicon>,
    config: TierConfig,
}

impl TierSelector {
    pub fn new(lexicon: Arc<Lexicon>, config: TierConfig) -> Self {
        Self { lexicon, config }
    }

    /// Pick a tier for a question
    ///
    /// `retrieval` is `None` on the pure business path.
    pub fn select(
        &self,
        classification: &Classification,
        retrieval: Option<&RetrievalResult>,
        query: &str,
        override_tier: Option<ModelTier>,
    ) -> TierDecision {
        if let Some(tier) = override_tier {
            return TierDecision::new(tier, vec![TierReason::Override]);
        }

        if classification.domain == Domain::Business {
            return TierDecision::new(ModelTier::Business, vec![TierReason::BusinessDomain]);
        }

        let mut decision = TierDecision::new(ModelTier::Simple, vec![TierReason::Default]);
        if classification.is_mixed() {
            decision.escalate(ModelTier::Complex, TierReason::MixedDomain);
        }
        if let Some(result) = retrieval {
            if result.confidence() < self.config.confidence_floor {
                decision.escalate(ModelTier::Complex, TierReason::LowRetrievalConfidence);
            }
        }
        for reason in self.complexity_reasons(query, retrieval) {
            decision.escalate(ModelTier::Complex, reason);
        }

        tracing::debug!(tier = %decision.tier, reasons = ?decision.reasons, "Selected model tier");
        decision
    }

    /// Structural signals that a question needs the complex tier
    pub fn complexity_reasons(&self, query: &str, retrieval: Option<&RetrievalResult>) -> Vec<TierReason> {
        let mut reasons = Vec::new();

        let question_marks = query.chars().filter(|c| matches!(c, '?' | '？')).count();
        if question_marks > 1 {
            reasons.push(TierReason::MultipleClauses);
        }
        if !Lexicon::find_terms(&self.lexicon.comparison_terms, query).is_empty() {
            reasons.push(TierReason::ComparisonTerms);
        }
        if !Lexicon::find_terms(&self.lexicon.analysis_terms, query).is_empty() {
            reasons.push(TierReason::AnalysisTerms);
        }
        if query.chars().count() > self.config.max_query_chars {
            reasons.push(TierReason::LongQuery);
        }
        let codes = self
            .lexicon
            .extract_identifiers(query)
            .iter()
            .filter(|id| id.kind != "proper_noun")
            .count();
        if codes >= self.config.max_model_codes {
            reasons.push(TierReason::MultipleProductCodes);
        }
        if retrieval.is_some_and(|r| r.distinct_documents() > self.config.max_source_docs) {
            reasons.push(TierReason::ManySourceDocuments);
        }

        reasons
    }

    /// Profile for a tier
    pub fn profile(&self, tier: ModelTier) -> TierProfile {
        let config = match tier {
            ModelTier::Simple => &self.config.simple,
            ModelTier::Complex => &self.config.complex,
            ModelTier::Business => &self.config.business,
        };
        TierProfile::from_config(tier, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::retrieval::{ChunkIndex, ChunkRecord, RetrievedChunk, LaneHit, LaneScores, Scope};
    use std::collections::BTreeSet;

    fn selector() -> TierSelector {
        TierSelector::new(Arc::new(Lexicon::builtin().unwrap()), Config::default().tiers)
    }

    fn result_with_dense(score: f32, docs: usize) -> RetrievalResult {
        let records = (0..docs)
            .map(|i| ChunkRecord {
                id: format!("c{}", i),
                doc_id: format!("d{}", i),
                doc_name: None,
                modified_at: None,
                scope: Scope::Public,
                text: String::new(),
                embedding: None,
            })
            .collect();
        let index = ChunkIndex::build(records, &Config::default().retrieval);
        let chunks = index
            .chunks()
            .iter()
            .map(|chunk| {
                let lanes = LaneScores {
                    dense: Some(LaneHit { rank: 0, score }),
                    ..Default::default()
                };
                RetrievedChunk::new(chunk.clone(), 0.01, lanes)
            })
            .collect();
        RetrievalResult {
            chunks,
            scopes: BTreeSet::from([Scope::Public]),
            ..Default::default()
        }
    }

    #[test]
    fn test_rule_order() {
        let selector = selector();
        let technical = Classification::overridden(Domain::Technical);
        let strong = result_with_dense(0.9, 1);

        let d = selector.select(&technical, Some(&strong), "電磁閥安裝方式", None);
        assert_eq!(d.tier, ModelTier::Simple);

        let d = selector.select(&technical, Some(&strong), "電磁閥安裝方式", Some(ModelTier::Business));
        assert_eq!(d.tier, ModelTier::Business);
        assert_eq!(d.reasons, vec![TierReason::Override]);

        let business = Classification::overridden(Domain::Business);
        let d = selector.select(&business, None, "台南營業所業績", None);
        assert_eq!(d.tier, ModelTier::Business);
    }

    #[test]
    fn test_low_confidence_escalates() {
        let selector = selector();
        let technical = Classification::overridden(Domain::Technical);
        let weak = result_with_dense(0.2, 1);

        let d = selector.select(&technical, Some(&weak), "電磁閥安裝方式", None);
        assert_eq!(d.tier, ModelTier::Complex);
        assert!(d.reasons.contains(&TierReason::LowRetrievalConfidence));

        let empty = RetrievalResult::default();
        let d = selector.select(&technical, Some(&empty), "電磁閥安裝方式", None);
        assert_eq!(d.tier, ModelTier::Complex);
    }

    #[test]
    fn test_complexity_signals() {
        let selector = selector();
        let technical = Classification::overridden(Domain::Technical);
        let strong = result_with_dense(0.9, 1);

        for query in [
            "MXJ6-10 和 MXJ6-20 哪個行程長",
            "這兩款氣缸的差異",
            "請分析故障原因",
            "規格是什麼？安裝方式呢？",
        ] {
            let d = selector.select(&technical, Some(&strong), query, None);
            assert_eq!(d.tier, ModelTier::Complex, "query: {}", query);
        }

        let long_query = "氣".repeat(101);
        assert!(selector
            .complexity_reasons(&long_query, None)
            .contains(&TierReason::LongQuery));

        let many_docs = result_with_dense(0.9, 6);
        let d = selector.select(&technical, Some(&many_docs), "電磁閥安裝方式", None);
        assert!(d.reasons.contains(&TierReason::ManySourceDocuments));
    }

    #[test]
    fn test_mixed_selects_complex() {
        let selector = selector();
        let mixed = Classification::overridden(Domain::Mixed);
        let d = selector.select(&mixed, Some(&result_with_dense(0.9, 1)), "電磁閥", None);
        assert_eq!(d.tier, ModelTier::Complex);
        assert!(d.reasons.contains(&TierReason::MixedDomain));
    }

    #[test]
    fn test_escalation_is_monotonic() {
        let mut decision = TierDecision::new(ModelTier::Complex, vec![TierReason::MixedDomain]);

        assert!(!decision.escalate(ModelTier::Simple, TierReason::Default));
        assert_eq!(decision.tier, ModelTier::Complex);
        assert_eq!(decision.reasons, vec![TierReason::MixedDomain]);

        assert!(!decision.escalate(ModelTier::Complex, TierReason::LongQuery));
        assert_eq!(decision.reasons, vec![TierReason::MixedDomain, TierReason::LongQuery]);

        assert!(decision.escalate(ModelTier::Business, TierReason::BusinessDomain));
        assert_eq!(decision.tier, ModelTier::Business);
        assert!(!decision.escalate(ModelTier::Complex, TierReason::ComparisonTerms));
        assert_eq!(decision.tier, ModelTier::Business);
        assert_eq!(decision.reasons.len(), 3);
    }

    #[test]
    fn test_selection_escalates_from_default() {
        let selector = selector();
        let technical = Classification::overridden(Domain::Technical);
        let strong = result_with_dense(0.9, 1);

        let plain = selector.select(&technical, Some(&strong), "電磁閥安裝方式", None);
        assert_eq!(plain, TierDecision::new(ModelTier::Simple, vec![TierReason::Default]));

        let weak = result_with_dense(0.2, 1);
        let d = selector.select(&technical, Some(&weak), "這兩款電磁閥的差異", None);
        assert_eq!(d.tier, ModelTier::Complex);
        assert!(!d.reasons.contains(&TierReason::Default));
        assert_eq!(d.reasons[0], TierReason::LowRetrievalConfidence);
        assert!(d.reasons.contains(&TierReason::ComparisonTerms));
    }

    #[test]
    fn test_fallback_profile_keeps_tier() {
        let profile = selector().profile(ModelTier::Complex);
        let fallback = profile.for_fallback();
        assert_eq!(fallback.tier, ModelTier::Complex);
        assert_eq!(fallback.max_tokens, profile.max_tokens);
        assert_ne!(fallback.model, profile.model);
    }
}
