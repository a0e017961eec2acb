//! Query classification into knowledge domains
//!
//! Scores lexical signals per domain and picks the strongest. When the two
//! leading domains are within the tie margin the question is treated as
//! `mixed` and answered from both sides.

use crate::config::ClassifierConfig;
use crate::error::DomainError;
use crate::lexicon::Lexicon;
use crate::memory::Exchange;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Knowledge domain a question is answered from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Technical,
    Business,
    Personal,
    Mixed,
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Technical => "technical",
            Self::Business => "business",
            Self::Personal => "personal",
            Self::Mixed => "mixed",
        };
        f.write_str(name)
    }
}

impl FromStr for Domain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "technical" | "tech" => Ok(Self::Technical),
            "business" | "biz" => Ok(Self::Business),
            "personal" => Ok(Self::Personal),
            "mixed" => Ok(Self::Mixed),
            other => Err(format!(
                "Unknown domain '{}'. Expected technical, business, personal or mixed",
                other
            )),
        }
    }
}

/// Kind of lexical evidence behind a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    ProductCode,
    TechnicalTerm,
    OrgUnit,
    Temporal,
    Aggregation,
    BusinessTerm,
    PersonalMarker,
    Continuity,
    Override,
}

/// One piece of evidence for a domain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub domain: Domain,
    pub kind: SignalKind,
    pub matched: String,
    pub weight: f32,
}

/// Raw accumulated signal weight per concrete domain
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DomainScores {
    pub technical: f32,
    pub business: f32,
    pub personal: f32,
}

impl DomainScores {
    fn add(&mut self, domain: Domain, weight: f32) {
        match domain {
            Domain::Technical => self.technical += weight,
            Domain::Business => self.business += weight,
            Domain::Personal => self.personal += weight,
            Domain::Mixed => {}
        }
    }

    /// Concrete domains by score, highest first; ties keep declaration order
    pub fn ranked(&self) -> Vec<(Domain, f32)> {
        let mut ranked = vec![
            (Domain::Technical, self.technical),
            (Domain::Business, self.business),
            (Domain::Personal, self.personal),
        ];
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked
    }
}

/// Result of classifying one question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub domain: Domain,
    /// Normalized margin between the two leading domains
    pub confidence: f32,
    pub signals: Vec<Signal>,
    pub scores: DomainScores,
    pub runner_up: Option<Domain>,
}

impl Classification {
    /// Classification forced by the caller
    pub fn overridden(domain: Domain) -> Self {
        Self {
            domain,
            confidence: 1.0,
            signals: vec![Signal {
                domain,
                kind: SignalKind::Override,
                matched: domain.to_string(),
                weight: 1.0,
            }],
            scores: DomainScores::default(),
            runner_up: None,
        }
    }

    pub fn is_mixed(&self) -> bool {
        self.domain == Domain::Mixed
    }

    /// Whether answering needs the given concrete domain
    ///
    /// A mixed classification involves its two leading domains. An overridden
    /// `mixed` with no scores involves technical and business.
    pub fn involves(&self, domain: Domain) -> bool {
        if self.domain == domain {
            return true;
        }
        if !self.is_mixed() {
            return false;
        }
        match self.mixed_pair() {
            Some((first, second)) => first == domain || second == domain,
            None => matches!(domain, Domain::Technical | Domain::Business),
        }
    }

    /// The two leading domains of a mixed classification
    pub fn mixed_pair(&self) -> Option<(Domain, Domain)> {
        if !self.is_mixed() {
            return None;
        }
        let ranked = self.scores.ranked();
        if ranked[1].1 <= 0.0 {
            return None;
        }
        Some((ranked[0].0, ranked[1].0))
    }

    /// The non-fatal ambiguity behind a mixed classification
    pub fn ambiguity(&self) -> Option<DomainError> {
        self.mixed_pair()
            .map(|(first, second)| DomainError::ClassificationAmbiguous { first, second })
    }

    /// Matched signal texts for display
    pub fn matched_signals(&self) -> Vec<&str> {
        self.signals.iter().map(|s| s.matched.as_str()).collect()
    }
}

/// Lexicon-driven domain classifier
pub struct QueryClassifier {
    lexicon: Arc<Lexicon>,
    config: ClassifierConfig,
}

impl QueryClassifier {
    pub fn new(lexicon: Arc<Lexicon>, config: ClassifierConfig) -> Self {
        Self { lexicon, config }
    }

    /// Classify a question given the session history (oldest first)
    pub fn classify(&self, text: &str, history: &[Exchange]) -> Classification {
        let signals = self.collect_signals(text, history);

        let mut scores = DomainScores::default();
        for signal in &signals {
            scores.add(signal.domain, signal.weight);
        }

        let ranked = scores.ranked();
        let (top_domain, top) = ranked[0];
        let (second_domain, second) = ranked[1];

        if top <= 0.0 {
            tracing::debug!("No domain signal, defaulting to technical");
            return Classification {
                domain: Domain::Technical,
                confidence: 0.0,
                signals,
                scores,
                runner_up: None,
            };
        }

        let confidence = ((top - second) / top).clamp(0.0, 1.0);
        let domain = if second > 0.0 && confidence < self.config.tie_margin {
            Domain::Mixed
        } else {
            top_domain
        };
        let runner_up = (second > 0.0).then_some(second_domain);

        tracing::debug!(
            domain = %domain,
            confidence,
            technical = scores.technical,
            business = scores.business,
            personal = scores.personal,
            "Classified query"
        );

        Classification {
            domain,
            confidence,
            signals,
            scores,
            runner_up,
        }
    }

    fn collect_signals(&self, text: &str, history: &[Exchange]) -> Vec<Signal> {
        let cfg = &self.config;
        let lexicon = &self.lexicon;
        let mut signals = Vec::new();
        let mut push = |domain, kind, matched: &str, weight: f32| {
            if weight > 0.0 {
                signals.push(Signal {
                    domain,
                    kind,
                    matched: matched.to_string(),
                    weight,
                });
            }
        };

        for id in lexicon.extract_identifiers(text) {
            push(
                Domain::Technical,
                SignalKind::ProductCode,
                &id.value,
                cfg.product_code_weight,
            );
        }
        for term in Lexicon::find_terms(&lexicon.technical_terms, text) {
            push(
                Domain::Technical,
                SignalKind::TechnicalTerm,
                term,
                cfg.technical_term_weight,
            );
        }

        if let Some(branch) = lexicon.detect_branch(text) {
            push(
                Domain::Business,
                SignalKind::OrgUnit,
                &branch.matched,
                cfg.org_unit_weight,
            );
        }
        for phrase in Lexicon::find_terms(&lexicon.temporal_phrases, text) {
            push(
                Domain::Business,
                SignalKind::Temporal,
                phrase,
                cfg.temporal_weight,
            );
        }
        for term in Lexicon::find_terms(&lexicon.aggregation_terms, text) {
            push(
                Domain::Business,
                SignalKind::Aggregation,
                term,
                cfg.aggregation_weight,
            );
        }
        for term in Lexicon::find_terms(&lexicon.business_terms, text) {
            push(
                Domain::Business,
                SignalKind::BusinessTerm,
                term,
                cfg.business_term_weight,
            );
        }

        for marker in Lexicon::find_terms(&lexicon.personal_markers, text) {
            push(
                Domain::Personal,
                SignalKind::PersonalMarker,
                marker,
                cfg.personal_marker_weight,
            );
        }
        if history
            .last()
            .is_some_and(|last| last.domain == Some(Domain::Personal))
        {
            push(
                Domain::Personal,
                SignalKind::Continuity,
                "previous personal exchange",
                cfg.continuity_weight,
            );
        }

        signals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn classifier() -> QueryClassifier {
        let lexicon = Arc::new(Lexicon::builtin().unwrap());
        QueryClassifier::new(lexicon, crate::config::Config::default().classifier)
    }

    fn exchange(domain: Domain) -> Exchange {
        Exchange {
            question: "我的筆記裡有什麼".to_string(),
            answer: "...".to_string(),
            domain: Some(domain),
            asked_at: Utc::now(),
        }
    }

    #[test]
    fn test_business_question() {
        let c = classifier().classify("台南營業所最近一個月的業績如何？", &[]);
        assert_eq!(c.domain, Domain::Business);
        assert!(c.confidence > 0.9);
        assert!(c.signals.iter().any(|s| s.kind == SignalKind::OrgUnit));
        assert!(c.signals.iter().any(|s| s.kind == SignalKind::Temporal));
    }

    #[test]
    fn test_technical_question() {
        let c = classifier().classify("MXJ6-10 的行程規格是多少", &[]);
        assert_eq!(c.domain, Domain::Technical);
        assert!(c.signals.iter().any(|s| s.kind == SignalKind::ProductCode));
    }

    #[test]
    fn test_no_signal_defaults_to_technical() {
        let c = classifier().classify("hello there", &[]);
        assert_eq!(c.domain, Domain::Technical);
        assert_eq!(c.confidence, 0.0);
        assert!(c.signals.is_empty());
    }

    #[test]
    fn test_tie_is_mixed() {
        // One technical term against one business term
        let c = classifier().classify("客戶詢問電磁閥", &[]);
        assert_eq!(c.domain, Domain::Mixed);
        assert!(c.involves(Domain::Technical));
        assert!(c.involves(Domain::Business));
        assert!(!c.involves(Domain::Personal));
        assert!(matches!(
            c.ambiguity(),
            Some(DomainError::ClassificationAmbiguous { .. })
        ));
    }

    #[test]
    fn test_personal_marker_and_continuity() {
        let c = classifier().classify("我的筆記提到哪些重點", &[]);
        assert_eq!(c.domain, Domain::Personal);

        let c = classifier().classify("第二點再說明一下", &[exchange(Domain::Personal)]);
        assert_eq!(c.domain, Domain::Personal);
        assert!(c.signals.iter().any(|s| s.kind == SignalKind::Continuity));

        let c = classifier().classify("第二點再說明一下", &[exchange(Domain::Business)]);
        assert_eq!(c.domain, Domain::Technical);
        assert_eq!(c.confidence, 0.0);
    }

    #[test]
    fn test_override() {
        let c = Classification::overridden(Domain::Personal);
        assert_eq!(c.confidence, 1.0);
        assert_eq!(c.signals.len(), 1);
        assert_eq!(c.signals[0].kind, SignalKind::Override);
    }

    #[test]
    fn test_domain_parse_and_display() {
        assert_eq!("Business".parse::<Domain>().unwrap(), Domain::Business);
        assert!("finance".parse::<Domain>().is_err());
        assert_eq!(Domain::Mixed.to_string(), "mixed");
    }
}
