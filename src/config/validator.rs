use crate::config::{parse_duration, Config, TierProfileConfig};
use crate::error::{AskflowError, Result, ValidationError};

const LLM_PROVIDERS: &[&str] = &["openai", "anthropic", "local"];
const EMBEDDING_PROVIDERS: &[&str] = &["local", "openai", "none"];
const PLAN_GENERATORS: &[&str] = &["model", "rules"];
const MEMORY_BACKENDS: &[&str] = &["memory", "sqlite"];

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration
    pub fn validate(config: &Config) -> Result<()> {
        let mut errors = Vec::new();

        Self::validate_schema_version(config, &mut errors);
        Self::validate_storage(config, &mut errors);
        Self::validate_classifier(config, &mut errors);
        Self::validate_retrieval(config, &mut errors);
        Self::validate_tiers(config, &mut errors);
        Self::validate_llm(config, &mut errors);
        Self::validate_embedding(config, &mut errors);
        Self::validate_cache(config, &mut errors);
        Self::validate_business(config, &mut errors);
        Self::validate_memory(config, &mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AskflowError::ConfigValidation { errors })
        }
    }

    fn validate_schema_version(config: &Config, errors: &mut Vec<ValidationError>) {
        let version = &config.meta.schema_version;
        if version != "1.0.0" {
            errors.push(ValidationError::new(
                "_meta.schema_version",
                format!("Unsupported schema version: {}", version),
            ));
        }
    }

    fn validate_storage(config: &Config, errors: &mut Vec<ValidationError>) {
        // Existence is checked at load time; sources may be created after config init
        if config.storage.chunk_file.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "storage.chunk_file",
                "Chunk file path cannot be empty",
            ));
        }

        if config.storage.business_file.as_os_str().is_empty() {
            errors.push(ValidationError::new(
                "storage.business_file",
                "Business file path cannot be empty",
            ));
        }
    }

    fn validate_classifier(config: &Config, errors: &mut Vec<ValidationError>) {
        let c = &config.classifier;
        if !(0.0..1.0).contains(&c.tie_margin) {
            errors.push(ValidationError::new(
                "classifier.tie_margin",
                format!("Tie margin must be in [0, 1), got {}", c.tie_margin),
            ));
        }

        let weights = [
            ("product_code_weight", c.product_code_weight),
            ("technical_term_weight", c.technical_term_weight),
            ("org_unit_weight", c.org_unit_weight),
            ("temporal_weight", c.temporal_weight),
            ("aggregation_weight", c.aggregation_weight),
            ("business_term_weight", c.business_term_weight),
            ("personal_marker_weight", c.personal_marker_weight),
            ("continuity_weight", c.continuity_weight),
        ];
        for (name, weight) in weights {
            if weight < 0.0 {
                errors.push(ValidationError::new(
                    format!("classifier.{}", name),
                    "Signal weights cannot be negative",
                ));
            }
        }
    }

    fn validate_retrieval(config: &Config, errors: &mut Vec<ValidationError>) {
        let r = &config.retrieval;

        if r.top_n == 0 {
            errors.push(ValidationError::new(
                "retrieval.top_n",
                "top_n must be greater than 0",
            ));
        }

        if r.search_multiplier == 0 {
            errors.push(ValidationError::new(
                "retrieval.search_multiplier",
                "search_multiplier must be greater than 0",
            ));
        }

        if r.rrf_k < 0.0 {
            errors.push(ValidationError::new(
                "retrieval.rrf_k",
                "rrf_k cannot be negative",
            ));
        }

        if r.exact_weight <= 0.0 || r.sparse_weight <= 0.0 || r.dense_weight <= 0.0 {
            errors.push(ValidationError::new(
                "retrieval",
                "Lane weights must be positive",
            ));
        }

        // A non-exact candidate can score at most the sum of all first-rank contributions
        let ceiling = (r.exact_weight + r.sparse_weight + r.dense_weight) / (r.rrf_k + 1.0);
        if r.exact_override_weight <= ceiling {
            errors.push(ValidationError::new(
                "retrieval.exact_override_weight",
                format!(
                    "Override weight must exceed the fused score ceiling ({:.4})",
                    ceiling
                ),
            ));
        }

        if r.bm25_k1 < 0.0 {
            errors.push(ValidationError::new(
                "retrieval.bm25_k1",
                "k1 cannot be negative",
            ));
        }

        if !(0.0..=1.0).contains(&r.bm25_b) {
            errors.push(ValidationError::new(
                "retrieval.bm25_b",
                format!("b must be in [0, 1], got {}", r.bm25_b),
            ));
        }

        if r.enable_reranking && r.rerank_candidates_limit == 0 {
            errors.push(ValidationError::new(
                "retrieval.rerank_candidates_limit",
                "Reranking needs at least one candidate",
            ));
        }

        if r.hnsw_m == 0 || r.hnsw_ef_construction == 0 || r.hnsw_ef_search == 0 {
            errors.push(ValidationError::new(
                "retrieval",
                "HNSW parameters must be greater than 0",
            ));
        }
    }

    fn validate_tiers(config: &Config, errors: &mut Vec<ValidationError>) {
        let t = &config.tiers;
        if !(0.0..=1.0).contains(&t.confidence_floor) {
            errors.push(ValidationError::new(
                "tiers.confidence_floor",
                format!("Confidence floor must be in [0, 1], got {}", t.confidence_floor),
            ));
        }

        for (name, profile) in [
            ("simple", &t.simple),
            ("complex", &t.complex),
            ("business", &t.business),
        ] {
            Self::validate_profile(name, profile, errors);
        }
    }

    fn validate_profile(name: &str, profile: &TierProfileConfig, errors: &mut Vec<ValidationError>) {
        if profile.model.is_empty() {
            errors.push(ValidationError::new(
                format!("tiers.{}.model", name),
                "Model name cannot be empty",
            ));
        }

        if !(0.0..=2.0).contains(&profile.temperature) {
            errors.push(ValidationError::new(
                format!("tiers.{}.temperature", name),
                format!("Temperature must be in [0, 2], got {}", profile.temperature),
            ));
        }

        if profile.max_tokens == 0 {
            errors.push(ValidationError::new(
                format!("tiers.{}.max_tokens", name),
                "max_tokens must be greater than 0",
            ));
        }

        if !profile.prompt_template.contains("{question}") {
            errors.push(ValidationError::new(
                format!("tiers.{}.prompt_template", name),
                "Template must contain a {question} slot",
            ));
        }
    }

    fn validate_llm(config: &Config, errors: &mut Vec<ValidationError>) {
        let llm = &config.llm;
        if !LLM_PROVIDERS.contains(&llm.provider.as_str()) {
            errors.push(ValidationError::new(
                "llm.provider",
                format!(
                    "Provider must be one of {:?}, got '{}'",
                    LLM_PROVIDERS, llm.provider
                ),
            ));
        }

        if let Some(fallback) = &llm.fallback_provider {
            if !LLM_PROVIDERS.contains(&fallback.as_str()) {
                errors.push(ValidationError::new(
                    "llm.fallback_provider",
                    format!("Unknown fallback provider '{}'", fallback),
                ));
            }
        }

        for (path, value) in [
            ("llm.timeout", &llm.timeout),
            ("llm.initial_backoff", &llm.initial_backoff),
            ("llm.max_backoff", &llm.max_backoff),
        ] {
            if parse_duration(value).is_none() {
                errors.push(ValidationError::new(
                    path,
                    format!("Invalid duration format: {}", value),
                ));
            }
        }

        if llm.max_retries > 10 {
            errors.push(ValidationError::new(
                "llm.max_retries",
                format!("At most 10 retries are allowed, got {}", llm.max_retries),
            ));
        }
    }

    fn validate_embedding(config: &Config, errors: &mut Vec<ValidationError>) {
        let e = &config.embedding;
        if !EMBEDDING_PROVIDERS.contains(&e.provider.as_str()) {
            errors.push(ValidationError::new(
                "embedding.provider",
                format!(
                    "Provider must be one of {:?}, got '{}'",
                    EMBEDDING_PROVIDERS, e.provider
                ),
            ));
        }

        if e.batch_size == 0 {
            errors.push(ValidationError::new(
                "embedding.batch_size",
                "Batch size must be greater than 0",
            ));
        }

        if e.provider != "none" && e.model.is_empty() {
            errors.push(ValidationError::new(
                "embedding.model",
                "Model name cannot be empty",
            ));
        }
    }

    fn validate_cache(config: &Config, errors: &mut Vec<ValidationError>) {
        if parse_duration(&config.cache.ttl).is_none() {
            errors.push(ValidationError::new(
                "cache.ttl",
                format!("Invalid duration format: {}", config.cache.ttl),
            ));
        }

        if config.cache.enabled && config.cache.max_entries == 0 {
            errors.push(ValidationError::new(
                "cache.max_entries",
                "An enabled cache needs room for at least one entry",
            ));
        }
    }

    fn validate_business(config: &Config, errors: &mut Vec<ValidationError>) {
        let b = &config.business;
        if !PLAN_GENERATORS.contains(&b.plan_generator.as_str()) {
            errors.push(ValidationError::new(
                "business.plan_generator",
                format!(
                    "Plan generator must be one of {:?}, got '{}'",
                    PLAN_GENERATORS, b.plan_generator
                ),
            ));
        }

        if b.max_plan_attempts == 0 {
            errors.push(ValidationError::new(
                "business.max_plan_attempts",
                "At least one plan attempt is required",
            ));
        }

        if parse_duration(&b.sandbox_timeout).is_none() {
            errors.push(ValidationError::new(
                "business.sandbox_timeout",
                format!("Invalid duration format: {}", b.sandbox_timeout),
            ));
        }

        if b.max_result_rows == 0 || b.max_groups == 0 || b.max_scan_rows == 0 {
            errors.push(ValidationError::new(
                "business",
                "Sandbox limits must be greater than 0",
            ));
        }

        if b.trend_threshold < 0.0 {
            errors.push(ValidationError::new(
                "business.trend_threshold",
                "Trend threshold cannot be negative",
            ));
        }

        if b.anomaly_z <= 0.0 {
            errors.push(ValidationError::new(
                "business.anomaly_z",
                "Anomaly bound must be positive",
            ));
        }

        if b.default_window_days <= 0 {
            errors.push(ValidationError::new(
                "business.default_window_days",
                "Default window must be at least one day",
            ));
        }
    }

    fn validate_memory(config: &Config, errors: &mut Vec<ValidationError>) {
        if !MEMORY_BACKENDS.contains(&config.memory.backend.as_str()) {
            errors.push(ValidationError::new(
                "memory.backend",
                format!(
                    "Backend must be one of {:?}, got '{}'",
                    MEMORY_BACKENDS, config.memory.backend
                ),
            ));
        }

        if config.memory.max_turns_per_session == 0 {
            errors.push(ValidationError::new(
                "memory.max_turns_per_session",
                "Sessions must keep at least one turn",
            ));
        }

        if config.memory.max_sessions == 0 {
            errors.push(ValidationError::new(
                "memory.max_sessions",
                "Memory must keep at least one session",
            ));
        }

        if parse_duration(&config.memory.session_idle).is_none() {
            errors.push(ValidationError::new(
                "memory.session_idle",
                format!("Invalid duration format: {}", config.memory.session_idle),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_paths(config: &Config) -> Vec<String> {
        match ConfigValidator::validate(config) {
            Err(AskflowError::ConfigValidation { errors }) => {
                errors.into_iter().map(|e| e.path).collect()
            }
            _ => Vec::new(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = Config::default();
        assert!(ConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn test_invalid_schema_version() {
        let mut config = Config::default();
        config.meta.schema_version = "2.0.0".to_string();
        assert_eq!(error_paths(&config), vec!["_meta.schema_version"]);
    }

    #[test]
    fn test_override_weight_must_dominate() {
        let mut config = Config::default();
        config.retrieval.exact_override_weight = 0.01;
        assert!(error_paths(&config).contains(&"retrieval.exact_override_weight".to_string()));
    }

    #[test]
    fn test_collects_all_errors() {
        let mut config = Config::default();
        config.llm.provider = "groq".to_string();
        config.cache.ttl = "forever".to_string();
        config.business.max_plan_attempts = 0;
        config.retrieval.bm25_b = 1.5;

        let paths = error_paths(&config);
        assert_eq!(paths.len(), 4);
        assert!(paths.contains(&"llm.provider".to_string()));
        assert!(paths.contains(&"cache.ttl".to_string()));
        assert!(paths.contains(&"business.max_plan_attempts".to_string()));
        assert!(paths.contains(&"retrieval.bm25_b".to_string()));
    }

    #[test]
    fn test_memory_limits() {
        let mut config = Config::default();
        config.memory.max_sessions = 0;
        config.memory.session_idle = "soon".to_string();
        assert_eq!(
            error_paths(&config),
            vec!["memory.max_sessions", "memory.session_idle"]
        );
    }

    #[test]
    fn test_template_needs_question_slot() {
        let mut config = Config::default();
        config.tiers.complex.prompt_template = "{context}".to_string();
        assert_eq!(
            error_paths(&config),
            vec!["tiers.complex.prompt_template"]
        );
    }
}
