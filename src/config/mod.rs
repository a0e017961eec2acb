//! Configuration management for askflow
//!
//! Configuration is a single TOML file with one section per pipeline stage.
//! Loading applies `ASKFLOW_SECTION__KEY` environment overrides and then runs
//! the [`ConfigValidator`], which reports every invalid key at once.

use crate::error::{AskflowError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

mod validator;

pub use validator::ConfigValidator;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(rename = "_meta")]
    pub meta: MetaConfig,
    pub storage: StorageConfig,
    pub classifier: ClassifierConfig,
    pub retrieval: RetrievalConfig,
    pub tiers: TierConfig,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub cache: CacheConfig,
    pub business: BusinessConfig,
    pub memory: MemoryConfig,
    pub sources: SourcesConfig,
    #[serde(default)]
    pub profiles: HashMap<String, ProfileOverrides>,
}

/// Metadata about the configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    pub schema_version: String,
    #[serde(default = "current_timestamp")]
    pub created_at: String,
    #[serde(default = "current_timestamp")]
    pub last_modified: String,
}

fn current_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Where the chunk corpus, business data and chat history live
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// JSONL export of the chunk corpus
    pub chunk_file: PathBuf,
    /// CSV export of business activity records
    pub business_file: PathBuf,
    /// SQLite file for the `sqlite` memory backend
    pub memory_db: PathBuf,
    /// Optional lexicon override; the built-in lexicon is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lexicon_file: Option<PathBuf>,
}

/// Query classifier weights and tie handling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Normalized margin below which the top two domains count as a tie
    pub tie_margin: f32,
    pub product_code_weight: f32,
    pub technical_term_weight: f32,
    pub org_unit_weight: f32,
    pub temporal_weight: f32,
    pub aggregation_weight: f32,
    pub business_term_weight: f32,
    pub personal_marker_weight: f32,
    pub continuity_weight: f32,
}

/// Hybrid retrieval configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Final result size
    pub top_n: usize,
    /// Per-lane over-fetch factor relative to `top_n`
    pub search_multiplier: usize,
    /// RRF K constant (typically 60)
    pub rrf_k: f32,
    pub exact_weight: f32,
    pub sparse_weight: f32,
    pub dense_weight: f32,
    /// Added to every exact-lane hit so it lands above all non-exact candidates
    pub exact_override_weight: f32,
    pub bm25_k1: f32,
    pub bm25_b: f32,
    pub min_dense_similarity: f32,
    pub enable_query_expansion: bool,
    pub enable_reranking: bool,
    pub reranker_model: String,
    pub rerank_candidates_limit: usize,
    /// Corpus size above which the dense lane switches to HNSW
    pub ann_threshold: usize,
    pub hnsw_m: usize,
    pub hnsw_ef_construction: usize,
    pub hnsw_ef_search: usize,
}

/// Model tier selection and per-tier model profiles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConfig {
    /// Retrieval confidence below this escalates to the complex tier
    pub confidence_floor: f32,
    pub max_query_chars: usize,
    pub max_model_codes: usize,
    pub max_source_docs: usize,
    pub simple: TierProfileConfig,
    pub complex: TierProfileConfig,
    pub business: TierProfileConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierProfileConfig {
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Template with `{instructions}`, `{history}`, `{context}` and `{question}` slots
    pub prompt_template: String,
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// "openai", "anthropic" or "local"
    pub provider: String,
    pub api_key_env: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_api_key_env: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_base_url: Option<String>,
    /// Per-attempt timeout, e.g. "60s"
    pub timeout: String,
    pub max_retries: u32,
    pub initial_backoff: String,
    pub max_backoff: String,
}

/// Embedding configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// "local" (fastembed), "openai" or "none"
    pub provider: String,
    pub model: String,
    pub dimension: usize,
    pub batch_size: usize,
}

/// Response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl: String,
    pub max_entries: u64,
}

/// Business analytics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessConfig {
    /// "model" or "rules"
    pub plan_generator: String,
    pub max_plan_attempts: u32,
    pub sandbox_timeout: String,
    pub max_scan_rows: usize,
    pub max_groups: usize,
    pub max_result_rows: usize,
    /// Relative period-over-period change that counts as a trend
    pub trend_threshold: f64,
    /// z-score bound for anomalies
    pub anomaly_z: f64,
    /// Window used for a bare "recent" with no number
    pub default_window_days: i64,
    /// Let the business tier write a lead paragraph above the narrative
    pub narrate_with_model: bool,
}

/// Conversation memory configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// "memory" or "sqlite"
    pub backend: String,
    pub history_limit: usize,
    pub max_turns_per_session: usize,
    /// Sessions the in-process backend keeps before evicting
    pub max_sessions: u64,
    /// Idle time after which the in-process backend drops a session
    pub session_idle: String,
}

/// Source citation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    pub max_sources: usize,
    pub preview_chars: usize,
}

/// Profile-specific configuration overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_reranking: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_generator: Option<String>,
}

impl Config {
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(AskflowError::ConfigNotFound {
                path: path.to_path_buf(),
            });
        }

        let content = std::fs::read_to_string(path).map_err(|e| AskflowError::Io {
            source: e,
            context: format!("Failed to read config file: {:?}", path),
        })?;
        let mut config: Config = toml::from_str(&content)?;

        config.apply_env_overrides();

        ConfigValidator::validate(&config)?;

        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|e| AskflowError::Io {
            source: e,
            context: format!("Failed to write config file: {:?}", path),
        })?;
        Ok(())
    }

    /// Load configuration with a specific profile applied
    pub fn load_with_profile(path: &Path, profile: &str) -> Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_profile(profile)?;
        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    /// Apply a profile's overrides to the configuration
    pub fn apply_profile(&mut self, profile: &str) -> Result<()> {
        let overrides = self
            .profiles
            .get(profile)
            .cloned()
            .ok_or_else(|| AskflowError::Config(format!("Unknown profile: {}", profile)))?;

        if let Some(provider) = overrides.llm_provider {
            self.llm.provider = provider;
        }
        if let Some(provider) = overrides.embedding_provider {
            self.embedding.provider = provider;
        }
        if let Some(enabled) = overrides.enable_reranking {
            self.retrieval.enable_reranking = enabled;
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = enabled;
        }
        if let Some(generator) = overrides.plan_generator {
            self.business.plan_generator = generator;
        }
        Ok(())
    }

    /// Apply environment variable overrides
    /// Environment variables in format: ASKFLOW_SECTION__KEY=value
    pub fn apply_env_overrides(&mut self) {
        let vars: Vec<(String, String)> = std::env::vars().collect();
        self.apply_overrides(vars);
    }

    fn apply_overrides<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if let Some(config_key) = key.strip_prefix("ASKFLOW_") {
                if let Err(e) = self.set_value_from_env(config_key, &value) {
                    tracing::warn!("Failed to apply env override {}: {}", key, e);
                }
            }
        }
    }

    fn set_value_from_env(&mut self, path: &str, value: &str) -> Result<()> {
        match path {
            "STORAGE__DATA_DIR" => self.storage.data_dir = PathBuf::from(value),
            "STORAGE__CHUNK_FILE" => self.storage.chunk_file = PathBuf::from(value),
            "STORAGE__BUSINESS_FILE" => self.storage.business_file = PathBuf::from(value),
            "LLM__PROVIDER" => self.llm.provider = value.to_string(),
            "LLM__FALLBACK_PROVIDER" => self.llm.fallback_provider = Some(value.to_string()),
            "LLM__TIMEOUT" => self.llm.timeout = value.to_string(),
            "LLM__MAX_RETRIES" => self.llm.max_retries = parse_env(path, value)?,
            "EMBEDDING__PROVIDER" => self.embedding.provider = value.to_string(),
            "EMBEDDING__MODEL" => self.embedding.model = value.to_string(),
            "CACHE__ENABLED" => self.cache.enabled = parse_env(path, value)?,
            "CACHE__TTL" => self.cache.ttl = value.to_string(),
            "CLASSIFIER__TIE_MARGIN" => self.classifier.tie_margin = parse_env(path, value)?,
            "TIERS__CONFIDENCE_FLOOR" => self.tiers.confidence_floor = parse_env(path, value)?,
            "BUSINESS__PLAN_GENERATOR" => self.business.plan_generator = value.to_string(),
            "BUSINESS__MAX_PLAN_ATTEMPTS" => {
                self.business.max_plan_attempts = parse_env(path, value)?
            }
            "MEMORY__BACKEND" => self.memory.backend = value.to_string(),
            "MEMORY__MAX_SESSIONS" => self.memory.max_sessions = parse_env(path, value)?,
            "MEMORY__SESSION_IDLE" => self.memory.session_idle = value.to_string(),
            _ => {
                tracing::debug!("Unknown env config key: {}", path);
            }
        }
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| AskflowError::Config("Cannot determine config directory".to_string()))?;

        Ok(config_dir.join("askflow").join("config.toml"))
    }

    /// Get the default data directory
    pub fn default_data_dir() -> Result<PathBuf> {
        let home_dir = dirs::home_dir()
            .ok_or_else(|| AskflowError::Config("Cannot determine home directory".to_string()))?;

        Ok(home_dir.join(".askflow"))
    }
}

fn parse_env<T: std::str::FromStr>(path: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| AskflowError::InvalidConfigValue {
        path: path.to_string(),
        message: format!("Cannot parse '{}'", value),
    })
}

/// Resolve a leading `~` against the home directory
pub fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

/// Parse a duration string such as "250ms", "30s", "5m", "24h" or "7d"
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let split = value.find(|c: char| !c.is_ascii_digit())?;
    let (number, unit) = value.split_at(split);
    let number: u64 = number.parse().ok()?;

    match unit {
        "ms" => Some(Duration::from_millis(number)),
        "s" => Some(Duration::from_secs(number)),
        "m" => Some(Duration::from_secs(number * 60)),
        "h" => Some(Duration::from_secs(number * 3600)),
        "d" => Some(Duration::from_secs(number * 86_400)),
        _ => None,
    }
}

impl LlmConfig {
    pub fn timeout_duration(&self) -> Duration {
        parse_duration(&self.timeout).unwrap_or(Duration::from_secs(60))
    }

    pub fn initial_backoff_duration(&self) -> Duration {
        parse_duration(&self.initial_backoff).unwrap_or(Duration::from_millis(500))
    }

    pub fn max_backoff_duration(&self) -> Duration {
        parse_duration(&self.max_backoff).unwrap_or(Duration::from_secs(30))
    }
}

impl CacheConfig {
    pub fn ttl_duration(&self) -> Duration {
        parse_duration(&self.ttl).unwrap_or(Duration::from_secs(86_400))
    }
}

impl MemoryConfig {
    pub fn session_idle_duration(&self) -> Duration {
        parse_duration(&self.session_idle).unwrap_or(Duration::from_secs(86_400))
    }
}

impl BusinessConfig {
    pub fn sandbox_timeout_duration(&self) -> Duration {
        parse_duration(&self.sandbox_timeout).unwrap_or(Duration::from_secs(5))
    }
}

const SIMPLE_TEMPLATE: &str = "{instructions}\n\nAnswer briefly and only from the context.\n\n### History\n{history}\n\n### Context\n{context}\n\n### Question\n{question}\n";

const COMPLEX_TEMPLATE: &str = "{instructions}\n\nWork through the context step by step, compare the relevant items explicitly and cite the source label for every fact.\n\n### History\n{history}\n\n### Context\n{context}\n\n### Question\n{question}\n";

const BUSINESS_TEMPLATE: &str = "{instructions}\n\nYou are a sales operations analyst. Lead with a direct one-paragraph answer, then keep the figures exactly as given.\n\n### History\n{history}\n\n### Context\n{context}\n\n### Question\n{question}\n";

impl Default for Config {
    fn default() -> Self {
        let data_dir = PathBuf::from("~/.askflow");

        let mut profiles = HashMap::new();
        profiles.insert(
            "offline".to_string(),
            ProfileOverrides {
                llm_provider: Some("local".to_string()),
                embedding_provider: Some("local".to_string()),
                enable_reranking: Some(false),
                cache_enabled: None,
                plan_generator: Some("rules".to_string()),
            },
        );

        Self {
            meta: MetaConfig {
                schema_version: "1.0.0".to_string(),
                created_at: current_timestamp(),
                last_modified: current_timestamp(),
            },
            storage: StorageConfig {
                data_dir: data_dir.clone(),
                chunk_file: data_dir.join("index").join("chunks.jsonl"),
                business_file: data_dir.join("business").join("clean_business.csv"),
                memory_db: data_dir.join("memory.db"),
                lexicon_file: None,
            },
            classifier: ClassifierConfig {
                tie_margin: 0.2,
                product_code_weight: 2.0,
                technical_term_weight: 1.0,
                org_unit_weight: 2.0,
                temporal_weight: 1.0,
                aggregation_weight: 1.0,
                business_term_weight: 1.0,
                personal_marker_weight: 2.0,
                continuity_weight: 1.0,
            },
            retrieval: RetrievalConfig {
                top_n: 8,
                search_multiplier: 4,
                rrf_k: 60.0,
                exact_weight: 1.0,
                sparse_weight: 1.0,
                dense_weight: 1.0,
                exact_override_weight: 1.0,
                bm25_k1: 1.2,
                bm25_b: 0.75,
                min_dense_similarity: 0.0,
                enable_query_expansion: true,
                enable_reranking: false,
                reranker_model: "bge-reranker-v2-m3".to_string(),
                rerank_candidates_limit: 20,
                ann_threshold: 5_000,
                hnsw_m: 16,
                hnsw_ef_construction: 200,
                hnsw_ef_search: 64,
            },
            tiers: TierConfig {
                confidence_floor: 0.35,
                max_query_chars: 100,
                max_model_codes: 2,
                max_source_docs: 5,
                simple: TierProfileConfig {
                    model: "gpt-4o-mini".to_string(),
                    fallback_model: Some("claude-3-5-haiku-latest".to_string()),
                    temperature: 0.3,
                    max_tokens: 800,
                    prompt_template: SIMPLE_TEMPLATE.to_string(),
                },
                complex: TierProfileConfig {
                    model: "gpt-4o".to_string(),
                    fallback_model: Some("claude-3-5-sonnet-latest".to_string()),
                    temperature: 0.2,
                    max_tokens: 2000,
                    prompt_template: COMPLEX_TEMPLATE.to_string(),
                },
                business: TierProfileConfig {
                    model: "gpt-4o-mini".to_string(),
                    fallback_model: Some("claude-3-5-haiku-latest".to_string()),
                    temperature: 0.1,
                    max_tokens: 1500,
                    prompt_template: BUSINESS_TEMPLATE.to_string(),
                },
            },
            llm: LlmConfig {
                provider: "openai".to_string(),
                api_key_env: "OPENAI_API_KEY".to_string(),
                base_url: None,
                fallback_provider: Some("anthropic".to_string()),
                fallback_api_key_env: Some("ANTHROPIC_API_KEY".to_string()),
                fallback_base_url: None,
                timeout: "60s".to_string(),
                max_retries: 3,
                initial_backoff: "500ms".to_string(),
                max_backoff: "30s".to_string(),
            },
            embedding: EmbeddingConfig {
                provider: "local".to_string(),
                model: "multilingual-e5-small".to_string(),
                dimension: 384,
                batch_size: 32,
            },
            cache: CacheConfig {
                enabled: true,
                ttl: "24h".to_string(),
                max_entries: 1000,
            },
            business: BusinessConfig {
                plan_generator: "model".to_string(),
                max_plan_attempts: 3,
                sandbox_timeout: "5s".to_string(),
                max_scan_rows: 1_000_000,
                max_groups: 10_000,
                max_result_rows: 50,
                trend_threshold: 0.1,
                anomaly_z: 2.0,
                default_window_days: 90,
                narrate_with_model: true,
            },
            memory: MemoryConfig {
                backend: "memory".to_string(),
                history_limit: 5,
                max_turns_per_session: 50,
                max_sessions: 10_000,
                session_idle: "24h".to_string(),
            },
            sources: SourcesConfig {
                max_sources: 3,
                preview_chars: 200,
            },
            profiles,
        }
    }
}
