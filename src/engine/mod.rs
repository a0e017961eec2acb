//! Process-wide knowledge engine
//!
//! The engine owns the chunk index, the business dataset, the response cache
//! and conversation memory, and implements every public operation on top of
//! them. Build it with [`EngineBuilder`], then call
//! [`KnowledgeEngine::initialize`] to load the index and dataset.
//!
//! The index and dataset each sit behind a `tokio::sync::RwLock`. Queries
//! hold the read guard while they search; reloads build the new snapshot
//! outside the lock, swap it in under the write guard and invalidate the
//! cache before releasing it.

use crate::business::{
    ActivityDataset, BusinessAnalyzer, BusinessAnswer, BusinessIntent, CsvDatasetSource, DatasetSource,
    DatasetStats, Insight, ModelPlanGenerator, PlanGenerator, RulePlanGenerator, SchemaInfo,
};
use crate::cache::{CacheEntry, CacheOrigin, CacheStats, Fingerprint, ResponseCache};
use crate::classifier::{Classification, Domain, QueryClassifier};
use crate::config::{expand_tilde, Config};
use crate::error::{AskflowError, DomainError, Result};
use crate::lexicon::Lexicon;
use crate::memory::{open_memory, ConversationMemory, Exchange};
use crate::prompt;
use crate::provider::ModelRouter;
use crate::retrieval::{
    distinct_sources, CallerIdentity, ChunkIndex, ChunkSource, FastEmbedReranker, HybridRetriever,
    IndexStats, JsonlChunkSource, Reranker, RetrievalRequest, RetrievalResult, SourceRef,
};
use crate::tier::{ModelTier, TierDecision, TierReason, TierSelector};
use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// One question as received
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub text: String,
    pub session_id: String,
    #[serde(default)]
    pub caller: CallerIdentity,
    /// Forces the domain instead of classifying
    #[serde(default)]
    pub domain_override: Option<Domain>,
    #[serde(default)]
    pub tier_override: Option<ModelTier>,
}

impl Query {
    pub fn new(text: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            session_id: session_id.into(),
            caller: CallerIdentity::default(),
            domain_override: None,
            tier_override: None,
        }
    }

    pub fn with_caller(mut self, caller: CallerIdentity) -> Self {
        self.caller = caller;
        self
    }

    pub fn with_domain(mut self, domain: Domain) -> Self {
        self.domain_override = Some(domain);
        self
    }

    pub fn with_tier(mut self, tier: ModelTier) -> Self {
        self.tier_override = Some(tier);
        self
    }
}

/// Response of [`KnowledgeEngine::ask`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub answer: String,
    pub sources: Vec<SourceRef>,
    /// Domain the answer was drawn from
    pub source_type: Domain,
    pub tier_used: ModelTier,
    pub tier_reasons: Vec<TierReason>,
    pub insights: Vec<Insight>,
    pub notes: Vec<String>,
    pub classification: Classification,
    pub cache_origin: CacheOrigin,
    pub fingerprint: String,
}

/// Counts after a reload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReloadReport {
    pub documents: usize,
    pub chunks: usize,
    pub records: usize,
}

/// Snapshot returned by [`KnowledgeEngine::quick_stats`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub dataset: Option<DatasetStats>,
    pub index: Option<IndexStats>,
    pub cache: CacheStats,
}

/// Assembles a [`KnowledgeEngine`]; every collaborator defaults from config
pub struct EngineBuilder {
    config: Config,
    lexicon: Option<Arc<Lexicon>>,
    router: Option<Arc<ModelRouter>>,
    chunk_source: Option<Arc<dyn ChunkSource>>,
    dataset_source: Option<Arc<dyn DatasetSource>>,
    memory: Option<Arc<dyn ConversationMemory>>,
    plan_generator: Option<Arc<dyn PlanGenerator>>,
    reranker: Option<Arc<dyn Reranker>>,
}

impl EngineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            lexicon: None,
            router: None,
            chunk_source: None,
            dataset_source: None,
            memory: None,
            plan_generator: None,
            reranker: None,
        }
    }

    pub fn lexicon(mut self, lexicon: Arc<Lexicon>) -> Self {
        self.lexicon = Some(lexicon);
        self
    }

    pub fn router(mut self, router: Arc<ModelRouter>) -> Self {
        self.router = Some(router);
        self
    }

    pub fn chunk_source(mut self, source: Arc<dyn ChunkSource>) -> Self {
        self.chunk_source = Some(source);
        self
    }

    pub fn dataset_source(mut self, source: Arc<dyn DatasetSource>) -> Self {
        self.dataset_source = Some(source);
        self
    }

    pub fn memory(mut self, memory: Arc<dyn ConversationMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn plan_generator(mut self, generator: Arc<dyn PlanGenerator>) -> Self {
        self.plan_generator = Some(generator);
        self
    }

    pub fn reranker(mut self, reranker: Arc<dyn Reranker>) -> Self {
        self.reranker = Some(reranker);
        self
    }

    pub fn build(self) -> Result<KnowledgeEngine> {
        let config = self.config;

        let lexicon = match self.lexicon {
            Some(lexicon) => lexicon,
            None => Arc::new(match &config.storage.lexicon_file {
                Some(path) => Lexicon::from_file(&expand_tilde(path))?,
                None => Lexicon::builtin()?,
            }),
        };

        let router = match self.router {
            Some(router) => router,
            None => Arc::new(ModelRouter::from_config(&config)?),
        };

        let tiers = TierSelector::new(Arc::clone(&lexicon), config.tiers.clone());

        let generator: Arc<dyn PlanGenerator> = match self.plan_generator {
            Some(generator) => generator,
            None => match config.business.plan_generator.as_str() {
                "rules" => Arc::new(RulePlanGenerator),
                "model" if router.primary_name() == "local" => {
                    info!("Local provider cannot emit JSON plans; using rule-based plans");
                    Arc::new(RulePlanGenerator)
                }
                "model" => Arc::new(ModelPlanGenerator::new(
                    Arc::clone(&router),
                    tiers.profile(ModelTier::Business),
                )),
                other => {
                    return Err(AskflowError::InvalidConfigValue {
                        path: "business.plan_generator".to_string(),
                        message: format!("Unknown plan generator '{}'", other),
                    })
                }
            },
        };

        let mut retriever = HybridRetriever::new(
            Arc::clone(&lexicon),
            router.embedder(),
            config.retrieval.clone(),
        )?;
        let reranker = match self.reranker {
            Some(reranker) => Some(reranker),
            None if config.retrieval.enable_reranking => {
                match FastEmbedReranker::new(&config.retrieval.reranker_model) {
                    Ok(reranker) => Some(Arc::new(reranker) as Arc<dyn Reranker>),
                    Err(e) => {
                        warn!(error = %e, "Reranker unavailable; continuing without it");
                        None
                    }
                }
            }
            None => None,
        };
        if let Some(reranker) = reranker {
            retriever = retriever.with_reranker(reranker);
        }

        let memory = match self.memory {
            Some(memory) => memory,
            None => open_memory(&config.memory, &expand_tilde(&config.storage.memory_db))?,
        };

        let chunk_source = self
            .chunk_source
            .unwrap_or_else(|| Arc::new(JsonlChunkSource::new(expand_tilde(&config.storage.chunk_file))));
        let dataset_source = self
            .dataset_source
            .unwrap_or_else(|| Arc::new(CsvDatasetSource::new(expand_tilde(&config.storage.business_file))));

        let analyzer = BusinessAnalyzer::new(Arc::clone(&lexicon), config.business.clone(), generator)?;

        info!(
            provider = router.primary_name(),
            plan_generator = analyzer.generator_name(),
            memory = %config.memory.backend,
            cache = config.cache.enabled,
            "Knowledge engine assembled"
        );

        Ok(KnowledgeEngine {
            classifier: QueryClassifier::new(Arc::clone(&lexicon), config.classifier.clone()),
            retriever,
            tiers,
            router,
            analyzer,
            cache: ResponseCache::new(&config.cache),
            memory,
            chunk_source,
            dataset_source,
            index: RwLock::new(None),
            dataset: RwLock::new(None),
            config,
        })
    }
}

/// Material gathered before the cache lookup
struct Prepared {
    /// Cache epoch current before any snapshot was read
    epoch: u64,
    classification: Classification,
    history: Vec<Exchange>,
    retrieval: Option<RetrievalResult>,
    business: Option<(BusinessIntent, Arc<ActivityDataset>)>,
    decision: TierDecision,
}

pub struct KnowledgeEngine {
    config: Config,
    classifier: QueryClassifier,
    retriever: HybridRetriever,
    tiers: TierSelector,
    router: Arc<ModelRouter>,
    analyzer: BusinessAnalyzer,
    cache: ResponseCache,
    memory: Arc<dyn ConversationMemory>,
    chunk_source: Arc<dyn ChunkSource>,
    dataset_source: Arc<dyn DatasetSource>,
    index: RwLock<Option<Arc<ChunkIndex>>>,
    dataset: RwLock<Option<Arc<ActivityDataset>>>,
}

impl KnowledgeEngine {
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    /// Load the index and the dataset
    ///
    /// A source that cannot be read is logged and left unloaded; the
    /// operations that need it then fail with an infrastructure error.
    pub async fn initialize(&self) -> Result<()> {
        if let Err(e) = self.reload_index().await {
            warn!(source = %self.chunk_source.describe(), error = %e, "Chunk index not loaded");
        }
        if let Err(e) = self.reload_business_data().await {
            warn!(source = %self.dataset_source.describe(), error = %e, "Business dataset not loaded");
        }
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    fn today() -> NaiveDate {
        chrono::Local::now().date_naive()
    }

    /// Answer a question from documents, business data, or both
    pub async fn ask(&self, query: Query) -> Result<Answer> {
        let question = query.text.trim();
        let prepared = self.prepare(&query).await?;

        let scopes = prepared
            .retrieval
            .as_ref()
            .map(|r| r.scopes.clone())
            .unwrap_or_default();
        let intent_signature = prepared.business.as_ref().map(|(intent, _)| intent.signature());
        let evidence = prepared
            .retrieval
            .iter()
            .flat_map(|r| r.chunk_ids())
            .chain(intent_signature.as_deref());
        let fingerprint = Fingerprint::compute(question, &scopes, prepared.decision.tier, evidence);

        debug!(
            fingerprint = %fingerprint,
            domain = %prepared.classification.domain,
            tier = %prepared.decision.tier,
            "Answering"
        );

        let outcome = self
            .cache
            .get_or_compute_at(prepared.epoch, fingerprint, || self.compute(question, &prepared))
            .await;
        if let Some(reason) = &outcome.unavailable {
            debug!(reason = %reason, "Answered without the response cache");
        }

        let entry = match outcome.result {
            Ok(entry) => entry,
            Err(e) => Arc::new(CacheEntry {
                answer: e.note(),
                sources: Vec::new(),
                tier: prepared.decision.tier,
                insights: Vec::new(),
                notes: vec![e.note()],
                created_at: Utc::now(),
                ttl: self.cache.ttl(),
                degraded: true,
            }),
        };

        let domain = prepared.classification.domain;
        self.record_exchange(
            &query.session_id,
            Exchange::new(question, entry.answer.clone(), Some(domain)),
        )
        .await;

        Ok(Answer {
            answer: entry.answer.clone(),
            sources: entry.sources.clone(),
            source_type: domain,
            tier_used: entry.tier,
            tier_reasons: prepared.decision.reasons,
            insights: entry.insights.clone(),
            notes: entry.notes.clone(),
            classification: prepared.classification,
            cache_origin: outcome.origin,
            fingerprint: fingerprint.to_hex(),
        })
    }

    async fn prepare(&self, query: &Query) -> Result<Prepared> {
        // Reloads swap data before bumping the epoch, so an epoch read first
        // is never newer than the index or dataset read below
        let epoch = self.cache.epoch();
        let history = self.recent_history(&query.session_id).await;

        let classification = match query.domain_override {
            Some(domain) => Classification::overridden(domain),
            None => self.classifier.classify(&query.text, &history),
        };

        let needs_documents =
            classification.involves(Domain::Technical) || classification.involves(Domain::Personal);
        let retrieval = if needs_documents {
            let scopes = query.caller.scopes_for(&classification);
            let request = RetrievalRequest::new(query.text.trim(), scopes, self.config.retrieval.top_n);
            let guard = self.index.read().await;
            let index = guard
                .as_deref()
                .ok_or_else(|| AskflowError::IndexUnavailable("chunk index has not been loaded".to_string()))?;
            Some(self.retriever.retrieve(index, &request).await)
        } else {
            None
        };

        let business = if classification.involves(Domain::Business) {
            let dataset = self.current_dataset().await?;
            let intent = self.analyzer.parse_intent(&query.text, &dataset, Self::today());
            Some((intent, dataset))
        } else {
            None
        };

        let decision = self.tiers.select(
            &classification,
            retrieval.as_ref(),
            &query.text,
            query.tier_override,
        );

        Ok(Prepared {
            epoch,
            classification,
            history,
            retrieval,
            business,
            decision,
        })
    }

    async fn recent_history(&self, session_id: &str) -> Vec<Exchange> {
        let memory = Arc::clone(&self.memory);
        let session = session_id.to_string();
        let limit = self.config.memory.history_limit;
        match tokio::task::spawn_blocking(move || memory.recent(&session, limit)).await {
            Ok(Ok(history)) => history,
            Ok(Err(e)) => {
                warn!(session = %session_id, error = %e, "Conversation history unavailable");
                Vec::new()
            }
            Err(e) => {
                warn!(session = %session_id, error = %e, "Conversation history lookup aborted");
                Vec::new()
            }
        }
    }

    async fn record_exchange(&self, session_id: &str, exchange: Exchange) {
        let memory = Arc::clone(&self.memory);
        let session = session_id.to_string();
        match tokio::task::spawn_blocking(move || memory.append(&session, exchange)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(session = %session_id, error = %e, "Failed to record exchange"),
            Err(e) => warn!(session = %session_id, error = %e, "Recording exchange aborted"),
        }
    }

    /// The answer pipeline behind the cache
    async fn compute(&self, question: &str, prepared: &Prepared) -> std::result::Result<CacheEntry, DomainError> {
        let tier = prepared.decision.tier;
        let profile = self.tiers.profile(tier);
        let mut notes = Vec::new();
        let mut degraded = false;

        if let Some(ambiguity) = prepared.classification.ambiguity() {
            notes.push(ambiguity.note());
        }

        let mut sources = Vec::new();
        let mut document_context = None;
        if let Some(retrieval) = &prepared.retrieval {
            if retrieval.is_empty() {
                notes.push(DomainError::RetrievalEmpty.note());
            }
            for lane_error in &retrieval.lane_errors {
                debug!(error = %lane_error, "Retrieval lane contributed nothing");
            }
            document_context = Some(prompt::document_context(retrieval));
            sources = distinct_sources(
                &retrieval.chunks,
                self.config.sources.max_sources,
                self.config.sources.preview_chars,
            );
        }

        let mut insights = Vec::new();
        let mut business_answer: Option<BusinessAnswer> = None;
        if let Some((intent, dataset)) = &prepared.business {
            let analysis = self
                .analyzer
                .analyze_intent(question, intent.clone(), Arc::clone(dataset), Self::today())
                .await;
            if analysis.is_failed() {
                degraded = true;
            }
            notes.extend(analysis.notes.iter().cloned());
            insights = analysis.insights.clone();
            sources.insert(
                0,
                SourceRef::business_data(dataset.source(), intent.filters.describe()),
            );
            sources.truncate(self.config.sources.max_sources.max(1));
            business_answer = Some(analysis);
        }

        let answer = match (&document_context, &business_answer) {
            (None, Some(analysis)) => {
                if analysis.is_failed() || !self.config.business.narrate_with_model {
                    analysis.answer.clone()
                } else {
                    let prompt = prompt::render(
                        &profile.prompt_template,
                        prompt::BUSINESS_INSTRUCTIONS,
                        &prepared.history,
                        &analysis.answer,
                        question,
                    );
                    let outcome = self.router.generate(&prompt, &profile).await;
                    match outcome.result {
                        Ok(lead) => format!("{}\n\n{}", lead.trim(), analysis.answer),
                        Err(e) => {
                            warn!(attempts = outcome.attempts, error = %e, "Business narration failed");
                            let err = DomainError::ModelProvider {
                                attempts: outcome.attempts,
                                message: e.to_string(),
                            };
                            notes.push(err.note());
                            degraded = true;
                            analysis.answer.clone()
                        }
                    }
                }
            }
            (Some(context), business) => {
                let (instructions, context) = match business {
                    Some(analysis) => (
                        prompt::MIXED_INSTRUCTIONS,
                        format!(
                            "Documents:\n{}\n\nBusiness analysis:\n{}",
                            if context.is_empty() { prompt::NO_CONTEXT } else { context.as_str() },
                            analysis.answer
                        ),
                    ),
                    None => (prompt::DOCUMENT_INSTRUCTIONS, context.clone()),
                };
                let prompt = prompt::render(
                    &profile.prompt_template,
                    instructions,
                    &prepared.history,
                    &context,
                    question,
                );
                let outcome = self.router.generate(&prompt, &profile).await;
                match outcome.result {
                    Ok(text) => {
                        debug!(
                            provider = %outcome.provider,
                            attempts = outcome.attempts,
                            fallback = outcome.used_fallback,
                            "Generated answer"
                        );
                        text.trim().to_string()
                    }
                    Err(e) => {
                        warn!(attempts = outcome.attempts, error = %e, "Model providers exhausted");
                        let err = DomainError::ModelProvider {
                            attempts: outcome.attempts,
                            message: e.to_string(),
                        };
                        notes.push(err.note());
                        degraded = true;
                        degraded_answer(&sources, business.as_ref().map(|a| a.answer.as_str()))
                    }
                }
            }
            (None, None) => {
                return Err(DomainError::RetrievalEmpty);
            }
        };

        Ok(CacheEntry {
            answer,
            sources,
            tier,
            insights,
            notes,
            created_at: Utc::now(),
            ttl: self.cache.ttl(),
            degraded,
        })
    }

    /// Run the business pipeline directly, without classification or caching
    pub async fn business_query(&self, question: &str) -> Result<BusinessAnswer> {
        let dataset = self.current_dataset().await?;
        Ok(self.analyzer.analyze(question, dataset, Self::today()).await)
    }

    pub async fn schema_info(&self) -> Result<SchemaInfo> {
        Ok(self.current_dataset().await?.schema_info())
    }

    /// Cheap counters; never runs the answer pipeline
    pub async fn quick_stats(&self) -> EngineStats {
        let dataset = self
            .dataset
            .read()
            .await
            .as_ref()
            .map(|d| d.quick_stats(Self::today()));
        let index = self.index.read().await.as_ref().map(|i| i.stats());

        EngineStats {
            dataset,
            index,
            cache: self.cache.stats(),
        }
    }

    /// Rebuild the chunk index from its source and invalidate the cache
    pub async fn reload_index(&self) -> Result<ReloadReport> {
        let records = self.chunk_source.load().await?;
        let config = self.config.retrieval.clone();
        let index = tokio::task::spawn_blocking(move || ChunkIndex::build(records, &config))
            .await
            .map_err(|e| AskflowError::Other(anyhow::anyhow!("index build failed: {}", e)))?;
        let stats = index.stats();

        {
            let mut guard = self.index.write().await;
            *guard = Some(Arc::new(index));
            self.cache.invalidate_all();
        }

        info!(
            source = %self.chunk_source.describe(),
            documents = stats.documents,
            chunks = stats.chunks,
            "Chunk index reloaded"
        );
        Ok(ReloadReport {
            documents: stats.documents,
            chunks: stats.chunks,
            records: 0,
        })
    }

    /// Reload business records and invalidate the cache
    pub async fn reload_business_data(&self) -> Result<ReloadReport> {
        let records = self.dataset_source.load().await?;
        let dataset = ActivityDataset::new(records, self.dataset_source.describe());
        let count = dataset.len();

        {
            let mut guard = self.dataset.write().await;
            *guard = Some(Arc::new(dataset));
            self.cache.invalidate_all();
        }

        info!(source = %self.dataset_source.describe(), records = count, "Business dataset reloaded");
        Ok(ReloadReport {
            records: count,
            ..Default::default()
        })
    }

    async fn current_dataset(&self) -> Result<Arc<ActivityDataset>> {
        self.dataset
            .read()
            .await
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| AskflowError::DatasetUnavailable("business data has not been loaded".to_string()))
    }
}

/// Answer text when no model could be reached
fn degraded_answer(sources: &[SourceRef], business: Option<&str>) -> String {
    let mut parts = Vec::new();
    if let Some(narrative) = business {
        parts.push(narrative.to_string());
    }
    let documents: Vec<String> = sources
        .iter()
        .filter(|s| s.kind == crate::retrieval::SourceKind::Document)
        .enumerate()
        .map(|(i, s)| format!("[{}] {}: {}", i + 1, s.doc_name, s.preview))
        .collect();
    if !documents.is_empty() {
        parts.push(format!("Retrieved material:\n{}", documents.join("\n")));
    }
    if parts.is_empty() {
        "No answer could be generated and no material was retrieved.".to_string()
    } else {
        parts.join("\n\n")
    }
}
