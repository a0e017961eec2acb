//! Shared fixtures for integration tests
#![allow(dead_code)]

use askflow::business::{BusinessQueryPlan, Dimension, IntentKind, PlanError, PlanGenerator, PlanOp, PlanRequest};
use askflow::config::Config;
use askflow::provider::{ModelError, ModelProvider, ModelRouter, RetryPolicy};
use askflow::retrieval::{ChunkRecord, Scope};
use askflow::tier::TierProfile;
use askflow::KnowledgeEngine;
use async_trait::async_trait;
use chrono::{Duration as Days, Local, NaiveDate};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Provider that answers every prompt and counts the calls
pub struct CountingProvider {
    pub calls: AtomicUsize,
    delay: Option<Duration>,
}

impl CountingProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay: None,
        })
    }

    /// Each generation sleeps first, so concurrent callers overlap
    pub fn delayed(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            delay: Some(delay),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelProvider for CountingProvider {
    async fn generate(&self, _prompt: &str, profile: &TierProfile) -> Result<String, ModelError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(format!("Generated answer #{} ({})", n, profile.tier))
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ModelError> {
        Err(ModelError::Unsupported("embeddings".to_string()))
    }

    fn name(&self) -> &str {
        "counting"
    }
}

/// Provider whose every call fails with a server error
pub struct FailingProvider {
    pub calls: AtomicUsize,
}

impl FailingProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelProvider for FailingProvider {
    async fn generate(&self, _prompt: &str, _profile: &TierProfile) -> Result<String, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(ModelError::Server {
            status: 503,
            message: "upstream unavailable".to_string(),
        })
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ModelError> {
        Err(ModelError::Unsupported("embeddings".to_string()))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// Plan generator that never produces an aggregate step
pub struct MalformedPlanGenerator {
    pub calls: AtomicUsize,
}

impl MalformedPlanGenerator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl PlanGenerator for MalformedPlanGenerator {
    async fn generate(&self, _request: &PlanRequest) -> Result<BusinessQueryPlan, PlanError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(BusinessQueryPlan {
            intent: IntentKind::Aggregate,
            ops: vec![PlanOp::Group { by: Dimension::Worker }],
        })
    }

    fn name(&self) -> &str {
        "malformed"
    }
}

pub fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 2,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(2),
        timeout: Duration::from_secs(5),
    }
}

pub fn router(provider: Arc<dyn ModelProvider>) -> Arc<ModelRouter> {
    Arc::new(ModelRouter::new(provider, fast_policy()))
}

pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

fn chunk(id: &str, doc: &str, name: &str, scope: Scope, text: &str) -> ChunkRecord {
    ChunkRecord {
        id: id.to_string(),
        doc_id: doc.to_string(),
        doc_name: Some(name.to_string()),
        modified_at: None,
        scope,
        text: text.to_string(),
        embedding: None,
    }
}

/// Product documents across public, department and personal scopes
pub fn corpus() -> Vec<ChunkRecord> {
    vec![
        chunk(
            "mxj-1",
            "mxj-manual",
            "MXJ 精密滑台型錄",
            Scope::Public,
            "MXJ6-10 精密滑台氣缸，行程 10mm，缸徑 6mm，安裝時使用 M3 螺絲固定。",
        ),
        chunk(
            "mxh-1",
            "mxh-manual",
            "MXH 滑台型錄",
            Scope::Public,
            "MXH10-20 滑台氣缸規格：行程 20mm，缸徑 10mm，適用於輕負載搬運。",
        ),
        chunk(
            "sy-1",
            "valve-guide",
            "電磁閥故障排除",
            Scope::Public,
            "SY5120 電磁閥故障排除：線圈過熱時請先檢查供應電壓與接線。",
        ),
        chunk(
            "gasket-1",
            "gasket-guide",
            "華爾卡墊片安裝指南",
            Scope::Public,
            "華爾卡 No.6500 墊片安裝指南，鎖緊螺栓時請依對角順序施力。",
        ),
        chunk(
            "sales-1",
            "sales-handbook",
            "業務部報價手冊",
            Scope::Department("sales".to_string()),
            "業務部內部報價流程：MXJ6-10 需附上交期與安裝說明。",
        ),
        chunk(
            "notes-1",
            "u1-notes",
            "我的拜訪筆記",
            Scope::Personal("u1".to_string()),
            "我的筆記：客戶反映 MXJ6-10 行程不足，下次拜訪帶 MXH10-20 樣品。",
        ),
    ]
}

pub fn write_corpus(path: &Path, records: &[ChunkRecord]) {
    let lines: Vec<String> = records
        .iter()
        .map(|r| serde_json::to_string(r).unwrap())
        .collect();
    std::fs::write(path, lines.join("\n")).unwrap();
}

fn csv_row(date: NaiveDate, worker: &str, customer: &str, class: &str, depart: &str) -> String {
    format!(
        "{},{},{},{},例行拜訪紀錄,{},林經理,一般,已核准",
        date.format("%Y/%m/%d"),
        worker,
        customer,
        class,
        depart
    )
}

/// Activity export dated relative to today
///
/// 台南營業所 logs 20 visits in the last 30 days against 5 in the 30 days
/// before, 高雄營業所 logs 5 recent visits.
pub fn write_business_csv(path: &Path) {
    let today = today();
    let mut rows = vec!["Date,Worker,Customer,Class,Content,Depart,Manager,Level,Doc_Status".to_string()];

    for back in 1..=20 {
        let worker = if back % 2 == 0 { "王小明" } else { "李志豪" };
        rows.push(csv_row(
            today - Days::days(back),
            worker,
            "東台精機股份有限公司",
            "業務拜訪",
            "台南營業所",
        ));
    }
    for back in 35..=39 {
        rows.push(csv_row(
            today - Days::days(back),
            "王小明",
            "東台精機股份有限公司",
            "業務拜訪",
            "台南營業所",
        ));
    }
    for back in 1..=5 {
        rows.push(csv_row(
            today - Days::days(back),
            "陳美玲",
            "永進機械工業",
            "送貨",
            "高雄營業所",
        ));
    }

    std::fs::write(path, rows.join("\n")).unwrap();
}

/// Configuration with every file under `dir` and the rule-based planner
pub fn config_in(dir: &Path) -> Config {
    let mut config = Config::default();
    config.storage.data_dir = dir.to_path_buf();
    config.storage.chunk_file = dir.join("chunks.jsonl");
    config.storage.business_file = dir.join("business.csv");
    config.storage.memory_db = dir.join("memory.db");
    config.retrieval.enable_reranking = false;
    config.business.plan_generator = "rules".to_string();
    config.memory.backend = "memory".to_string();
    config
}

/// Write both fixtures under `dir` and return their paths
pub fn write_fixtures(dir: &Path) -> (PathBuf, PathBuf) {
    let chunks = dir.join("chunks.jsonl");
    let business = dir.join("business.csv");
    write_corpus(&chunks, &corpus());
    write_business_csv(&business);
    (chunks, business)
}

/// Initialized engine over the fixtures, answering with `provider`
pub async fn engine(dir: &Path, provider: Arc<dyn ModelProvider>) -> KnowledgeEngine {
    write_fixtures(dir);
    let engine = KnowledgeEngine::builder(config_in(dir))
        .router(router(provider))
        .build()
        .unwrap();
    engine.initialize().await.unwrap();
    engine
}
