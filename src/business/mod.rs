//! Business analytics over tabular activity records
//!
//! A question moves through a fixed state machine:
//!
//! ```text
//! IntentParsed → PlanGenerated → Executed → Validated → InsightsExtracted → NarrativeComposed
//! ```
//!
//! A rejected plan or a malformed result feeds its error back into plan
//! generation, up to `max_plan_attempts`. After that the fixed branch summary
//! in [`legacy`] takes over, and if even that fails the answer says so.

mod dataset;
mod generator;
mod insight;
mod intent;
mod legacy;
mod narrative;
mod plan;
mod sandbox;

pub use dataset::{
    month_to_date, parse_activity_csv, parse_record_date, ActivityDataset, ActivityRecord,
    CsvDatasetSource, DatasetSource, DatasetStats, DateRange, Field, FieldInfo, FieldType, SchemaInfo,
};
pub use generator::{parse_plan_json, ModelPlanGenerator, PlanGenerator, PlanRequest, RulePlanGenerator};
pub use insight::{Evidence, Insight, InsightExtractor, InsightKind};
pub use intent::{BusinessIntent, Dimension, IntentFilters, IntentKind, IntentParser, Metric};
pub use legacy::legacy_plan;
pub use narrative::compose as compose_narrative;
pub use plan::{BusinessQueryPlan, Condition, PlanError, PlanOp};
pub use sandbox::{ExecutionResult, PeriodSummary, ResultRow, Sandbox, SandboxError, SandboxLimits};

use crate::config::BusinessConfig;
use crate::error::{DomainError, Result};
use crate::lexicon::Lexicon;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Pipeline step reached while answering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisStage {
    IntentParsed,
    PlanGenerated,
    Executed,
    Validated,
    InsightsExtracted,
    NarrativeComposed,
    Failed,
}

/// How the final answer was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMode {
    Planned,
    Legacy,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessAnswer {
    pub answer: String,
    pub insights: Vec<Insight>,
    pub recommendations: Vec<String>,
    /// Plan that produced the result, legacy plans included
    pub plan: Option<BusinessQueryPlan>,
    pub intent: BusinessIntent,
    pub mode: AnalysisMode,
    /// Plan generation attempts made
    pub attempts: u32,
    pub stages: Vec<AnalysisStage>,
    pub result: Option<ExecutionResult>,
    pub notes: Vec<String>,
    /// Last pipeline failure, if any attempt failed
    pub error: Option<DomainError>,
}

impl BusinessAnswer {
    pub fn is_failed(&self) -> bool {
        self.mode == AnalysisMode::Failed
    }
}

/// Runs the intent → plan → execute → narrate pipeline
pub struct BusinessAnalyzer {
    parser: IntentParser,
    generator: Arc<dyn PlanGenerator>,
    sandbox: Sandbox,
    extractor: InsightExtractor,
    config: BusinessConfig,
}

impl BusinessAnalyzer {
    pub fn new(lexicon: Arc<Lexicon>, config: BusinessConfig, generator: Arc<dyn PlanGenerator>) -> Result<Self> {
        Ok(Self {
            parser: IntentParser::new(lexicon, config.default_window_days)?,
            generator,
            sandbox: Sandbox::new(SandboxLimits::from_config(&config)),
            extractor: InsightExtractor::new(config.trend_threshold, config.anomaly_z),
            config,
        })
    }

    pub fn generator_name(&self) -> &str {
        self.generator.name()
    }

    pub fn parse_intent(&self, question: &str, dataset: &ActivityDataset, today: NaiveDate) -> BusinessIntent {
        self.parser.parse(question, Some(dataset), today)
    }

    pub async fn analyze(&self, question: &str, dataset: Arc<ActivityDataset>, today: NaiveDate) -> BusinessAnswer {
        let intent = self.parse_intent(question, &dataset, today);
        self.analyze_intent(question, intent, dataset, today).await
    }

    /// Answer a question whose intent has already been parsed
    pub async fn analyze_intent(
        &self,
        question: &str,
        intent: BusinessIntent,
        dataset: Arc<ActivityDataset>,
        today: NaiveDate,
    ) -> BusinessAnswer {
        let mut stages = vec![AnalysisStage::IntentParsed];
        let schema = dataset.schema_info().describe();
        let max_attempts = self.config.max_plan_attempts.max(1);

        let mut feedback: Option<String> = None;
        let mut last_error: Option<DomainError> = None;
        let mut attempts = 0;

        while attempts < max_attempts {
            attempts += 1;
            let request = PlanRequest {
                question: question.to_string(),
                intent: intent.clone(),
                schema: schema.clone(),
                feedback: feedback.take(),
                attempt: attempts,
            };

            let plan = match self.generator.generate(&request).await {
                Ok(plan) => plan,
                Err(e) => {
                    warn!(attempt = attempts, generator = self.generator.name(), error = %e, "Plan generation failed");
                    feedback = Some(e.to_string());
                    last_error = Some(DomainError::PlanGeneration(e.to_string()));
                    continue;
                }
            };
            if let Err(e) = plan.validate(&Field::ALL) {
                warn!(attempt = attempts, error = %e, "Generated plan rejected");
                feedback = Some(e.to_string());
                last_error = Some(DomainError::PlanGeneration(e.to_string()));
                continue;
            }
            stages.push(AnalysisStage::PlanGenerated);

            match self.run(&plan, &dataset, &mut stages).await {
                Ok(result) => {
                    debug!(attempt = attempts, plan = %plan.signature(), matched = result.matched, "Plan executed");
                    let mut answer = self.finish(intent, plan, result, AnalysisMode::Planned, stages);
                    answer.attempts = attempts;
                    answer.error = last_error;
                    return answer;
                }
                Err(e) => {
                    warn!(attempt = attempts, error = %e, "Plan execution failed");
                    feedback = Some(e.to_string());
                    last_error = Some(e);
                }
            }
        }

        info!(attempts, "Falling back to fixed branch summary");
        let mut notes = Vec::new();
        if let Some(error) = &last_error {
            notes.push(format!(
                "The question could not be planned after {} attempt(s); showing activity by branch instead.",
                attempts
            ));
            debug!(error = %error, "Last planning error");
        }

        let plan = legacy_plan(&intent, today, self.config.default_window_days);
        match self.run(&plan, &dataset, &mut stages).await {
            Ok(result) => {
                let mut answer = self.finish(intent, plan, result, AnalysisMode::Legacy, stages);
                answer.attempts = attempts;
                answer.notes.extend(notes);
                answer.error = last_error;
                answer
            }
            Err(e) => {
                warn!(error = %e, "Fixed branch summary failed");
                stages.push(AnalysisStage::Failed);
                notes.push(e.note());
                BusinessAnswer {
                    answer: "Unable to analyze this request.".to_string(),
                    insights: Vec::new(),
                    recommendations: Vec::new(),
                    plan: None,
                    intent,
                    mode: AnalysisMode::Failed,
                    attempts,
                    stages,
                    result: None,
                    notes,
                    error: Some(e),
                }
            }
        }
    }

    async fn run(
        &self,
        plan: &BusinessQueryPlan,
        dataset: &Arc<ActivityDataset>,
        stages: &mut Vec<AnalysisStage>,
    ) -> std::result::Result<ExecutionResult, DomainError> {
        let result = self
            .sandbox
            .execute(Arc::clone(dataset), plan)
            .await
            .map_err(|e| DomainError::SandboxExecution(e.to_string()))?;
        stages.push(AnalysisStage::Executed);

        check_result(&result).map_err(DomainError::SandboxExecution)?;
        stages.push(AnalysisStage::Validated);
        Ok(result)
    }

    fn finish(
        &self,
        intent: BusinessIntent,
        plan: BusinessQueryPlan,
        result: ExecutionResult,
        mode: AnalysisMode,
        mut stages: Vec<AnalysisStage>,
    ) -> BusinessAnswer {
        let insights = self.extractor.extract(&result);
        stages.push(AnalysisStage::InsightsExtracted);

        let answer = narrative::compose(&intent, &result, &insights);
        stages.push(AnalysisStage::NarrativeComposed);

        let recommendations = insights
            .iter()
            .filter(|i| i.kind == InsightKind::Recommendation)
            .map(|i| i.message.clone())
            .collect();

        BusinessAnswer {
            answer,
            insights,
            recommendations,
            plan: Some(plan),
            intent,
            mode,
            attempts: 0,
            stages,
            result: Some(result),
            notes: Vec::new(),
            error: None,
        }
    }
}

/// Shape check that routes malformed results back to regeneration
fn check_result(result: &ExecutionResult) -> std::result::Result<(), String> {
    if result.intent != IntentKind::List && result.matched > 0 && result.rows.is_empty() {
        return Err(format!(
            "aggregation returned no rows for {} matching records",
            result.matched
        ));
    }
    let bad = |v: f64| !v.is_finite() || v < 0.0;
    if bad(result.total) || result.rows.iter().any(|r| bad(r.value) || r.previous.is_some_and(bad)) {
        return Err("result contains negative or non-finite values".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record(d: NaiveDate, worker: &str, depart: &str) -> ActivityRecord {
        ActivityRecord {
            date: Some(d),
            worker: worker.to_string(),
            customer: "東台精機".to_string(),
            class: "業務拜訪".to_string(),
            content: String::new(),
            depart: depart.to_string(),
            manager: String::new(),
            level: String::new(),
            doc_status: String::new(),
        }
    }

    fn dataset() -> Arc<ActivityDataset> {
        let mut records = Vec::new();
        for day in 1..=20 {
            records.push(record(date(2024, 6, day), "王小明", "台南營業所"));
        }
        for day in 1..=5 {
            records.push(record(date(2024, 5, day), "王小明", "台南營業所"));
            records.push(record(date(2024, 6, day), "陳美玲", "高雄營業所"));
        }
        Arc::new(ActivityDataset::new(records, "test"))
    }

    /// Always returns a plan without an aggregate step
    struct Malformed(AtomicU32);

    #[async_trait]
    impl PlanGenerator for Malformed {
        async fn generate(&self, _request: &PlanRequest) -> std::result::Result<BusinessQueryPlan, PlanError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(BusinessQueryPlan {
                intent: IntentKind::Aggregate,
                ops: vec![PlanOp::Group { by: Dimension::Worker }],
            })
        }

        fn name(&self) -> &str {
            "malformed"
        }
    }

    fn analyzer(generator: Arc<dyn PlanGenerator>) -> BusinessAnalyzer {
        let config = Config::default();
        let lexicon = Arc::new(Lexicon::builtin().unwrap());
        BusinessAnalyzer::new(lexicon, config.business, generator).unwrap()
    }

    #[tokio::test]
    async fn test_planned_answer_with_rules() {
        let analyzer = analyzer(Arc::new(RulePlanGenerator));
        let today = date(2024, 6, 30);
        let answer = analyzer
            .analyze("台南營業所最近一個月的業績如何？", dataset(), today)
            .await;

        assert_eq!(answer.mode, AnalysisMode::Planned);
        assert_eq!(answer.attempts, 1);
        assert_eq!(answer.stages.last(), Some(&AnalysisStage::NarrativeComposed));
        assert!(answer.insights.iter().any(|i| i.kind == InsightKind::Trend));
        assert!(!answer.recommendations.is_empty());
        assert!(answer.answer.starts_with("Summary:"));
    }

    #[tokio::test]
    async fn test_regeneration_is_bounded_then_legacy() {
        let generator = Arc::new(Malformed(AtomicU32::new(0)));
        let analyzer = analyzer(generator.clone());
        let answer = analyzer
            .analyze("台南營業所最近一個月的業績如何？", dataset(), date(2024, 6, 30))
            .await;

        assert_eq!(generator.0.load(Ordering::SeqCst), 3);
        assert_eq!(answer.attempts, 3);
        assert_eq!(answer.mode, AnalysisMode::Legacy);
        assert_eq!(answer.plan.as_ref().and_then(|p| p.group_by()), Some(Dimension::Branch));
        assert!(matches!(answer.error, Some(DomainError::PlanGeneration(_))));
        assert!(!answer.notes.is_empty());
    }

    #[tokio::test]
    async fn test_failed_when_legacy_cannot_run() {
        let mut config = Config::default().business;
        config.max_scan_rows = 1;
        let lexicon = Arc::new(Lexicon::builtin().unwrap());
        let analyzer = BusinessAnalyzer::new(lexicon, config, Arc::new(RulePlanGenerator)).unwrap();

        let answer = analyzer.analyze("最近業績如何", dataset(), date(2024, 6, 30)).await;
        assert!(answer.is_failed());
        assert_eq!(answer.answer, "Unable to analyze this request.");
        assert_eq!(answer.stages.last(), Some(&AnalysisStage::Failed));
        assert!(answer.notes.iter().any(|n| n.contains("Unable to analyze")));
    }

    #[test]
    fn test_check_result_rejects_missing_rows() {
        let result = ExecutionResult {
            intent: IntentKind::Aggregate,
            metric: Metric::ActivityCount,
            group_by: Some(Dimension::Worker),
            rows: Vec::new(),
            records: Vec::new(),
            total: 3.0,
            matched: 3,
            scanned: 3,
            current_range: None,
            previous: None,
            truncated: 0,
        };
        assert!(check_result(&result).is_err());

        let mut empty = result;
        empty.matched = 0;
        empty.total = 0.0;
        assert!(check_result(&empty).is_ok());
    }
}
