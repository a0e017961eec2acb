//! Plan generators
//!
//! `rules` maps a parsed intent straight to a plan. `model` asks the business
//! tier for a JSON plan and is fed the previous failure on each retry.

use crate::business::dataset::Field;
use crate::business::intent::{BusinessIntent, IntentKind};
use crate::business::plan::{BusinessQueryPlan, Condition, PlanError, PlanOp};
use crate::provider::ModelRouter;
use crate::tier::TierProfile;
use async_trait::async_trait;
use std::sync::Arc;

/// Everything a generator may look at for one attempt
#[derive(Debug, Clone)]
pub struct PlanRequest {
    pub question: String,
    pub intent: BusinessIntent,
    /// Output of [`crate::business::SchemaInfo::describe`]
    pub schema: String,
    /// Why the previous attempt was rejected
    pub feedback: Option<String>,
    /// 1-based attempt number
    pub attempt: u32,
}

#[async_trait]
pub trait PlanGenerator: Send + Sync {
    async fn generate(&self, request: &PlanRequest) -> Result<BusinessQueryPlan, PlanError>;

    fn name(&self) -> &str;
}

/// Deterministic intent → plan mapping
#[derive(Debug, Clone, Copy, Default)]
pub struct RulePlanGenerator;

impl RulePlanGenerator {
    pub fn plan_for(intent: &BusinessIntent) -> BusinessQueryPlan {
        let filters = &intent.filters;
        let mut ops = Vec::new();

        if let Some(branch) = &filters.branch {
            ops.push(PlanOp::Filter {
                field: Field::Depart,
                condition: Condition::Contains(branch.clone()),
            });
        }
        if let Some(worker) = &filters.worker {
            ops.push(PlanOp::Filter {
                field: Field::Worker,
                condition: Condition::Equals(worker.clone()),
            });
        }
        if let Some(customer) = &filters.customer {
            ops.push(PlanOp::Filter {
                field: Field::Customer,
                condition: customer.clone(),
            });
        }
        if let Some(class) = &filters.activity_class {
            ops.push(PlanOp::Filter {
                field: Field::Class,
                condition: Condition::Contains(class.clone()),
            });
        }

        if let Some(range) = filters.date_range {
            if intent.compare_previous && intent.kind != IntentKind::List {
                ops.push(PlanOp::ComparePeriods {
                    current: range,
                    previous: range.previous(),
                });
            } else {
                ops.push(PlanOp::Filter {
                    field: Field::Date,
                    condition: Condition::Between {
                        start: range.start,
                        end: range.end,
                    },
                });
            }
        }

        if intent.kind == IntentKind::List {
            ops.push(PlanOp::Sort {
                descending: true,
                limit: intent.limit,
            });
            return BusinessQueryPlan {
                intent: intent.kind,
                ops,
            };
        }

        if let Some(by) = intent.group_by {
            ops.push(PlanOp::Group { by });
        }
        ops.push(PlanOp::Aggregate { metric: intent.metric });
        if intent.group_by.is_some() {
            ops.push(PlanOp::Sort {
                descending: true,
                limit: intent.limit,
            });
        }

        BusinessQueryPlan {
            intent: intent.kind,
            ops,
        }
    }
}

#[async_trait]
impl PlanGenerator for RulePlanGenerator {
    async fn generate(&self, request: &PlanRequest) -> Result<BusinessQueryPlan, PlanError> {
        Ok(Self::plan_for(&request.intent))
    }

    fn name(&self) -> &str {
        "rules"
    }
}

const PLAN_INSTRUCTIONS: &str = r#"Translate the question into a JSON query plan over the activity table.
Respond with one JSON object and nothing else:
{"intent": "aggregate|trend|compare|ranking|list", "ops": [...]}
Allowed ops, in this order:
  {"op": "filter", "field": "<Field>", "condition": {"equals": "..."} | {"contains": "..."} | {"between": {"start": "YYYY-MM-DD", "end": "YYYY-MM-DD"}}}
  {"op": "compare_periods", "current": {"start": "...", "end": "..."}, "previous": {"start": "...", "end": "..."}}
  {"op": "group", "by": "branch|worker|customer|class|month|day"}
  {"op": "aggregate", "metric": "activity_count|visit_count|distinct_customers|distinct_workers"}
  {"op": "sort", "descending": true, "limit": 5}
Only the Date field accepts "between". List plans must not group or aggregate."#;

/// Asks the business tier for a JSON plan
pub struct ModelPlanGenerator {
    router: Arc<ModelRouter>,
    profile: TierProfile,
}

impl ModelPlanGenerator {
    pub fn new(router: Arc<ModelRouter>, profile: TierProfile) -> Self {
        Self { router, profile }
    }

    fn prompt(request: &PlanRequest) -> String {
        let mut prompt = format!(
            "{}\n\n### Schema\n{}\n\n### Parsed intent\n{}\n",
            PLAN_INSTRUCTIONS,
            request.schema,
            request.intent.signature()
        );
        if let Some(feedback) = &request.feedback {
            prompt.push_str(&format!(
                "\n### Previous attempt rejected\n{}\nFix the problem and answer again.\n",
                feedback
            ));
        }
        prompt.push_str(&format!("\n### Question\n{}\n", request.question.trim()));
        prompt
    }
}

#[async_trait]
impl PlanGenerator for ModelPlanGenerator {
    async fn generate(&self, request: &PlanRequest) -> Result<BusinessQueryPlan, PlanError> {
        let outcome = self.router.generate(&Self::prompt(request), &self.profile).await;
        let text = outcome.result.map_err(|e| PlanError::Model(e.to_string()))?;
        parse_plan_json(&text)
    }

    fn name(&self) -> &str {
        "model"
    }
}

/// Parse a model reply, tolerating code fences and surrounding prose
pub fn parse_plan_json(text: &str) -> Result<BusinessQueryPlan, PlanError> {
    let trimmed = text.trim();
    let start = trimmed
        .find('{')
        .ok_or_else(|| PlanError::Parse("no JSON object in reply".to_string()))?;
    let end = trimmed
        .rfind('}')
        .filter(|end| *end > start)
        .ok_or_else(|| PlanError::Parse("unterminated JSON object".to_string()))?;

    serde_json::from_str(&trimmed[start..=end]).map_err(|e| PlanError::Parse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::business::dataset::DateRange;
    use crate::business::intent::{Dimension, IntentFilters, Metric};
    use chrono::NaiveDate;

    fn intent() -> BusinessIntent {
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 5, 31).unwrap(),
        );
        BusinessIntent {
            kind: IntentKind::Aggregate,
            metric: Metric::ActivityCount,
            group_by: Some(Dimension::Worker),
            filters: IntentFilters {
                date_range: Some(range),
                branch: Some("台南營業所".to_string()),
                ..Default::default()
            },
            compare_previous: true,
            limit: None,
            date_phrase: Some("最近一個月".to_string()),
        }
    }

    #[tokio::test]
    async fn test_rule_plan_is_valid() {
        let request = PlanRequest {
            question: "台南營業所最近一個月的業績如何".to_string(),
            intent: intent(),
            schema: String::new(),
            feedback: None,
            attempt: 1,
        };
        let plan = RulePlanGenerator.generate(&request).await.unwrap();
        assert!(plan.validate(&Field::ALL).is_ok());
        assert!(plan.comparison().is_some());
        assert_eq!(plan.group_by(), Some(Dimension::Worker));
    }

    #[test]
    fn test_rule_plan_without_comparison_filters_dates() {
        let mut intent = intent();
        intent.compare_previous = false;
        intent.kind = IntentKind::List;
        intent.group_by = None;
        let plan = RulePlanGenerator::plan_for(&intent);
        assert!(plan.validate(&Field::ALL).is_ok());
        assert!(plan.comparison().is_none());
        assert!(plan
            .filters()
            .any(|(field, c)| field == Field::Date && matches!(c, Condition::Between { .. })));
    }

    #[test]
    fn test_parse_plan_json_strips_fences() {
        let reply = "Here is the plan:\n```json\n{\"intent\": \"aggregate\", \"ops\": [{\"op\": \"aggregate\", \"metric\": \"activity_count\"}]}\n```";
        let plan = parse_plan_json(reply).unwrap();
        assert_eq!(plan.metric(), Metric::ActivityCount);

        assert!(matches!(parse_plan_json("no plan here"), Err(PlanError::Parse(_))));
        assert!(matches!(parse_plan_json("{\"intent\": 3}"), Err(PlanError::Parse(_))));
    }

    #[test]
    fn test_model_prompt_carries_feedback() {
        let request = PlanRequest {
            question: "q".to_string(),
            intent: intent(),
            schema: "Fields:".to_string(),
            feedback: Some("missing aggregate operation".to_string()),
            attempt: 2,
        };
        let prompt = ModelPlanGenerator::prompt(&request);
        assert!(prompt.contains("missing aggregate operation"));
        assert!(prompt.ends_with("### Question\nq\n"));
    }
}
