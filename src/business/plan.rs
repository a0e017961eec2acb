//! Structured query plans and their validation
//!
//! A plan is a short pipeline of operations over the activity dataset. The
//! JSON form (`{"op": "filter", ...}`) is what the model generator emits, so
//! every plan is validated against the dataset schema before it runs.

use crate::business::dataset::{DateRange, Field, FieldType};
use crate::business::intent::{Dimension, IntentKind, Metric};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Text or date predicate of a filter
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Equals(String),
    Contains(String),
    Between { start: chrono::NaiveDate, end: chrono::NaiveDate },
}

impl Condition {
    /// Text operand, or "" for date ranges
    pub fn value(&self) -> &str {
        match self {
            Self::Equals(v) | Self::Contains(v) => v,
            Self::Between { .. } => "",
        }
    }

    pub fn matches_text(&self, text: &str) -> bool {
        match self {
            Self::Equals(v) => text == v,
            Self::Contains(v) => text.contains(v.as_str()),
            Self::Between { .. } => false,
        }
    }
}

/// One pipeline step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PlanOp {
    Filter { field: Field, condition: Condition },
    Group { by: Dimension },
    Aggregate { metric: Metric },
    Sort {
        #[serde(default = "default_descending")]
        descending: bool,
        #[serde(default)]
        limit: Option<usize>,
    },
    /// Evaluate the current window and the previous one side by side
    ComparePeriods { current: DateRange, previous: DateRange },
}

fn default_descending() -> bool {
    true
}

impl PlanOp {
    fn name(&self) -> &'static str {
        match self {
            Self::Filter { .. } => "filter",
            Self::Group { .. } => "group",
            Self::Aggregate { .. } => "aggregate",
            Self::Sort { .. } => "sort",
            Self::ComparePeriods { .. } => "compare_periods",
        }
    }

    /// Position class; ops must appear in non-decreasing order
    fn stage(&self) -> u8 {
        match self {
            Self::Filter { .. } | Self::ComparePeriods { .. } => 0,
            Self::Group { .. } => 1,
            Self::Aggregate { .. } => 2,
            Self::Sort { .. } => 3,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("model did not produce a plan: {0}")]
    Model(String),

    #[error("plan is not valid JSON: {0}")]
    Parse(String),

    #[error("invalid plan: {0}")]
    Invalid(String),
}

/// Executable plan for one business question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessQueryPlan {
    pub intent: IntentKind,
    pub ops: Vec<PlanOp>,
}

impl BusinessQueryPlan {
    pub fn metric(&self) -> Metric {
        self.ops
            .iter()
            .find_map(|op| match op {
                PlanOp::Aggregate { metric } => Some(*metric),
                _ => None,
            })
            .unwrap_or(Metric::ActivityCount)
    }

    pub fn group_by(&self) -> Option<Dimension> {
        self.ops.iter().find_map(|op| match op {
            PlanOp::Group { by } => Some(*by),
            _ => None,
        })
    }

    pub fn filters(&self) -> impl Iterator<Item = (Field, &Condition)> {
        self.ops.iter().filter_map(|op| match op {
            PlanOp::Filter { field, condition } => Some((*field, condition)),
            _ => None,
        })
    }

    pub fn comparison(&self) -> Option<(DateRange, DateRange)> {
        self.ops.iter().find_map(|op| match op {
            PlanOp::ComparePeriods { current, previous } => Some((*current, *previous)),
            _ => None,
        })
    }

    /// `(descending, limit)` of the sort step
    pub fn sort(&self) -> Option<(bool, Option<usize>)> {
        self.ops.iter().find_map(|op| match op {
            PlanOp::Sort { descending, limit } => Some((*descending, *limit)),
            _ => None,
        })
    }

    /// Check the plan against the declared schema
    pub fn validate(&self, schema: &[Field]) -> Result<(), PlanError> {
        if self.ops.is_empty() {
            return Err(PlanError::Invalid("plan has no operations".to_string()));
        }

        let count = |name: &str| self.ops.iter().filter(|op| op.name() == name).count();
        for name in ["group", "aggregate", "sort", "compare_periods"] {
            if count(name) > 1 {
                return Err(PlanError::Invalid(format!("more than one {} operation", name)));
            }
        }

        if let Some(pair) = self.ops.windows(2).find(|w| w[0].stage() > w[1].stage()) {
            return Err(PlanError::Invalid(format!(
                "{} cannot follow {}",
                pair[1].name(),
                pair[0].name()
            )));
        }

        match self.intent {
            IntentKind::List => {
                if count("aggregate") > 0 || count("group") > 0 {
                    return Err(PlanError::Invalid(
                        "list plans return records and cannot group or aggregate".to_string(),
                    ));
                }
            }
            _ => {
                if count("aggregate") == 0 {
                    return Err(PlanError::Invalid("missing aggregate operation".to_string()));
                }
            }
        }

        for op in &self.ops {
            match op {
                PlanOp::Filter { field, condition } => {
                    if !schema.contains(field) {
                        return Err(PlanError::Invalid(format!("unknown field {}", field)));
                    }
                    match (field.field_type(), condition) {
                        (FieldType::Date, Condition::Between { start, end }) => {
                            if start > end {
                                return Err(PlanError::Invalid(format!(
                                    "date range on {} ends before it starts",
                                    field
                                )));
                            }
                        }
                        (FieldType::Text, Condition::Equals(v) | Condition::Contains(v)) => {
                            if v.trim().is_empty() {
                                return Err(PlanError::Invalid(format!("empty filter value on {}", field)));
                            }
                        }
                        (FieldType::Date, _) => {
                            return Err(PlanError::Invalid(format!("{} only supports between", field)));
                        }
                        (FieldType::Text, _) => {
                            return Err(PlanError::Invalid(format!(
                                "between is only valid on Date, not {}",
                                field
                            )));
                        }
                    }
                }
                PlanOp::ComparePeriods { current, previous } => {
                    if !current.is_valid() || !previous.is_valid() {
                        return Err(PlanError::Invalid("compare_periods has an inverted range".to_string()));
                    }
                    if previous.end >= current.start {
                        return Err(PlanError::Invalid(
                            "previous period must end before the current one starts".to_string(),
                        ));
                    }
                }
                PlanOp::Sort { limit: Some(0), .. } => {
                    return Err(PlanError::Invalid("sort limit must be positive".to_string()));
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Stable text form used in fingerprints and logs
    pub fn signature(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self))
    }
}
