//! Fixed-rule fallback query
//!
//! When no generated plan survives validation the analyzer answers a fixed
//! question instead: activity count by branch over the requested window,
//! against the preceding window of the same length.

use crate::business::dataset::{DateRange, Field};
use crate::business::intent::{BusinessIntent, Dimension, IntentKind, Metric};
use crate::business::plan::{BusinessQueryPlan, Condition, PlanOp};
use chrono::NaiveDate;

pub fn legacy_plan(intent: &BusinessIntent, today: NaiveDate, default_window_days: i64) -> BusinessQueryPlan {
    let range = intent
        .filters
        .date_range
        .unwrap_or_else(|| DateRange::last_days(today, default_window_days));

    let mut ops = Vec::new();
    if let Some(branch) = &intent.filters.branch {
        ops.push(PlanOp::Filter {
            field: Field::Depart,
            condition: Condition::Contains(branch.clone()),
        });
    }
    ops.push(PlanOp::ComparePeriods {
        current: range,
        previous: range.previous(),
    });
    ops.push(PlanOp::Group { by: Dimension::Branch });
    ops.push(PlanOp::Aggregate {
        metric: Metric::ActivityCount,
    });
    ops.push(PlanOp::Sort {
        descending: true,
        limit: None,
    });

    BusinessQueryPlan {
        intent: IntentKind::Aggregate,
        ops,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::business::intent::IntentFilters;

    #[test]
    fn test_legacy_plan_uses_default_window() {
        let today = NaiveDate::from_ymd_opt(2024, 6, 30).unwrap();
        let intent = BusinessIntent {
            kind: IntentKind::Ranking,
            metric: Metric::VisitCount,
            group_by: Some(Dimension::Customer),
            filters: IntentFilters::default(),
            compare_previous: false,
            limit: Some(3),
            date_phrase: None,
        };

        let plan = legacy_plan(&intent, today, 90);
        assert!(plan.validate(&Field::ALL).is_ok());
        assert_eq!(plan.group_by(), Some(Dimension::Branch));
        assert_eq!(plan.metric(), Metric::ActivityCount);
        let (current, previous) = plan.comparison().unwrap();
        assert_eq!(current.end, today);
        assert_eq!(previous.end, current.start.pred_opt().unwrap());
    }
}
