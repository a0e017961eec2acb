//! Fixed-structure narrative for business answers
//!
//! Summary, insights, trend and recommended actions always appear in this
//! order, whichever tier later narrates on top of it.

use crate::business::insight::{fmt_value, Insight, InsightKind};
use crate::business::intent::BusinessIntent;
use crate::business::sandbox::ExecutionResult;
use std::fmt::Write;

const MAX_LISTED_ROWS: usize = 10;

pub fn compose(intent: &BusinessIntent, result: &ExecutionResult, insights: &[Insight]) -> String {
    let mut out = String::new();
    let scope = intent.filters.describe();

    out.push_str("Summary:\n");
    summary(&mut out, &scope, result);

    out.push_str("\nInsights:\n");
    let findings: Vec<&Insight> = insights
        .iter()
        .filter(|i| i.kind != InsightKind::Recommendation)
        .collect();
    if findings.is_empty() {
        out.push_str("- No notable changes or outliers.\n");
    }
    for insight in findings {
        let _ = writeln!(out, "- [{}] {}", insight.kind, insight.message);
    }

    out.push_str("\nTrend:\n");
    trend(&mut out, result);

    out.push_str("\nRecommended actions:\n");
    let actions: Vec<&Insight> = insights
        .iter()
        .filter(|i| i.kind == InsightKind::Recommendation)
        .collect();
    if actions.is_empty() {
        out.push_str("- No action needed; keep monitoring.\n");
    }
    for action in actions {
        let _ = writeln!(out, "- {}", action.message);
    }

    out.trim_end().to_string()
}

fn summary(out: &mut String, scope: &str, result: &ExecutionResult) {
    if result.is_empty() {
        let _ = writeln!(out, "No matching records for {}.", scope);
        return;
    }

    if !result.records.is_empty() || (result.group_by.is_none() && result.rows.is_empty()) {
        let _ = writeln!(out, "{} matching records for {}.", result.matched, scope);
        for record in result.records.iter().take(MAX_LISTED_ROWS) {
            let date = record
                .date
                .map(|d| d.format("%Y/%m/%d").to_string())
                .unwrap_or_else(|| "(undated)".to_string());
            let _ = writeln!(
                out,
                "- {} {} / {} / {}",
                date, record.worker, record.customer, record.class
            );
        }
        if result.records.len() > MAX_LISTED_ROWS || result.truncated > 0 {
            let _ = writeln!(
                out,
                "- ... {} more",
                result.matched.saturating_sub(MAX_LISTED_ROWS.min(result.records.len()))
            );
        }
        return;
    }

    let _ = writeln!(
        out,
        "{}: {} for {} ({} matching records).",
        capitalize(result.metric.label()),
        fmt_value(result.total),
        scope,
        result.matched
    );

    if let Some(dimension) = result.group_by {
        let _ = writeln!(out, "By {}:", dimension.label());
        for row in result.rows.iter().take(MAX_LISTED_ROWS) {
            match row.previous {
                Some(previous) => {
                    let _ = writeln!(
                        out,
                        "- {}: {} (previous {})",
                        row.key,
                        fmt_value(row.value),
                        fmt_value(previous)
                    );
                }
                None => {
                    let _ = writeln!(out, "- {}: {}", row.key, fmt_value(row.value));
                }
            }
        }
        let hidden = result.rows.len().saturating_sub(MAX_LISTED_ROWS) + result.truncated;
        if hidden > 0 {
            let _ = writeln!(out, "- ... {} more", hidden);
        }
    }
}

fn trend(out: &mut String, result: &ExecutionResult) {
    let Some(previous) = &result.previous else {
        out.push_str("- No comparison period requested.\n");
        return;
    };

    let current = result
        .current_range
        .map(|r| r.to_string())
        .unwrap_or_else(|| "current period".to_string());
    match result.total_change() {
        Some(change) => {
            let _ = writeln!(
                out,
                "- {} {} vs {} {}: {:+.1}%",
                current,
                fmt_value(result.total),
                previous.range,
                fmt_value(previous.total),
                change * 100.0
            );
        }
        None => {
            let _ = writeln!(
                out,
                "- {} {} vs {} {}: no baseline activity",
                current,
                fmt_value(result.total),
                previous.range,
                fmt_value(previous.total)
            );
        }
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::business::dataset::DateRange;
    use crate::business::insight::Evidence;
    use crate::business::intent::{Dimension, IntentFilters, IntentKind, Metric};
    use crate::business::sandbox::{PeriodSummary, ResultRow};
    use chrono::NaiveDate;

    fn intent() -> BusinessIntent {
        BusinessIntent {
            kind: IntentKind::Aggregate,
            metric: Metric::ActivityCount,
            group_by: Some(Dimension::Worker),
            filters: IntentFilters {
                branch: Some("台南營業所".to_string()),
                ..Default::default()
            },
            compare_previous: true,
            limit: None,
            date_phrase: None,
        }
    }

    fn result() -> ExecutionResult {
        let current = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 5, 31).unwrap(),
        );
        ExecutionResult {
            intent: IntentKind::Aggregate,
            metric: Metric::ActivityCount,
            group_by: Some(Dimension::Worker),
            rows: vec![ResultRow {
                key: "王小明".to_string(),
                value: 10.0,
                previous: Some(4.0),
            }],
            records: Vec::new(),
            total: 10.0,
            matched: 10,
            scanned: 20,
            current_range: Some(current),
            previous: Some(PeriodSummary {
                range: current.previous(),
                total: 4.0,
                matched: 4,
            }),
            truncated: 0,
        }
    }

    #[test]
    fn test_sections_in_order() {
        let insights = vec![
            Insight {
                kind: InsightKind::Trend,
                message: "activities increased 150.0%".to_string(),
                evidence: vec![Evidence {
                    label: "change_pct".to_string(),
                    value: 150.0,
                }],
            },
            Insight {
                kind: InsightKind::Recommendation,
                message: "Keep the momentum".to_string(),
                evidence: Vec::new(),
            },
        ];
        let text = compose(&intent(), &result(), &insights);

        let positions: Vec<usize> = ["Summary:", "Insights:", "Trend:", "Recommended actions:"]
            .iter()
            .map(|h| text.find(h).unwrap())
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
        assert!(text.contains("- 王小明: 10 (previous 4)"));
        assert!(text.contains("+150.0%"));
        assert!(!text.contains("### "));
    }

    #[test]
    fn test_empty_result() {
        let mut empty = result();
        empty.rows.clear();
        empty.matched = 0;
        empty.total = 0.0;
        empty.previous = None;
        let text = compose(&intent(), &empty, &[]);
        assert!(text.contains("No matching records for 台南營業所"));
        assert!(text.contains("No action needed"));
    }
}
