//! Trend, anomaly and recommendation extraction from execution results

use crate::business::intent::Dimension;
use crate::business::sandbox::{ExecutionResult, ResultRow};
use serde::{Deserialize, Serialize};
use std::fmt;

const MAX_GROUP_TRENDS: usize = 3;
const MIN_ANOMALY_GROUPS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightKind {
    Trend,
    Anomaly,
    Recommendation,
}

impl fmt::Display for InsightKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Trend => "trend",
            Self::Anomaly => "anomaly",
            Self::Recommendation => "recommendation",
        };
        write!(f, "{}", name)
    }
}

/// Numeric fact backing an insight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub label: String,
    pub value: f64,
}

impl Evidence {
    fn new(label: impl Into<String>, value: f64) -> Self {
        Self {
            label: label.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub kind: InsightKind,
    pub message: String,
    pub evidence: Vec<Evidence>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Direction {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Deviation {
    High,
    Low,
}

/// What a finding was about, kept so recommendations can refer back to it
struct Finding {
    insight: Insight,
    subject: String,
    category: Category,
}

enum Category {
    Trend(Direction),
    Anomaly(Deviation),
}

/// Derives insights from an [`ExecutionResult`]
#[derive(Debug, Clone, Copy)]
pub struct InsightExtractor {
    trend_threshold: f64,
    anomaly_z: f64,
}

impl InsightExtractor {
    pub fn new(trend_threshold: f64, anomaly_z: f64) -> Self {
        Self {
            trend_threshold,
            anomaly_z,
        }
    }

    /// Trends and anomalies first, then one recommendation per finding
    pub fn extract(&self, result: &ExecutionResult) -> Vec<Insight> {
        if result.is_empty() && result.previous.as_ref().map_or(true, |p| p.total == 0.0) {
            return Vec::new();
        }

        let mut findings = Vec::new();
        findings.extend(self.total_trend(result));
        findings.extend(self.series_trend(result));
        findings.extend(self.group_trends(result));
        findings.extend(self.anomalies(result));

        let recommendations: Vec<Insight> = findings.iter().map(recommend).collect();
        findings
            .into_iter()
            .map(|f| f.insight)
            .chain(recommendations)
            .collect()
    }

    fn exceeds(&self, change: f64) -> bool {
        change.abs() >= self.trend_threshold
    }

    fn total_trend(&self, result: &ExecutionResult) -> Option<Finding> {
        let previous = result.previous.as_ref()?;
        let metric = result.metric.label();
        let current = result.total;

        if previous.total == 0.0 {
            if current <= 0.0 {
                return None;
            }
            return Some(Finding {
                insight: Insight {
                    kind: InsightKind::Trend,
                    message: format!(
                        "{} rose from 0 to {} compared with {}",
                        metric,
                        fmt_value(current),
                        previous.range
                    ),
                    evidence: vec![Evidence::new("current", current), Evidence::new("previous", 0.0)],
                },
                subject: "overall".to_string(),
                category: Category::Trend(Direction::Up),
            });
        }

        let change = (current - previous.total) / previous.total;
        if !self.exceeds(change) {
            return None;
        }
        let direction = direction_of(change);
        Some(Finding {
            insight: Insight {
                kind: InsightKind::Trend,
                message: format!(
                    "{} {} {:.1}% ({} → {}) compared with {}",
                    metric,
                    verb(direction),
                    change.abs() * 100.0,
                    fmt_value(previous.total),
                    fmt_value(current),
                    previous.range
                ),
                evidence: vec![
                    Evidence::new("current", current),
                    Evidence::new("previous", previous.total),
                    Evidence::new("change_pct", change * 100.0),
                ],
            },
            subject: "overall".to_string(),
            category: Category::Trend(direction),
        })
    }

    /// Last bucket against the one before it, for time-grouped results
    fn series_trend(&self, result: &ExecutionResult) -> Option<Finding> {
        let dimension = result.group_by.filter(Dimension::is_time)?;
        if result.previous.is_some() || result.rows.len() < 2 {
            return None;
        }
        let mut rows: Vec<&ResultRow> = result.rows.iter().collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        let last = rows[rows.len() - 1];
        let before = rows[rows.len() - 2];
        if before.value <= 0.0 {
            return None;
        }

        let change = (last.value - before.value) / before.value;
        if !self.exceeds(change) {
            return None;
        }
        let direction = direction_of(change);
        Some(Finding {
            insight: Insight {
                kind: InsightKind::Trend,
                message: format!(
                    "{} {} {:.1}% from {} to {} ({} → {})",
                    result.metric.label(),
                    verb(direction),
                    change.abs() * 100.0,
                    before.key,
                    last.key,
                    fmt_value(before.value),
                    fmt_value(last.value)
                ),
                evidence: vec![
                    Evidence::new(before.key.clone(), before.value),
                    Evidence::new(last.key.clone(), last.value),
                    Evidence::new("change_pct", change * 100.0),
                ],
            },
            subject: format!("the latest {}", dimension.label()),
            category: Category::Trend(direction),
        })
    }

    fn group_trends(&self, result: &ExecutionResult) -> Vec<Finding> {
        let Some(dimension) = result.group_by.filter(|d| !d.is_time()) else {
            return Vec::new();
        };

        let mut changes: Vec<(&ResultRow, f64, f64)> = result
            .rows
            .iter()
            .filter_map(|row| {
                let previous = row.previous?;
                (previous > 0.0).then(|| (row, previous, (row.value - previous) / previous))
            })
            .filter(|(_, _, change)| self.exceeds(*change))
            .collect();
        changes.sort_by(|a, b| b.2.abs().total_cmp(&a.2.abs()).then_with(|| a.0.key.cmp(&b.0.key)));

        changes
            .into_iter()
            .take(MAX_GROUP_TRENDS)
            .map(|(row, previous, change)| {
                let direction = direction_of(change);
                Finding {
                    insight: Insight {
                        kind: InsightKind::Trend,
                        message: format!(
                            "{} {}: {} {:.1}% ({} → {})",
                            dimension.label(),
                            row.key,
                            verb(direction),
                            change.abs() * 100.0,
                            fmt_value(previous),
                            fmt_value(row.value)
                        ),
                        evidence: vec![
                            Evidence::new("current", row.value),
                            Evidence::new("previous", previous),
                            Evidence::new("change_pct", change * 100.0),
                        ],
                    },
                    subject: row.key.clone(),
                    category: Category::Trend(direction),
                }
            })
            .collect()
    }

    fn anomalies(&self, result: &ExecutionResult) -> Vec<Finding> {
        let Some(dimension) = result.group_by else {
            return Vec::new();
        };
        if result.rows.len() < MIN_ANOMALY_GROUPS {
            return Vec::new();
        }

        let n = result.rows.len() as f64;
        let mean = result.rows.iter().map(|r| r.value).sum::<f64>() / n;
        let variance = result.rows.iter().map(|r| (r.value - mean).powi(2)).sum::<f64>() / n;
        let std = variance.sqrt();
        if std <= f64::EPSILON {
            return Vec::new();
        }

        result
            .rows
            .iter()
            .filter_map(|row| {
                let z = (row.value - mean) / std;
                if z.abs() <= self.anomaly_z {
                    return None;
                }
                let deviation = if z > 0.0 { Deviation::High } else { Deviation::Low };
                Some(Finding {
                    insight: Insight {
                        kind: InsightKind::Anomaly,
                        message: format!(
                            "{} {} is unusually {} at {} (mean {:.1}, z = {:.2})",
                            dimension.label(),
                            row.key,
                            if deviation == Deviation::High { "high" } else { "low" },
                            fmt_value(row.value),
                            mean,
                            z
                        ),
                        evidence: vec![
                            Evidence::new("value", row.value),
                            Evidence::new("mean", mean),
                            Evidence::new("z_score", z),
                        ],
                    },
                    subject: row.key.clone(),
                    category: Category::Anomaly(deviation),
                })
            })
            .collect()
    }
}

fn recommend(finding: &Finding) -> Insight {
    let subject = &finding.subject;
    let message = match finding.category {
        Category::Trend(Direction::Down) => format!(
            "Review activity for {}: schedule follow-up visits with key customers to recover the decline.",
            subject
        ),
        Category::Trend(Direction::Up) => format!(
            "Keep the momentum for {} and share what is working with the other teams.",
            subject
        ),
        Category::Anomaly(Deviation::High) => format!(
            "Check that the workload of {} is sustainable and capture practices others can reuse.",
            subject
        ),
        Category::Anomaly(Deviation::Low) => format!(
            "Follow up with {}: activity is well below peers and may need support or reassignment.",
            subject
        ),
    };
    Insight {
        kind: InsightKind::Recommendation,
        message,
        evidence: finding.insight.evidence.clone(),
    }
}

fn direction_of(change: f64) -> Direction {
    if change >= 0.0 {
        Direction::Up
    } else {
        Direction::Down
    }
}

fn verb(direction: Direction) -> &'static str {
    match direction {
        Direction::Up => "increased",
        Direction::Down => "decreased",
    }
}

/// Counts print without a fractional part
pub(crate) fn fmt_value(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{:.0}", value)
    } else {
        format!("{:.2}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::business::dataset::DateRange;
    use crate::business::intent::{IntentKind, Metric};
    use crate::business::sandbox::PeriodSummary;
    use chrono::NaiveDate;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn row(key: &str, value: f64, previous: Option<f64>) -> ResultRow {
        ResultRow {
            key: key.to_string(),
            value,
            previous,
        }
    }

    fn result(group_by: Option<Dimension>, rows: Vec<ResultRow>, previous_total: Option<f64>) -> ExecutionResult {
        let total = rows.iter().map(|r| r.value).sum();
        let current = DateRange::new(date(2024, 5, 1), date(2024, 5, 31));
        ExecutionResult {
            intent: IntentKind::Aggregate,
            metric: Metric::ActivityCount,
            group_by,
            rows,
            records: Vec::new(),
            total,
            matched: total as usize,
            scanned: 100,
            current_range: Some(current),
            previous: previous_total.map(|total| PeriodSummary {
                range: current.previous(),
                total,
                matched: total as usize,
            }),
            truncated: 0,
        }
    }

    #[test]
    fn test_total_and_group_trends() {
        let extractor = InsightExtractor::new(0.1, 2.0);
        let result = result(
            Some(Dimension::Worker),
            vec![row("王小明", 10.0, Some(4.0)), row("李大華", 4.0, Some(4.0))],
            Some(8.0),
        );
        let insights = extractor.extract(&result);

        let trends: Vec<_> = insights.iter().filter(|i| i.kind == InsightKind::Trend).collect();
        assert_eq!(trends.len(), 2);
        assert!(trends[0].message.contains("increased 75.0%"));
        assert!(trends[1].message.contains("王小明"));

        let recommendations = insights
            .iter()
            .filter(|i| i.kind == InsightKind::Recommendation)
            .count();
        assert_eq!(recommendations, 2);
    }

    #[test]
    fn test_change_below_threshold_is_quiet() {
        let extractor = InsightExtractor::new(0.1, 2.0);
        let result = result(None, vec![row("total", 10.0, Some(10.5))], Some(10.5));
        assert!(extractor.extract(&result).is_empty());
    }

    #[test]
    fn test_rise_from_zero() {
        let extractor = InsightExtractor::new(0.1, 2.0);
        let result = result(None, vec![row("total", 5.0, Some(0.0))], Some(0.0));
        let insights = extractor.extract(&result);
        assert!(insights[0].message.contains("rose from 0 to 5"));
    }

    #[test]
    fn test_anomaly_needs_three_groups() {
        let extractor = InsightExtractor::new(0.1, 1.5);
        let two = result(Some(Dimension::Branch), vec![row("a", 1.0, None), row("b", 50.0, None)], None);
        assert!(extractor.extract(&two).is_empty());

        let many = result(
            Some(Dimension::Branch),
            vec![
                row("a", 5.0, None),
                row("b", 5.0, None),
                row("c", 6.0, None),
                row("d", 5.0, None),
                row("e", 40.0, None),
            ],
            None,
        );
        let insights = extractor.extract(&many);
        let anomaly = insights
            .iter()
            .find(|i| i.kind == InsightKind::Anomaly)
            .expect("anomaly");
        assert!(anomaly.message.contains("e is unusually high"));
        assert!(insights.iter().any(|i| i.kind == InsightKind::Recommendation));
    }

    #[test]
    fn test_series_trend() {
        let extractor = InsightExtractor::new(0.1, 2.0);
        let mut series = result(
            Some(Dimension::Month),
            vec![row("2024-03", 10.0, None), row("2024-04", 12.0, None), row("2024-05", 6.0, None)],
            None,
        );
        series.intent = IntentKind::Trend;
        let insights = extractor.extract(&series);
        assert!(insights[0].message.contains("decreased 50.0% from 2024-04 to 2024-05"));
    }
}
