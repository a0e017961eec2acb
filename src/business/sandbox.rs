//! Bounded plan execution
//!
//! Plans run on a blocking worker against an immutable dataset snapshot. The
//! worker checks a deadline while it scans, and the caller also races it
//! against `tokio::time::timeout`, so a stuck plan cannot hold a request.

use crate::business::dataset::{ActivityDataset, ActivityRecord, DateRange, Field};
use crate::business::intent::{Dimension, IntentKind, Metric};
use crate::business::plan::{BusinessQueryPlan, Condition};
use crate::config::BusinessConfig;
use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

const DEADLINE_CHECK_INTERVAL: usize = 4096;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SandboxError {
    #[error("execution exceeded {0:?}")]
    Timeout(Duration),

    #[error("plan would scan more than {limit} rows")]
    RowLimit { limit: usize },

    #[error("plan produced more than {limit} groups")]
    GroupLimit { limit: usize },

    #[error("plan cannot run: {0}")]
    Invalid(String),

    #[error("execution worker failed: {0}")]
    Join(String),
}

/// Resource bounds for one execution
#[derive(Debug, Clone, Copy)]
pub struct SandboxLimits {
    pub timeout: Duration,
    pub max_scan_rows: usize,
    pub max_groups: usize,
    pub max_result_rows: usize,
}

impl SandboxLimits {
    pub fn from_config(config: &BusinessConfig) -> Self {
        Self {
            timeout: config.sandbox_timeout_duration(),
            max_scan_rows: config.max_scan_rows,
            max_groups: config.max_groups,
            max_result_rows: config.max_result_rows,
        }
    }
}

/// One output row of an aggregated plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub key: String,
    pub value: f64,
    /// Value in the comparison period
    pub previous: Option<f64>,
}

/// Totals of the comparison period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeriodSummary {
    pub range: DateRange,
    pub total: f64,
    pub matched: usize,
}

/// Machine-checkable outcome of a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub intent: IntentKind,
    pub metric: Metric,
    pub group_by: Option<Dimension>,
    pub rows: Vec<ResultRow>,
    /// Records for list plans, newest first
    pub records: Vec<ActivityRecord>,
    /// Metric over every matching record of the current period
    pub total: f64,
    pub matched: usize,
    pub scanned: usize,
    pub current_range: Option<DateRange>,
    pub previous: Option<PeriodSummary>,
    /// Rows dropped by the result limit
    pub truncated: usize,
}

impl ExecutionResult {
    pub fn is_empty(&self) -> bool {
        self.matched == 0
    }

    /// Relative change of the total against the previous period
    pub fn total_change(&self) -> Option<f64> {
        let previous = self.previous.as_ref()?;
        (previous.total > 0.0).then(|| (self.total - previous.total) / previous.total)
    }
}

/// Executes plans within [`SandboxLimits`]
#[derive(Debug, Clone)]
pub struct Sandbox {
    limits: SandboxLimits,
}

impl Sandbox {
    pub fn new(limits: SandboxLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    pub async fn execute(
        &self,
        dataset: Arc<ActivityDataset>,
        plan: &BusinessQueryPlan,
    ) -> Result<ExecutionResult, SandboxError> {
        let limits = self.limits;
        let plan = plan.clone();
        let deadline = Instant::now() + limits.timeout;

        let worker = tokio::task::spawn_blocking(move || run_plan(&dataset, &plan, &limits, deadline));

        match tokio::time::timeout(limits.timeout, worker).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(SandboxError::Join(e.to_string())),
            Err(_) => Err(SandboxError::Timeout(limits.timeout)),
        }
    }
}

#[derive(Default)]
struct Accumulator {
    activities: usize,
    visits: usize,
    customers: AHashSet<String>,
    workers: AHashSet<String>,
}

impl Accumulator {
    fn add(&mut self, record: &ActivityRecord, metric: Metric) {
        self.activities += 1;
        match metric {
            Metric::ActivityCount => {}
            Metric::VisitCount => {
                if record.is_visit() {
                    self.visits += 1;
                }
            }
            Metric::DistinctCustomers => {
                if !record.customer.is_empty() {
                    self.customers.insert(record.customer.clone());
                }
            }
            Metric::DistinctWorkers => {
                if !record.worker.is_empty() {
                    self.workers.insert(record.worker.clone());
                }
            }
        }
    }

    fn value(&self, metric: Metric) -> f64 {
        match metric {
            Metric::ActivityCount => self.activities as f64,
            Metric::VisitCount => self.visits as f64,
            Metric::DistinctCustomers => self.customers.len() as f64,
            Metric::DistinctWorkers => self.workers.len() as f64,
        }
    }
}

fn group_key(record: &ActivityRecord, dimension: Dimension) -> String {
    let text = |value: &str| {
        if value.is_empty() {
            "(unspecified)".to_string()
        } else {
            value.to_string()
        }
    };
    match dimension {
        Dimension::Branch => text(&record.depart),
        Dimension::Worker => text(&record.worker),
        Dimension::Customer => text(&record.customer),
        Dimension::Class => text(&record.class),
        Dimension::Month => record
            .date
            .map(|d| d.format("%Y-%m").to_string())
            .unwrap_or_else(|| "(undated)".to_string()),
        Dimension::Day => record
            .date
            .map(|d| d.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "(undated)".to_string()),
    }
}

fn matches_filters(record: &ActivityRecord, filters: &[(Field, &Condition)]) -> bool {
    filters.iter().all(|(field, condition)| match condition {
        Condition::Between { start, end } => record
            .date
            .is_some_and(|d| DateRange::new(*start, *end).contains(d)),
        _ => condition.matches_text(record.text(*field)),
    })
}

enum Period {
    Current,
    Previous,
}

fn run_plan(
    dataset: &ActivityDataset,
    plan: &BusinessQueryPlan,
    limits: &SandboxLimits,
    deadline: Instant,
) -> Result<ExecutionResult, SandboxError> {
    if dataset.len() > limits.max_scan_rows {
        return Err(SandboxError::RowLimit {
            limit: limits.max_scan_rows,
        });
    }

    let filters: Vec<(Field, &Condition)> = plan.filters().collect();
    let (date_filters, text_filters): (Vec<_>, Vec<_>) = filters
        .into_iter()
        .partition(|(_, c)| matches!(c, Condition::Between { .. }));
    let comparison = plan.comparison();
    let metric = plan.metric();
    let group_by = plan.group_by();

    let mut current: AHashMap<String, Accumulator> = AHashMap::new();
    let mut previous: AHashMap<String, Accumulator> = AHashMap::new();
    let mut current_total = Accumulator::default();
    let mut previous_total = Accumulator::default();
    let mut listed: Vec<&ActivityRecord> = Vec::new();
    let mut matched = 0usize;

    for (scanned, record) in dataset.records().iter().enumerate() {
        if scanned % DEADLINE_CHECK_INTERVAL == 0 && Instant::now() >= deadline {
            return Err(SandboxError::Timeout(limits.timeout));
        }

        if !matches_filters(record, &text_filters) {
            continue;
        }

        let in_current = matches_filters(record, &date_filters)
            && comparison.map_or(true, |(cur, _)| record.date.is_some_and(|d| cur.contains(d)));
        let period = if in_current {
            Period::Current
        } else if comparison.is_some_and(|(_, prev)| record.date.is_some_and(|d| prev.contains(d))) {
            Period::Previous
        } else {
            continue;
        };

        let (groups, total) = match period {
            Period::Current => {
                matched += 1;
                if plan.intent == IntentKind::List {
                    listed.push(record);
                    continue;
                }
                (&mut current, &mut current_total)
            }
            Period::Previous => (&mut previous, &mut previous_total),
        };

        total.add(record, metric);
        if let Some(dimension) = group_by {
            let key = group_key(record, dimension);
            if !groups.contains_key(&key) && groups.len() >= limits.max_groups {
                return Err(SandboxError::GroupLimit {
                    limit: limits.max_groups,
                });
            }
            groups.entry(key).or_default().add(record, metric);
        }
    }

    let scanned = dataset.len();

    if plan.intent == IntentKind::List {
        listed.sort_by(|a, b| b.date.cmp(&a.date));
        let limit = plan
            .sort()
            .and_then(|(_, limit)| limit)
            .unwrap_or(limits.max_result_rows)
            .min(limits.max_result_rows);
        let truncated = listed.len().saturating_sub(limit);
        return Ok(ExecutionResult {
            intent: plan.intent,
            metric,
            group_by: None,
            rows: Vec::new(),
            records: listed.into_iter().take(limit).cloned().collect(),
            total: matched as f64,
            matched,
            scanned,
            current_range: current_range(&date_filters, comparison),
            previous: None,
            truncated,
        });
    }

    let mut rows: Vec<ResultRow> = match group_by {
        Some(_) => {
            let mut keys: AHashSet<&String> = current.keys().collect();
            if comparison.is_some() {
                keys.extend(previous.keys());
            }
            keys.into_iter()
                .map(|key| ResultRow {
                    key: key.clone(),
                    value: current.get(key).map_or(0.0, |a| a.value(metric)),
                    previous: comparison
                        .map(|_| previous.get(key).map_or(0.0, |a| a.value(metric))),
                })
                .collect()
        }
        None if matched > 0 || comparison.is_some() => vec![ResultRow {
            key: "total".to_string(),
            value: current_total.value(metric),
            previous: comparison.map(|_| previous_total.value(metric)),
        }],
        None => Vec::new(),
    };

    match (plan.sort(), group_by) {
        (Some((descending, _)), _) => sort_by_value(&mut rows, descending),
        (None, Some(dimension)) if dimension.is_time() => rows.sort_by(|a, b| a.key.cmp(&b.key)),
        _ => sort_by_value(&mut rows, true),
    }

    let limit = plan
        .sort()
        .and_then(|(_, limit)| limit)
        .unwrap_or(limits.max_result_rows)
        .min(limits.max_result_rows);
    let truncated = rows.len().saturating_sub(limit);
    rows.truncate(limit);

    Ok(ExecutionResult {
        intent: plan.intent,
        metric,
        group_by,
        rows,
        records: Vec::new(),
        total: current_total.value(metric),
        matched,
        scanned,
        current_range: current_range(&date_filters, comparison),
        previous: comparison.map(|(_, range)| PeriodSummary {
            range,
            total: previous_total.value(metric),
            matched: previous_total.activities,
        }),
        truncated,
    })
}

fn sort_by_value(rows: &mut [ResultRow], descending: bool) {
    rows.sort_by(|a, b| {
        let order = a.value.total_cmp(&b.value);
        let order = if descending { order.reverse() } else { order };
        order.then_with(|| a.key.cmp(&b.key))
    });
}

fn current_range(date_filters: &[(Field, &Condition)], comparison: Option<(DateRange, DateRange)>) -> Option<DateRange> {
    comparison.map(|(current, _)| current).or_else(|| {
        date_filters.iter().find_map(|(_, c)| match c {
            Condition::Between { start, end } => Some(DateRange::new(*start, *end)),
            _ => None,
        })
    })
}
