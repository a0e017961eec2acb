//! Business activity records and their schema

use crate::error::{AskflowError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

/// One row of the activity export
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityRecord {
    /// `None` when the Date column could not be parsed
    pub date: Option<NaiveDate>,
    pub worker: String,
    pub customer: String,
    pub class: String,
    pub content: String,
    /// Branch, e.g. 台南營業所
    pub depart: String,
    pub manager: String,
    pub level: String,
    pub doc_status: String,
}

impl ActivityRecord {
    pub fn text(&self, field: Field) -> &str {
        match field {
            Field::Date => "",
            Field::Worker => &self.worker,
            Field::Customer => &self.customer,
            Field::Class => &self.class,
            Field::Content => &self.content,
            Field::Depart => &self.depart,
            Field::Manager => &self.manager,
            Field::Level => &self.level,
            Field::DocStatus => &self.doc_status,
        }
    }

    /// Whether the activity class marks a customer visit
    pub fn is_visit(&self) -> bool {
        self.class.contains("拜訪")
    }
}

/// Dataset column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Field {
    Date,
    Worker,
    Customer,
    Class,
    Content,
    Depart,
    Manager,
    Level,
    #[serde(rename = "Doc_Status")]
    DocStatus,
}

impl Field {
    pub const ALL: [Field; 9] = [
        Field::Date,
        Field::Worker,
        Field::Customer,
        Field::Class,
        Field::Content,
        Field::Depart,
        Field::Manager,
        Field::Level,
        Field::DocStatus,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Date => "Date",
            Self::Worker => "Worker",
            Self::Customer => "Customer",
            Self::Class => "Class",
            Self::Content => "Content",
            Self::Depart => "Depart",
            Self::Manager => "Manager",
            Self::Level => "Level",
            Self::DocStatus => "Doc_Status",
        }
    }

    pub fn field_type(&self) -> FieldType {
        match self {
            Self::Date => FieldType::Date,
            _ => FieldType::Text,
        }
    }

    fn description(&self) -> &'static str {
        match self {
            Self::Date => "activity date",
            Self::Worker => "sales representative",
            Self::Customer => "customer company",
            Self::Class => "activity class, e.g. 業務拜訪",
            Self::Content => "free-text activity notes",
            Self::Depart => "branch office, e.g. 台南營業所",
            Self::Manager => "approving manager",
            Self::Level => "report level",
            Self::DocStatus => "document status",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Date,
    Text,
}

/// Longest relative window a question can ask for, about a century
pub const MAX_WINDOW_DAYS: i64 = 36_525;

/// Inclusive date range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// `days` days back from `today`, both ends included
    ///
    /// `days` is clamped to `0..=MAX_WINDOW_DAYS`; a start before the
    /// calendar's first date saturates to it.
    pub fn last_days(today: NaiveDate, days: i64) -> Self {
        let days = days.clamp(0, MAX_WINDOW_DAYS);
        let start = today
            .checked_sub_signed(Duration::days(days))
            .unwrap_or(NaiveDate::MIN);
        Self::new(start, today)
    }

    /// Whole calendar month
    pub fn month(year: i32, month: u32) -> Option<Self> {
        let start = NaiveDate::from_ymd_opt(year, month, 1)?;
        let next = if month == 12 {
            NaiveDate::from_ymd_opt(year + 1, 1, 1)?
        } else {
            NaiveDate::from_ymd_opt(year, month + 1, 1)?
        };
        Some(Self::new(start, next - Duration::days(1)))
    }

    pub fn day(date: NaiveDate) -> Self {
        Self::new(date, date)
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn is_valid(&self) -> bool {
        self.start <= self.end
    }

    /// Range of the same length ending the day before this one starts
    pub fn previous(&self) -> Self {
        let end = self.start.pred_opt().unwrap_or(NaiveDate::MIN);
        let span = (self.days() - 1).clamp(0, MAX_WINDOW_DAYS);
        let start = end
            .checked_sub_signed(Duration::days(span))
            .unwrap_or(NaiveDate::MIN);
        Self::new(start, end)
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start.format("%Y/%m/%d"))
        } else {
            write!(
                f,
                "{} ~ {}",
                self.start.format("%Y/%m/%d"),
                self.end.format("%Y/%m/%d")
            )
        }
    }
}

/// Parse "2024/05/01", "2024-5-1" or a date followed by a time
pub fn parse_record_date(value: &str) -> Option<NaiveDate> {
    let head = value.trim().split(|c: char| c.is_whitespace() || c == 'T').next()?;
    let mut parts = head.split(['/', '-']);
    let year: i32 = parts.next()?.parse().ok()?;
    let month: u32 = parts.next()?.parse().ok()?;
    let day: u32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Loaded activity records with lookup sets for intent parsing
#[derive(Debug, Clone)]
pub struct ActivityDataset {
    records: Vec<ActivityRecord>,
    workers: BTreeSet<String>,
    customers: BTreeSet<String>,
    branches: BTreeSet<String>,
    source: String,
    loaded_at: DateTime<Utc>,
}

impl ActivityDataset {
    pub fn new(records: Vec<ActivityRecord>, source: impl Into<String>) -> Self {
        let names = |f: fn(&ActivityRecord) -> &str| -> BTreeSet<String> {
            records
                .iter()
                .map(f)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect()
        };

        Self {
            workers: names(|r| &r.worker),
            customers: names(|r| &r.customer),
            branches: names(|r| &r.depart),
            records,
            source: source.into(),
            loaded_at: Utc::now(),
        }
    }

    pub fn records(&self) -> &[ActivityRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn workers(&self) -> &BTreeSet<String> {
        &self.workers
    }

    pub fn customers(&self) -> &BTreeSet<String> {
        &self.customers
    }

    pub fn branches(&self) -> &BTreeSet<String> {
        &self.branches
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn date_range(&self) -> Option<DateRange> {
        let mut dates = self.records.iter().filter_map(|r| r.date);
        let first = dates.next()?;
        let (start, end) = dates.fold((first, first), |(lo, hi), d| (lo.min(d), hi.max(d)));
        Some(DateRange::new(start, end))
    }

    /// Field list, types and example values
    pub fn schema_info(&self) -> SchemaInfo {
        let fields = Field::ALL
            .iter()
            .map(|&field| {
                let mut examples: Vec<String> = Vec::new();
                for record in &self.records {
                    if examples.len() >= EXAMPLE_VALUES {
                        break;
                    }
                    let value = match field {
                        Field::Date => record.date.map(|d| d.format("%Y/%m/%d").to_string()),
                        _ => Some(record.text(field).chars().take(40).collect::<String>()),
                    };
                    if let Some(value) = value.filter(|v| !v.is_empty()) {
                        if !examples.contains(&value) {
                            examples.push(value);
                        }
                    }
                }

                FieldInfo {
                    name: field.name().to_string(),
                    field_type: field.field_type(),
                    description: field.description().to_string(),
                    example_values: examples,
                }
            })
            .collect();

        SchemaInfo {
            fields,
            record_count: self.records.len(),
            date_range: self.date_range(),
            distinct_workers: self.workers.len(),
            distinct_customers: self.customers.len(),
            branches: self.branches.iter().cloned().collect(),
            activity_classes: top_counts(self.records.iter().map(|r| r.class.as_str()), 10),
        }
    }

    /// Aggregate snapshot over the last 30 days
    pub fn quick_stats(&self, today: NaiveDate) -> DatasetStats {
        let window = DateRange::last_days(today, 30);
        let recent: Vec<&ActivityRecord> = self
            .records
            .iter()
            .filter(|r| r.date.is_some_and(|d| window.contains(d)))
            .collect();

        let mut by_branch = BTreeMap::new();
        for record in &recent {
            *by_branch.entry(record.depart.clone()).or_insert(0) += 1;
        }

        DatasetStats {
            total_records: self.records.len(),
            recent_30_days: recent.len(),
            active_workers: recent
                .iter()
                .map(|r| r.worker.as_str())
                .filter(|w| !w.is_empty())
                .collect::<BTreeSet<_>>()
                .len(),
            active_customers: recent
                .iter()
                .map(|r| r.customer.as_str())
                .filter(|c| !c.is_empty())
                .collect::<BTreeSet<_>>()
                .len(),
            top_activities: top_counts(recent.iter().map(|r| r.class.as_str()), 5),
            by_branch,
        }
    }
}

const EXAMPLE_VALUES: usize = 3;

fn top_counts<'a>(values: impl Iterator<Item = &'a str>, limit: usize) -> Vec<(String, usize)> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for value in values.filter(|v| !v.is_empty()) {
        *counts.entry(value).or_insert(0) += 1;
    }
    let mut counts: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(value, count)| (value.to_string(), count))
        .collect();
    counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    counts.truncate(limit);
    counts
}

/// Column description returned by `schema_info`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    pub field_type: FieldType,
    pub description: String,
    pub example_values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaInfo {
    pub fields: Vec<FieldInfo>,
    pub record_count: usize,
    pub date_range: Option<DateRange>,
    pub distinct_workers: usize,
    pub distinct_customers: usize,
    pub branches: Vec<String>,
    /// Most frequent activity classes with counts
    pub activity_classes: Vec<(String, usize)>,
}

impl SchemaInfo {
    /// Plain-text schema for plan generation prompts
    pub fn describe(&self) -> String {
        let mut out = String::from("Fields:\n");
        for field in &self.fields {
            out.push_str(&format!(
                "- {} ({:?}): {}; examples: {}\n",
                field.name,
                field.field_type,
                field.description,
                field.example_values.join(", ")
            ));
        }
        if let Some(range) = &self.date_range {
            out.push_str(&format!("Date range: {}\n", range));
        }
        if !self.branches.is_empty() {
            out.push_str(&format!("Branches: {}\n", self.branches.join(", ")));
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetStats {
    pub total_records: usize,
    pub recent_30_days: usize,
    pub active_workers: usize,
    pub active_customers: usize,
    pub top_activities: Vec<(String, usize)>,
    pub by_branch: BTreeMap<String, usize>,
}

/// Loads activity records
#[async_trait]
pub trait DatasetSource: Send + Sync {
    async fn load(&self) -> Result<Vec<ActivityRecord>>;

    fn describe(&self) -> String;
}

#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(rename = "Date", default)]
    date: String,
    #[serde(rename = "Worker", default)]
    worker: String,
    #[serde(rename = "Customer", default)]
    customer: String,
    #[serde(rename = "Class", default)]
    class: String,
    #[serde(rename = "Content", default)]
    content: String,
    #[serde(rename = "Depart", default)]
    depart: String,
    #[serde(rename = "Manager", default)]
    manager: String,
    #[serde(rename = "Level", default)]
    level: String,
    #[serde(rename = "Doc_Status", default)]
    doc_status: String,
}

impl From<CsvRow> for ActivityRecord {
    fn from(row: CsvRow) -> Self {
        Self {
            date: parse_record_date(&row.date),
            worker: row.worker,
            customer: row.customer,
            class: row.class,
            content: row.content,
            depart: row.depart,
            manager: row.manager,
            level: row.level,
            doc_status: row.doc_status,
        }
    }
}

/// CSV export with a header row
pub struct CsvDatasetSource {
    path: PathBuf,
}

impl CsvDatasetSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// Parse CSV text; blank and undecodable rows are skipped
pub fn parse_activity_csv(content: &str) -> Result<Vec<ActivityRecord>> {
    let content = content.trim_start_matches('\u{feff}');
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let headers = reader.headers().map_err(|e| AskflowError::Csv {
        source: e,
        context: "Failed to read CSV header".to_string(),
    })?;
    if !headers.iter().any(|h| h == "Date") {
        return Err(AskflowError::Config(
            "Business CSV has no Date column".to_string(),
        ));
    }

    let mut records = Vec::new();
    for (row_no, row) in reader.deserialize::<CsvRow>().enumerate() {
        match row {
            Ok(row) if row.date.is_empty() && row.content.is_empty() => continue,
            Ok(row) => records.push(ActivityRecord::from(row)),
            Err(e) => {
                tracing::warn!(row = row_no + 2, error = %e, "Skipping malformed business row");
            }
        }
    }

    Ok(records)
}

#[async_trait]
impl DatasetSource for CsvDatasetSource {
    async fn load(&self) -> Result<Vec<ActivityRecord>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| AskflowError::Io {
                source: e,
                context: format!("Failed to read business data: {:?}", self.path),
            })?;

        let records = parse_activity_csv(&content)?;
        let undated = records.iter().filter(|r| r.date.is_none()).count();
        if undated > 0 {
            tracing::warn!(undated, "Business rows without a parseable date");
        }
        Ok(records)
    }

    fn describe(&self) -> String {
        format!("csv:{}", self.path.display())
    }
}

/// Current month as a range from the first day to `today`
pub fn month_to_date(today: NaiveDate) -> DateRange {
    let start = NaiveDate::from_ymd_opt(today.year(), today.month(), 1).unwrap_or(today);
    DateRange::new(start, today)
}
