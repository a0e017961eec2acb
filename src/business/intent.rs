//! Rule-based intent parsing for business questions
//!
//! Extracts the metric, grouping, filters and comparison intent from a
//! question using the lexicon and the names present in the dataset.

use crate::business::dataset::{month_to_date, ActivityDataset, DateRange};
use crate::business::plan::Condition;
use crate::error::{AskflowError, Result};
use crate::lexicon::Lexicon;
use chrono::{Datelike, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// What kind of answer the question expects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    Aggregate,
    Trend,
    Compare,
    Ranking,
    List,
}

impl fmt::Display for IntentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Aggregate => "aggregate",
            Self::Trend => "trend",
            Self::Compare => "compare",
            Self::Ranking => "ranking",
            Self::List => "list",
        };
        f.write_str(name)
    }
}

/// Computed measure over matching records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    ActivityCount,
    /// Records whose class contains 拜訪
    VisitCount,
    DistinctCustomers,
    DistinctWorkers,
}

impl Metric {
    pub fn label(&self) -> &'static str {
        match self {
            Self::ActivityCount => "activities",
            Self::VisitCount => "customer visits",
            Self::DistinctCustomers => "distinct customers",
            Self::DistinctWorkers => "active workers",
        }
    }
}

/// Grouping key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Branch,
    Worker,
    Customer,
    Class,
    Month,
    Day,
}

impl Dimension {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Branch => "branch",
            Self::Worker => "worker",
            Self::Customer => "customer",
            Self::Class => "activity class",
            Self::Month => "month",
            Self::Day => "day",
        }
    }

    pub fn is_time(&self) -> bool {
        matches!(self, Self::Month | Self::Day)
    }
}

/// Filters extracted from the question
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntentFilters {
    pub date_range: Option<DateRange>,
    pub branch: Option<String>,
    pub customer: Option<Condition>,
    pub worker: Option<String>,
    pub activity_class: Option<String>,
}

impl IntentFilters {
    /// Short human description, e.g. "台南營業所, 2024/05/01 ~ 2024/05/31"
    pub fn describe(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(branch) = &self.branch {
            parts.push(branch.clone());
        }
        if let Some(worker) = &self.worker {
            parts.push(worker.clone());
        }
        if let Some(customer) = &self.customer {
            parts.push(customer.value().to_string());
        }
        if let Some(class) = &self.activity_class {
            parts.push(class.clone());
        }
        if let Some(range) = &self.date_range {
            parts.push(range.to_string());
        }
        if parts.is_empty() {
            "all records".to_string()
        } else {
            parts.join(", ")
        }
    }
}

/// Parsed business question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessIntent {
    pub kind: IntentKind,
    pub metric: Metric,
    pub group_by: Option<Dimension>,
    pub filters: IntentFilters,
    /// Compare against the preceding period of equal length
    pub compare_previous: bool,
    pub limit: Option<usize>,
    /// Text that produced the date range
    pub date_phrase: Option<String>,
}

impl BusinessIntent {
    /// Stable text form used in cache fingerprints
    pub fn signature(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self))
    }
}

const RANKING_TERMS: &[&str] = &["排名", "排行", "前三", "前五", "前十", "最多", "最少", "top", "rank"];
const TREND_TERMS: &[&str] = &["趨勢", "走勢", "變化", "trend"];
const COMPARE_TERMS: &[&str] = &["比較", "對比", "差異", "compare", "versus", " vs"];
const LIST_TERMS: &[&str] = &["列出", "清單", "明細", "有哪些", "list", "show me"];
const PERFORMANCE_TERMS: &[&str] = &["業績", "表現", "如何", "狀況", "performance"];

const DISTINCT_CUSTOMER_TERMS: &[&str] = &[
    "客戶數", "幾個客戶", "幾家客戶", "多少客戶", "多少家客戶", "多少個客戶",
    "how many customers", "number of customers",
];
const DISTINCT_WORKER_TERMS: &[&str] = &[
    "業務員數", "幾位業務", "幾個業務", "多少業務", "多少位業務",
    "how many workers", "number of workers", "active workers",
];

const GROUP_MARKERS: &[(&str, Dimension)] = &[
    ("各營業所", Dimension::Branch),
    ("每個營業所", Dimension::Branch),
    ("營業所排名", Dimension::Branch),
    ("by branch", Dimension::Branch),
    ("各業務員", Dimension::Worker),
    ("每位業務", Dimension::Worker),
    ("每個業務", Dimension::Worker),
    ("業務員排名", Dimension::Worker),
    ("哪個業務", Dimension::Worker),
    ("哪位業務", Dimension::Worker),
    ("by worker", Dimension::Worker),
    ("各客戶", Dimension::Customer),
    ("每個客戶", Dimension::Customer),
    ("客戶排名", Dimension::Customer),
    ("哪個客戶", Dimension::Customer),
    ("by customer", Dimension::Customer),
    ("活動類型", Dimension::Class),
    ("各類", Dimension::Class),
    ("by class", Dimension::Class),
    ("每月", Dimension::Month),
    ("各月", Dimension::Month),
    ("月份", Dimension::Month),
    ("monthly", Dimension::Month),
    ("每天", Dimension::Day),
    ("每日", Dimension::Day),
    ("daily", Dimension::Day),
];

/// Activity classes recognized as filters
const ACTIVITY_CLASSES: &[&str] = &["送貨", "報價", "維修", "會議", "拜訪"];

/// Fragments that never name a customer
const CUSTOMER_STOPWORDS: &[&str] = &["數", "多少", "幾", "排名", "拜訪", "活動", "資料", "名單", "有哪些"];

const DEFAULT_RANKING_LIMIT: usize = 5;

struct DatePatterns {
    last_30: Regex,
    last_7: Regex,
    last_n: Regex,
    year_month_cn: Regex,
    year_month_slash: Regex,
    month_only: Regex,
    full_date: Regex,
    last_n_days_en: Regex,
    ranking_limit: Regex,
    customer_prefix: Regex,
    customer_suffix: Vec<(String, Regex)>,
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| AskflowError::Config(format!("Invalid intent pattern '{}': {}", pattern, e)))
}

impl DatePatterns {
    fn new(customer_suffixes: &[String]) -> Result<Self> {
        let customer_suffix = customer_suffixes
            .iter()
            .filter(|s| !s.is_empty())
            .map(|suffix| {
                let pattern = format!(r"([^\s,，、。？?的與和跟及]+{})", regex::escape(suffix));
                compile(&pattern).map(|re| (suffix.clone(), re))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            last_30: compile(r"最近\s*(?:30\s*[天日]|一個?月)")?,
            last_7: compile(r"最近\s*(?:7\s*[天日]|一個?[週周]|一個?禮拜)")?,
            last_n: compile(r"最近\s*(\d+)\s*(個?月|[天日]|[週周])")?,
            year_month_cn: compile(r"(20\d{2})\s*年\s*(\d{1,2})\s*月?")?,
            year_month_slash: compile(r"(20\d{2})[/-](\d{1,2})([/-]\d{1,2})?")?,
            month_only: compile(r"(\d{1,2})\s*月")?,
            full_date: compile(r"(20\d{2})[/-](\d{1,2})[/-](\d{1,2})")?,
            last_n_days_en: compile(r"(?:last|past)\s+(\d+)\s+days?")?,
            ranking_limit: compile(r"(?:前|top\s*)(\d+)")?,
            customer_prefix: compile(r"客戶[：:\s]*([^\s,，、的與和]+)")?,
            customer_suffix,
        })
    }
}

/// Turns a question into a [`BusinessIntent`]
pub struct IntentParser {
    lexicon: Arc<Lexicon>,
    default_window_days: i64,
    patterns: DatePatterns,
}

impl IntentParser {
    pub fn new(lexicon: Arc<Lexicon>, default_window_days: i64) -> Result<Self> {
        let patterns = DatePatterns::new(&lexicon.customer_suffixes)?;
        Ok(Self {
            lexicon,
            default_window_days,
            patterns,
        })
    }

    pub fn parse(&self, question: &str, dataset: Option<&ActivityDataset>, today: NaiveDate) -> BusinessIntent {
        let lowered = question.to_lowercase();
        let has = |terms: &[&str]| terms.iter().any(|t| lowered.contains(t));

        let mut filters = IntentFilters::default();

        let branch = self.lexicon.detect_branch(question);
        let mut remainder = question.to_string();
        if let Some(branch) = &branch {
            remainder = remainder.replace(&branch.canonical, " ").replace(&branch.matched, " ");
            filters.branch = Some(branch.canonical.clone());
        } else if let Some(dataset) = dataset {
            filters.branch = dataset
                .branches()
                .iter()
                .filter(|b| b.chars().count() >= 2 && question.contains(b.as_str()))
                .max_by_key(|b| b.len())
                .cloned();
        }

        let date = self.parse_date_phrase(question, today);
        if let Some((range, phrase)) = &date {
            filters.date_range = Some(*range);
            remainder = remainder.replace(phrase.as_str(), " ");
        }

        filters.worker = dataset.and_then(|d| {
            d.workers()
                .iter()
                .filter(|w| w.chars().count() >= 2 && question.contains(w.as_str()))
                .max_by_key(|w| w.len())
                .cloned()
        });
        if let Some(worker) = &filters.worker {
            remainder = remainder.replace(worker.as_str(), " ");
        }

        filters.customer = self.detect_customer(&remainder, dataset);

        let metric = if has(DISTINCT_CUSTOMER_TERMS) {
            Metric::DistinctCustomers
        } else if has(DISTINCT_WORKER_TERMS) {
            Metric::DistinctWorkers
        } else if lowered.contains("拜訪") || lowered.contains("visit") {
            Metric::VisitCount
        } else {
            Metric::ActivityCount
        };

        filters.activity_class = ACTIVITY_CLASSES
            .iter()
            .find(|class| question.contains(*class))
            .filter(|class| !(**class == "拜訪" && metric == Metric::VisitCount))
            .map(|class| class.to_string());

        let kind = if has(RANKING_TERMS) {
            IntentKind::Ranking
        } else if has(TREND_TERMS) {
            IntentKind::Trend
        } else if has(COMPARE_TERMS) {
            IntentKind::Compare
        } else if has(LIST_TERMS) {
            IntentKind::List
        } else {
            IntentKind::Aggregate
        };

        let mut group_by = GROUP_MARKERS
            .iter()
            .find(|(marker, _)| lowered.contains(marker))
            .map(|(_, dimension)| *dimension);

        let performance = has(PERFORMANCE_TERMS);
        let mut compare_previous = match kind {
            IntentKind::Trend | IntentKind::Compare => true,
            IntentKind::List | IntentKind::Ranking => false,
            IntentKind::Aggregate => performance && filters.date_range.is_some(),
        };

        // Period comparisons and trends need a window
        if (compare_previous || kind == IntentKind::Trend) && filters.date_range.is_none() {
            filters.date_range = Some(DateRange::last_days(today, self.default_window_days));
        }
        if kind == IntentKind::List {
            compare_previous = false;
            group_by = None;
        }

        if group_by.is_none() {
            group_by = match kind {
                IntentKind::Ranking => Some(if filters.worker.is_some() {
                    Dimension::Customer
                } else {
                    Dimension::Worker
                }),
                IntentKind::Trend => Some(Dimension::Month),
                IntentKind::Aggregate | IntentKind::Compare if performance => {
                    Some(if filters.branch.is_some() {
                        Dimension::Worker
                    } else {
                        Dimension::Branch
                    })
                }
                _ => None,
            };
        }

        let limit = match kind {
            IntentKind::Ranking => Some(self.ranking_limit(&lowered)),
            _ => None,
        };

        BusinessIntent {
            kind,
            metric,
            group_by,
            filters,
            compare_previous,
            limit,
            date_phrase: date.map(|(_, phrase)| phrase),
        }
    }

    fn ranking_limit(&self, lowered: &str) -> usize {
        if let Some(n) = self
            .patterns
            .ranking_limit
            .captures(lowered)
            .and_then(|c| c[1].parse::<usize>().ok())
            .filter(|n| *n > 0)
        {
            return n;
        }
        if lowered.contains("前三") {
            3
        } else if lowered.contains("前十") {
            10
        } else {
            DEFAULT_RANKING_LIMIT
        }
    }

    /// Date range named by the question, with the phrase that matched
    pub fn parse_date_phrase(&self, question: &str, today: NaiveDate) -> Option<(DateRange, String)> {
        let p = &self.patterns;

        if let Some(m) = p.last_30.find(question) {
            return Some((DateRange::last_days(today, 30), m.as_str().to_string()));
        }
        if let Some(m) = p.last_7.find(question) {
            return Some((DateRange::last_days(today, 7), m.as_str().to_string()));
        }
        if let Some(c) = p.last_n.captures(question) {
            // Digits only, so a failed parse means the count overflowed
            let n = c[1].parse::<i64>().unwrap_or(i64::MAX);
            let days = match &c[2] {
                "天" | "日" => n,
                "週" | "周" => n.saturating_mul(7),
                _ => n.saturating_mul(30),
            };
            return Some((DateRange::last_days(today, days), c[0].to_string()));
        }
        if question.contains("最近") {
            return Some((
                DateRange::last_days(today, self.default_window_days),
                "最近".to_string(),
            ));
        }

        if let Some(c) = p.year_month_cn.captures(question) {
            if let Some(range) = month_of(&c[1], &c[2]) {
                return Some((range, c[0].to_string()));
            }
        }
        for c in p.year_month_slash.captures_iter(question) {
            // A trailing day part makes it a full date
            if c.get(3).is_some() || followed_by_digit(question, c.get(0).map_or(0, |m| m.end())) {
                continue;
            }
            if let Some(range) = month_of(&c[1], &c[2]) {
                return Some((range, c[0].to_string()));
            }
        }

        for c in p.month_only.captures_iter(question) {
            let Some(whole) = c.get(0) else { continue };
            if preceded_by_digit(question, whole.start()) {
                continue;
            }
            if let Some(range) = month_of(&today.year().to_string(), &c[1]) {
                return Some((range, whole.as_str().to_string()));
            }
        }

        if let Some(c) = p.full_date.captures(question) {
            let date = (|| {
                NaiveDate::from_ymd_opt(c[1].parse().ok()?, c[2].parse().ok()?, c[3].parse().ok()?)
            })();
            if let Some(date) = date {
                return Some((DateRange::day(date), c[0].to_string()));
            }
        }

        let lowered = question.to_lowercase();
        if let Some(c) = p.last_n_days_en.captures(&lowered) {
            let n = c[1].parse::<i64>().unwrap_or(i64::MAX);
            return Some((DateRange::last_days(today, n), c[0].to_string()));
        }
        if lowered.contains("this month") || question.contains("本月") {
            let phrase = if question.contains("本月") { "本月" } else { "this month" };
            return Some((month_to_date(today), phrase.to_string()));
        }
        if lowered.contains("last month") || question.contains("上個月") || question.contains("上月") {
            let first = NaiveDate::from_ymd_opt(today.year(), today.month(), 1)?;
            let previous = first.pred_opt()?;
            let phrase = ["上個月", "上月"]
                .into_iter()
                .find(|p| question.contains(p))
                .unwrap_or("last month");
            return DateRange::month(previous.year(), previous.month()).map(|r| (r, phrase.to_string()));
        }

        None
    }

    fn detect_customer(&self, text: &str, dataset: Option<&ActivityDataset>) -> Option<Condition> {
        let p = &self.patterns;

        if let Some(c) = p.customer_prefix.captures(text) {
            let candidate = c[1].trim().to_string();
            if let Some(name) = dataset.and_then(|d| self.resolve_customer(&candidate, d)) {
                return Some(Condition::Equals(name));
            }
            let generic = CUSTOMER_STOPWORDS.iter().any(|w| candidate.contains(w));
            if candidate.chars().count() >= 2 && !generic {
                return Some(Condition::Contains(candidate));
            }
        }

        for (_, regex) in &p.customer_suffix {
            if let Some(c) = regex.captures(text) {
                let candidate = c[1].trim().to_string();
                if let Some(name) = dataset.and_then(|d| self.resolve_customer(&candidate, d)) {
                    return Some(Condition::Equals(name));
                }
                return Some(Condition::Contains(candidate));
            }
        }

        // Known customers mentioned by full or suffix-stripped name
        let dataset = dataset?;
        dataset
            .customers()
            .iter()
            .filter(|name| {
                let stripped = self.strip_suffixes(name);
                (name.chars().count() >= 2 && text.contains(name.as_str()))
                    || (stripped.chars().count() >= 2 && text.contains(stripped.as_str()))
            })
            .max_by_key(|name| name.len())
            .map(|name| Condition::Equals(name.clone()))
    }

    /// Match a candidate against dataset customers: exact, suffix-stripped, then substring
    pub fn resolve_customer(&self, candidate: &str, dataset: &ActivityDataset) -> Option<String> {
        let customers = dataset.customers();
        if customers.contains(candidate) {
            return Some(candidate.to_string());
        }

        let clean = self.strip_suffixes(candidate);
        if clean.chars().count() >= 2 {
            if let Some(name) = customers
                .iter()
                .find(|name| name.as_str() == clean || self.strip_suffixes(name) == clean)
            {
                return Some(name.clone());
            }
        }

        let needle = if clean.chars().count() >= 2 { clean.as_str() } else { candidate };
        customers
            .iter()
            .filter(|name| name.contains(needle) || candidate.contains(name.as_str()))
            .filter(|name| name.chars().count() >= 2)
            .min_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)))
            .cloned()
    }

    fn strip_suffixes(&self, name: &str) -> String {
        // Suffixes are sorted longest first, so 股份有限公司 goes before 公司
        let mut clean = name.to_string();
        for suffix in &self.lexicon.customer_suffixes {
            if let Some(stripped) = clean.strip_suffix(suffix.as_str()) {
                clean = stripped.to_string();
            }
        }
        clean.trim().to_string()
    }
}

fn month_of(year: &str, month: &str) -> Option<DateRange> {
    let year: i32 = year.parse().ok()?;
    let month: u32 = month.parse().ok()?;
    DateRange::month(year, month)
}

fn preceded_by_digit(text: &str, start: usize) -> bool {
    text[..start].chars().next_back().is_some_and(|c| c.is_ascii_digit())
}

fn followed_by_digit(text: &str, end: usize) -> bool {
    text[end..].chars().next().is_some_and(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::business::dataset::{ActivityRecord, MAX_WINDOW_DAYS};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn today() -> NaiveDate {
        date(2024, 5, 31)
    }

    fn parser() -> IntentParser {
        IntentParser::new(Arc::new(Lexicon::builtin().unwrap()), 90).unwrap()
    }

    fn record(worker: &str, customer: &str, depart: &str) -> ActivityRecord {
        ActivityRecord {
            date: Some(date(2024, 5, 20)),
            worker: worker.to_string(),
            customer: customer.to_string(),
            class: "業務拜訪".to_string(),
            content: String::new(),
            depart: depart.to_string(),
            manager: String::new(),
            level: String::new(),
            doc_status: String::new(),
        }
    }

    fn dataset() -> ActivityDataset {
        ActivityDataset::new(
            vec![
                record("王小明", "東台精機股份有限公司", "台南營業所"),
                record("李大華", "協鋼工業", "台中營業所"),
                record("陳美玲", "永興", "高雄營業所"),
            ],
            "test",
        )
    }

    fn range_of(question: &str) -> Option<DateRange> {
        parser().parse_date_phrase(question, today()).map(|(r, _)| r)
    }

    #[test]
    fn test_relative_date_phrases() {
        assert_eq!(range_of("最近一個月的拜訪"), Some(DateRange::last_days(today(), 30)));
        assert_eq!(range_of("最近30天"), Some(DateRange::last_days(today(), 30)));
        assert_eq!(range_of("最近一週"), Some(DateRange::last_days(today(), 7)));
        assert_eq!(range_of("最近14天"), Some(DateRange::last_days(today(), 14)));
        assert_eq!(range_of("最近2週"), Some(DateRange::last_days(today(), 14)));
        assert_eq!(range_of("最近3個月"), Some(DateRange::last_days(today(), 90)));
        assert_eq!(range_of("最近的活動"), Some(DateRange::last_days(today(), 90)));
    }

    #[test]
    fn test_huge_relative_windows_are_clamped() {
        let century = Some(DateRange::last_days(today(), MAX_WINDOW_DAYS));
        assert_eq!(range_of("台南營業所最近100000000天的業績如何？"), century);
        assert_eq!(range_of("最近99999999999個月"), century);
        assert_eq!(range_of("最近99999999999999999999999週"), century);
        assert_eq!(range_of("visits in the last 99999999999 days"), century);

        let intent = parser().parse("台南營業所最近100000000天的業績如何？", Some(&dataset()), today());
        let range = intent.filters.date_range.unwrap();
        assert!(range.is_valid());
        assert!(intent.compare_previous);
        assert!(range.previous().is_valid());
    }

    #[test]
    fn test_absolute_date_phrases() {
        assert_eq!(range_of("2024年3月的業績"), DateRange::month(2024, 3));
        assert_eq!(range_of("2023/11 活動"), DateRange::month(2023, 11));
        assert_eq!(range_of("3月拜訪"), DateRange::month(2024, 3));
        assert_eq!(range_of("2024/05/02 的日報"), Some(DateRange::day(date(2024, 5, 2))));
        assert_eq!(range_of("activities in the last 10 days"), Some(DateRange::last_days(today(), 10)));
        assert_eq!(range_of("this month"), Some(DateRange::new(date(2024, 5, 1), today())));
        assert_eq!(range_of("上個月"), DateRange::month(2024, 4));
        assert_eq!(range_of("全部資料"), None);
        assert_eq!(range_of("13月"), None);
    }

    #[test]
    fn test_performance_question() {
        let intent = parser().parse("台南營業所最近一個月的業績如何？", Some(&dataset()), today());
        assert_eq!(intent.kind, IntentKind::Aggregate);
        assert_eq!(intent.filters.branch.as_deref(), Some("台南營業所"));
        assert_eq!(intent.filters.date_range, Some(DateRange::last_days(today(), 30)));
        assert!(intent.compare_previous);
        assert_eq!(intent.group_by, Some(Dimension::Worker));
        assert_eq!(intent.metric, Metric::ActivityCount);
    }

    #[test]
    fn test_branch_alias_and_ranking() {
        let intent = parser().parse("台中所業務員拜訪次數排名前3", Some(&dataset()), today());
        assert_eq!(intent.filters.branch.as_deref(), Some("台中營業所"));
        assert_eq!(intent.kind, IntentKind::Ranking);
        assert_eq!(intent.metric, Metric::VisitCount);
        assert_eq!(intent.group_by, Some(Dimension::Worker));
        assert_eq!(intent.limit, Some(3));
        assert!(intent.filters.activity_class.is_none());
    }

    #[test]
    fn test_customer_resolution() {
        let parser = parser();
        let data = dataset();

        let intent = parser.parse("東台精機最近的拜訪紀錄", Some(&data), today());
        assert_eq!(
            intent.filters.customer,
            Some(Condition::Equals("東台精機股份有限公司".to_string()))
        );

        let intent = parser.parse("客戶：永興 的活動", Some(&data), today());
        assert_eq!(intent.filters.customer, Some(Condition::Equals("永興".to_string())));

        let intent = parser.parse("大同科技的送貨", Some(&data), today());
        assert_eq!(intent.filters.customer, Some(Condition::Contains("大同科技".to_string())));
        assert_eq!(intent.filters.activity_class.as_deref(), Some("送貨"));

        let intent = parser.parse("客戶數有多少", Some(&data), today());
        assert!(intent.filters.customer.is_none());
        assert_eq!(intent.metric, Metric::DistinctCustomers);
    }

    #[test]
    fn test_worker_and_list() {
        let intent = parser().parse("列出王小明2024年5月的日報", Some(&dataset()), today());
        assert_eq!(intent.kind, IntentKind::List);
        assert_eq!(intent.filters.worker.as_deref(), Some("王小明"));
        assert_eq!(intent.filters.date_range, DateRange::month(2024, 5));
        assert!(intent.group_by.is_none());
        assert!(!intent.compare_previous);
    }

    #[test]
    fn test_trend_defaults_window() {
        let intent = parser().parse("各營業所的拜訪趨勢", None, today());
        assert_eq!(intent.kind, IntentKind::Trend);
        assert_eq!(intent.group_by, Some(Dimension::Branch));
        assert_eq!(intent.filters.date_range, Some(DateRange::last_days(today(), 90)));
        assert!(intent.compare_previous);
    }

    #[test]
    fn test_signature_changes_with_filters() {
        let parser = parser();
        let a = parser.parse("台南營業所最近一個月的業績如何？", None, today());
        let b = parser.parse("台中營業所最近一個月的業績如何？", None, today());
        assert_ne!(a.signature(), b.signature());
        assert_eq!(a.signature(), parser.parse("台南營業所最近一個月的業績如何？", None, today()).signature());
    }
}
