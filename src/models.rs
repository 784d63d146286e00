//! Core data models used throughout Ficus.
//!
//! These types describe crawl definitions, the parameter map handed to a
//! crawl, the records it produces, and the results that flow back to the
//! runner.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;

/// A row produced by a crawl or read from a fact datasource.
pub type Record = Map<String, Value>;

// Well-known parameter keys.
pub const PARAM_SITE: &str = "site_";
pub const PARAM_PROJECT_CODE: &str = "projectCode_";
pub const PARAM_CODE: &str = "code_";
pub const PARAM_LOG_ID: &str = "__logId__";
pub const PARAM_TRIGGER_TIME: &str = "__triggerTime__";
pub const PARAM_PROCESS_LOG_ID: &str = "__processLogId__";
pub const PARAM_PROCESS_ID: &str = "__processId__";
pub const PARAM_TASK_CACHE: &str = "__taskCache__";
pub const PARAM_PROCESS_CACHE: &str = "__processCache__";
pub const PARAM_MAX_PAGES: &str = "maxPages_";
pub const PARAM_PAGE_NUM: &str = "pageNum_";
pub const PARAM_PAGE_SIZE: &str = "pageSize_";
pub const PARAM_NEED_COUNT: &str = "needCount_";

/// Kind of handler a crawl definition requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CrawlType {
    /// Script-based crawl (Lua or an injected closure).
    Custom,
    Simple,
    Batch,
}

impl fmt::Display for CrawlType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CrawlType::Custom => "CUSTOM",
            CrawlType::Simple => "SIMPLE",
            CrawlType::Batch => "BATCH",
        };
        f.write_str(s)
    }
}

/// Composite identity of a crawl: `{site, project_code, code}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CrawlKey {
    pub site: String,
    pub project_code: String,
    pub code: String,
}

impl CrawlKey {
    pub fn new(
        site: impl Into<String>,
        project_code: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self {
            site: site.into(),
            project_code: project_code.into(),
            code: code.into(),
        }
    }

    /// The execution-context local code: `{site}_{projectCode}_{code}`.
    pub fn local_code(&self) -> String {
        format!("{}_{}_{}", self.site, self.project_code, self.code)
    }
}

impl fmt::Display for CrawlKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.site, self.project_code, self.code)
    }
}

/// A configured crawl job. Read-only to the execution core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlDefinition {
    pub site: String,
    pub project_code: String,
    pub code: String,
    #[serde(rename = "type")]
    pub crawl_type: CrawlType,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub output_fd_codes: Vec<String>,
    /// Lua script backing the crawl, when it is not a registered Rust crawl.
    #[serde(default)]
    pub script: Option<PathBuf>,
    /// Script timeout in seconds.
    #[serde(default = "default_script_timeout")]
    pub timeout: u64,
}

fn default_script_timeout() -> u64 {
    600
}

impl CrawlDefinition {
    pub fn key(&self) -> CrawlKey {
        CrawlKey::new(&self.site, &self.project_code, &self.code)
    }
}

/// The flat parameter map handed to one crawl invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionParams(Map<String, Value>);

impl ExecutionParams {
    pub fn new() -> Self {
        Self(Map::new())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// String value of a key. Numbers and booleans are rendered as text;
    /// empty strings count as absent.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::String(s) if s.is_empty() => None,
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.0.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => match s.trim() {
                "true" | "1" => Some(true),
                "false" | "0" => Some(false),
                _ => None,
            },
            Value::Number(n) => n.as_i64().map(|v| v != 0),
            _ => None,
        }
    }

    /// The crawl identity carried by `site_`, `projectCode_` and `code_`.
    pub fn identity(&self) -> Option<CrawlKey> {
        Some(CrawlKey::new(
            self.get_str(PARAM_SITE)?,
            self.get_str(PARAM_PROJECT_CODE)?,
            self.get_str(PARAM_CODE)?,
        ))
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

impl From<Map<String, Value>> for ExecutionParams {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl FromIterator<(String, Value)> for ExecutionParams {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Terminal status of a crawl invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResultCode {
    Success,
    Fail,
}

/// Result returned by every handler invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlResult {
    pub code: ResultCode,
    pub message: String,
}

impl CrawlResult {
    pub fn success() -> Self {
        Self {
            code: ResultCode::Success,
            message: String::new(),
        }
    }

    pub fn success_with(message: impl Into<String>) -> Self {
        Self {
            code: ResultCode::Success,
            message: message.into(),
        }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            code: ResultCode::Fail,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == ResultCode::Success
    }
}

/// A named backing store that crawl output is written to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FactDatasource {
    pub code: String,
    pub source_name: String,
    /// Target table, optionally schema-qualified (`main.items`).
    pub table: String,
    pub primary_key: String,
    /// Dialect name understood by [`SqlDialect::by_name`](crate::sql::SqlDialect::by_name).
    pub dialect: String,
}

/// Pagination request plus the result slots filled by
/// [`DataSourceContext::query`](crate::datasource::DataSourceContext::query).
#[derive(Debug, Clone, Default, Serialize)]
pub struct Page {
    pub page_num: u64,
    pub page_size: u64,
    pub need_count: bool,
    pub rows: Vec<Record>,
    /// Only populated when `need_count` is set.
    pub total: Option<i64>,
}

impl Page {
    pub fn new(page_num: u64, page_size: u64, need_count: bool) -> Self {
        Self {
            page_num: page_num.max(1),
            page_size,
            need_count,
            rows: Vec::new(),
            total: None,
        }
    }

    pub fn offset(&self) -> u64 {
        (self.page_num.max(1) - 1) * self.page_size
    }
}

/// Output of a free-form query: a page when pagination was requested.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum QueryResult {
    Page(Page),
    Rows(Vec<Record>),
}

impl QueryResult {
    pub fn rows(&self) -> &[Record] {
        match self {
            QueryResult::Page(page) => &page.rows,
            QueryResult::Rows(rows) => rows,
        }
    }
}

/// What happened to one record in a batch write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RowAction {
    Inserted,
    Updated,
    /// No statement could be built for the record.
    Skipped,
    /// Update matched nothing, insert conflicted and the retried update did
    /// not land either.
    Unresolved,
    /// Update ran but matched no row.
    Missed,
}

/// Per-record result of `insert_batch` / `update_batch` / `upsert_batch`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RowOutcome {
    pub success: bool,
    pub action: RowAction,
}

impl RowOutcome {
    pub fn inserted() -> Self {
        Self {
            success: true,
            action: RowAction::Inserted,
        }
    }

    pub fn updated() -> Self {
        Self {
            success: true,
            action: RowAction::Updated,
        }
    }

    pub fn failed(action: RowAction) -> Self {
        Self {
            success: false,
            action,
        }
    }
}

/// Counters accumulated over one batch write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportStats {
    pub inserted: u64,
    pub updated: u64,
    pub failed: u64,
}

impl ImportStats {
    pub fn from_outcomes(outcomes: &[RowOutcome]) -> Self {
        let mut stats = Self::default();
        for outcome in outcomes {
            stats.record(outcome);
        }
        stats
    }

    pub fn record(&mut self, outcome: &RowOutcome) {
        match (outcome.success, outcome.action) {
            (true, RowAction::Inserted) => self.inserted += 1,
            (true, RowAction::Updated) => self.updated += 1,
            _ => self.failed += 1,
        }
    }

    pub fn merge(&mut self, other: ImportStats) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.failed += other.failed;
    }

    pub fn total(&self) -> u64 {
        self.inserted + self.updated + self.failed
    }
}

impl fmt::Display for ImportStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "inserted {}, updated {}, failed {}",
            self.inserted, self.updated, self.failed
        )
    }
}

/// Milliseconds since the Unix epoch, used for `__triggerTime__`.
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identity_requires_all_three_keys() {
        let params = ExecutionParams::new().with(PARAM_SITE, "x");
        assert!(params.identity().is_none());

        let params = params
            .with(PARAM_PROJECT_CODE, "p")
            .with(PARAM_CODE, "c");
        let key = params.identity().unwrap();
        assert_eq!(key.local_code(), "x_p_c");
    }

    #[test]
    fn empty_identity_value_counts_as_missing() {
        let params = ExecutionParams::new()
            .with(PARAM_SITE, "x")
            .with(PARAM_PROJECT_CODE, "")
            .with(PARAM_CODE, "c");
        assert!(params.identity().is_none());
    }

    #[test]
    fn numeric_params_render_as_text() {
        let params = ExecutionParams::new().with("n", json!(42)).with("b", true);
        assert_eq!(params.get_str("n").as_deref(), Some("42"));
        assert_eq!(params.get_u64("n"), Some(42));
        assert_eq!(params.get_bool("b"), Some(true));
    }

    #[test]
    fn crawl_type_parses_uppercase() {
        let t: CrawlType = serde_json::from_value(json!("BATCH")).unwrap();
        assert_eq!(t, CrawlType::Batch);
        assert_eq!(CrawlType::Custom.to_string(), "CUSTOM");
    }

    #[test]
    fn stats_count_outcomes() {
        let stats = ImportStats::from_outcomes(&[
            RowOutcome::inserted(),
            RowOutcome::updated(),
            RowOutcome::updated(),
            RowOutcome::failed(RowAction::Unresolved),
        ]);
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.updated, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total(), 4);
    }

    #[test]
    fn page_offset() {
        assert_eq!(Page::new(1, 20, false).offset(), 0);
        assert_eq!(Page::new(3, 20, false).offset(), 40);
        assert_eq!(Page::new(0, 20, false).page_num, 1);
    }
}
