//! Fact datasource access.
//!
//! A [`DataSourceContext`] binds one [`FactDatasource`] (table, primary key,
//! dialect) to the [`Dao`] of its physical source. Every operation marks the
//! source active in the execution context for the duration of the
//! statement, and every driver failure leaves as [`FdError::Execute`] with
//! the SQL text and source name attached.
//!
//! # Write semantics
//!
//! | Operation | Per record | Retries |
//! |-----------|------------|---------|
//! | [`insert_batch`](DataSourceContext::insert_batch) | INSERT | 1 attempt + `insert_retries`, then error |
//! | [`update_batch`](DataSourceContext::update_batch) | UPDATE by primary key; success when a row changed | none |
//! | [`upsert_batch`](DataSourceContext::upsert_batch) | UPDATE, then INSERT when nothing matched, then one more UPDATE if the INSERT failed | one |
//!
//! Records for which no statement can be built are skipped with a warning
//! and reported as [`RowAction::Skipped`].

use anyhow::{Context, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::config::Config;
use crate::context::ActiveSourceGuard;
use crate::dao::{Dao, SqliteDao};
use crate::db;
use crate::error::{DaoError, FdError};
use crate::models::{
    ExecutionParams, FactDatasource, Page, QueryResult, Record, RowAction, RowOutcome,
    PARAM_NEED_COUNT, PARAM_PAGE_NUM, PARAM_PAGE_SIZE,
};
use crate::sql::placeholder::render_query;
use crate::sql::{ConditionGroup, SqlDialect, SqlGenerator, SqlWrap};

pub const DEFAULT_INSERT_RETRIES: u32 = 5;
pub const DEFAULT_PAGE_SIZE: u64 = 20;

/// Operations on one fact datasource.
pub struct DataSourceContext {
    fd: FactDatasource,
    dao: Arc<dyn Dao>,
    generator: SqlGenerator,
    insert_retries: u32,
}

impl DataSourceContext {
    pub fn new(fd: FactDatasource, dao: Arc<dyn Dao>, generator: SqlGenerator) -> Self {
        Self {
            fd,
            dao,
            generator,
            insert_retries: DEFAULT_INSERT_RETRIES,
        }
    }

    pub fn with_insert_retries(mut self, retries: u32) -> Self {
        self.insert_retries = retries;
        self
    }

    pub fn datasource(&self) -> &FactDatasource {
        &self.fd
    }

    pub fn generator(&self) -> &SqlGenerator {
        &self.generator
    }

    fn execute_error(&self, wrap: &SqlWrap, err: DaoError) -> FdError {
        FdError::execute(&self.fd.source_name, &wrap.sql, err.to_string())
    }

    async fn select_num(&self, wrap: &SqlWrap) -> Result<Option<i64>, FdError> {
        let _active = ActiveSourceGuard::enter(&self.fd.source_name);
        self.dao
            .select_num(wrap)
            .await
            .map_err(|e| self.execute_error(wrap, e))
    }

    async fn select_all(&self, wrap: &SqlWrap) -> Result<Vec<Record>, FdError> {
        let _active = ActiveSourceGuard::enter(&self.fd.source_name);
        self.dao
            .select_all(wrap)
            .await
            .map_err(|e| self.execute_error(wrap, e))
    }

    async fn select_total(&self, wrap: &SqlWrap) -> Result<i64, FdError> {
        let _active = ActiveSourceGuard::enter(&self.fd.source_name);
        self.dao
            .select_total(wrap)
            .await
            .map_err(|e| self.execute_error(wrap, e))
    }

    /// Execute without translating the driver error, for callers that
    /// branch on failure.
    async fn execute_raw(&self, wrap: &SqlWrap) -> Result<u64, DaoError> {
        let _active = ActiveSourceGuard::enter(&self.fd.source_name);
        self.dao.execute(wrap).await
    }

    async fn execute(&self, wrap: &SqlWrap) -> Result<u64, FdError> {
        self.execute_raw(wrap)
            .await
            .map_err(|e| self.execute_error(wrap, e))
    }

    // ── Reads ──────────────────────────────────────────────────────────

    /// Number of rows in the table.
    pub async fn size(&self) -> Result<i64, FdError> {
        let wrap = self.generator.size(&self.fd.table)?;
        Ok(self.select_num(&wrap).await?.unwrap_or(0))
    }

    /// True when the table holds no row. Uses `EXISTS` where the dialect
    /// has it, a full count otherwise.
    pub async fn is_empty(&self) -> Result<bool, FdError> {
        match self.generator.exists(&self.fd.table)? {
            Some(wrap) => Ok(self.select_num(&wrap).await?.unwrap_or(0) == 0),
            None => Ok(self.size().await? <= 0),
        }
    }

    /// Up to `size` rows; every row when `size` is zero.
    pub async fn collect(&self, size: u64) -> Result<Vec<Record>, FdError> {
        let limit = (size > 0).then_some(size);
        let wrap = self
            .generator
            .select_page(&self.fd.table, None, limit, None)?;
        self.select_all(&wrap).await
    }

    /// Up to `size` rows matching the condition groups.
    pub async fn collect_conditions(
        &self,
        size: u64,
        groups: &[ConditionGroup],
    ) -> Result<Vec<Record>, FdError> {
        let limit = (size > 0).then_some(size);
        let wrap = self
            .generator
            .select_page(&self.fd.table, Some(groups), limit, None)?;
        self.select_all(&wrap).await
    }

    /// Run a free-form query template.
    ///
    /// `${key}` is replaced by the parameter's literal text and `#{key}`
    /// becomes a bound `:key`. When `pageNum_` or `pageSize_` is present the
    /// result is a [`Page`]; its total is only counted when `needCount_` is
    /// true.
    pub async fn query(&self, sql: &str, params: &ExecutionParams) -> Result<QueryResult, FdError> {
        let wrap = render_query(sql, params.as_map())?;

        let paged = params.contains_key(PARAM_PAGE_NUM) || params.contains_key(PARAM_PAGE_SIZE);
        if !paged {
            return Ok(QueryResult::Rows(self.select_all(&wrap).await?));
        }

        let mut page = Page::new(
            params.get_u64(PARAM_PAGE_NUM).unwrap_or(1),
            params
                .get_u64(PARAM_PAGE_SIZE)
                .filter(|s| *s > 0)
                .unwrap_or(DEFAULT_PAGE_SIZE),
            params.get_bool(PARAM_NEED_COUNT).unwrap_or(false),
        );
        let paged_wrap = self
            .generator
            .paginate(&wrap, page.page_size, page.offset());
        page.rows = self.select_all(&paged_wrap).await?;
        if page.need_count {
            page.total = Some(self.select_total(&self.generator.count_of(&wrap)).await?);
        }
        Ok(QueryResult::Page(page))
    }

    // ── Writes ─────────────────────────────────────────────────────────

    /// Insert every record, retrying each failed insert up to
    /// `insert_retries` times. A record that still fails aborts the batch.
    pub async fn insert_batch(&self, records: &[Record]) -> Result<Vec<RowOutcome>, FdError> {
        let mut outcomes = Vec::with_capacity(records.len());

        for record in records {
            let wrap = match self.generator.insert(&self.fd.table, record) {
                Ok(wrap) => wrap,
                Err(e) => {
                    tracing::warn!(fd = %self.fd.code, error = %e, "skipping record without insertable columns");
                    outcomes.push(RowOutcome::failed(RowAction::Skipped));
                    continue;
                }
            };

            let mut attempt = 0;
            loop {
                match self.execute_raw(&wrap).await {
                    Ok(_) => {
                        outcomes.push(RowOutcome::inserted());
                        break;
                    }
                    Err(e) if attempt < self.insert_retries => {
                        attempt += 1;
                        tracing::warn!(
                            fd = %self.fd.code,
                            attempt,
                            error = %e,
                            "insert failed, retrying"
                        );
                    }
                    Err(e) => {
                        return Err(FdError::execute(
                            &self.fd.source_name,
                            &wrap.sql,
                            format!(
                                "insert data into {} error, retried {} times: {}",
                                self.fd.table, self.insert_retries, e
                            ),
                        ));
                    }
                }
            }
        }

        Ok(outcomes)
    }

    /// Update each record by primary key, setting its non-null fields.
    pub async fn update_batch(&self, records: &[Record]) -> Result<Vec<RowOutcome>, FdError> {
        let mut outcomes = Vec::with_capacity(records.len());

        for record in records {
            let wrap = match self
                .generator
                .update_by_key(&self.fd.table, &self.fd.primary_key, record)
            {
                Ok(wrap) => wrap,
                Err(e) => {
                    tracing::warn!(fd = %self.fd.code, error = %e, "skipping record that cannot be updated");
                    outcomes.push(RowOutcome::failed(RowAction::Skipped));
                    continue;
                }
            };

            let affected = self.execute(&wrap).await?;
            outcomes.push(if affected > 0 {
                RowOutcome::updated()
            } else {
                RowOutcome::failed(RowAction::Missed)
            });
        }

        Ok(outcomes)
    }

    /// Update each record, inserting it when the update matched nothing.
    ///
    /// When the insert fails (typically a concurrent writer inserted the
    /// same key in between) the update is retried exactly once. If that
    /// retry changes nothing the record is reported as
    /// [`RowAction::Unresolved`]. Errors from the update path are returned
    /// immediately.
    pub async fn upsert_batch(&self, records: &[Record]) -> Result<Vec<RowOutcome>, FdError> {
        let mut outcomes = Vec::with_capacity(records.len());

        for record in records {
            let update = match self
                .generator
                .update_by_key(&self.fd.table, &self.fd.primary_key, record)
            {
                Ok(wrap) => Some(wrap),
                Err(e) => {
                    tracing::debug!(fd = %self.fd.code, error = %e, "no update possible, inserting");
                    None
                }
            };

            if let Some(update) = &update {
                if self.execute(update).await? > 0 {
                    outcomes.push(RowOutcome::updated());
                    continue;
                }
            }

            let insert = match self.generator.insert(&self.fd.table, record) {
                Ok(wrap) => wrap,
                Err(e) => {
                    tracing::warn!(fd = %self.fd.code, error = %e, "skipping record without insertable columns");
                    outcomes.push(RowOutcome::failed(RowAction::Skipped));
                    continue;
                }
            };

            let insert_err = match self.execute_raw(&insert).await {
                Ok(_) => {
                    outcomes.push(RowOutcome::inserted());
                    continue;
                }
                Err(e) => e,
            };

            let Some(update) = &update else {
                return Err(self.execute_error(&insert, insert_err));
            };

            tracing::warn!(fd = %self.fd.code, error = %insert_err, "insert after empty update failed, retrying update");
            match self.execute_raw(update).await {
                Ok(affected) if affected > 0 => outcomes.push(RowOutcome::updated()),
                Ok(_) => {
                    tracing::warn!(fd = %self.fd.code, "retried update matched no row");
                    outcomes.push(RowOutcome::failed(RowAction::Unresolved));
                }
                Err(e) => {
                    tracing::warn!(fd = %self.fd.code, error = %e, "retried update failed");
                    outcomes.push(RowOutcome::failed(RowAction::Unresolved));
                }
            }
        }

        Ok(outcomes)
    }

    /// Remove every row.
    pub async fn delete_all(&self) -> Result<u64, FdError> {
        let wrap = self.generator.delete_all(&self.fd.table)?;
        self.execute(&wrap).await
    }

    /// Remove the rows matching a raw SQL predicate.
    pub async fn delete(&self, predicate: &str) -> Result<u64, FdError> {
        let wrap = self.generator.delete_where(&self.fd.table, predicate)?;
        self.execute(&wrap).await
    }

    /// Remove the rows matching the condition groups.
    pub async fn delete_conditions(&self, groups: &[ConditionGroup]) -> Result<u64, FdError> {
        let wrap = self.generator.delete_conditions(&self.fd.table, groups)?;
        self.execute(&wrap).await
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Resolves fact datasource codes to [`DataSourceContext`]s.
pub struct DataSourceRegistry {
    datasources: BTreeMap<String, FactDatasource>,
    daos: HashMap<String, Arc<dyn Dao>>,
    insert_retries: u32,
}

impl DataSourceRegistry {
    pub fn new(insert_retries: u32) -> Self {
        Self {
            datasources: BTreeMap::new(),
            daos: HashMap::new(),
            insert_retries,
        }
    }

    /// Open a pool for every `[sources.<name>]` and register every
    /// `[datasources.<code>]`.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Self::new(config.execution.insert_retries);
        for (name, source) in &config.sources {
            let pool = db::connect_source(source)
                .await
                .with_context(|| format!("Failed to connect source '{}'", name))?;
            registry.register_source(name, Arc::new(SqliteDao::new(pool)));
        }
        for (code, ds) in &config.datasources {
            registry.register_datasource(ds.to_fact_datasource(code));
        }
        Ok(registry)
    }

    pub fn register_source(&mut self, name: &str, dao: Arc<dyn Dao>) {
        self.daos.insert(name.to_string(), dao);
    }

    pub fn register_datasource(&mut self, fd: FactDatasource) {
        self.datasources.insert(fd.code.clone(), fd);
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.datasources.keys().map(String::as_str)
    }

    /// Build the context for `fd_code`. Unknown codes, unknown sources,
    /// unknown dialects and a dialect the source does not speak are illegal
    /// arguments.
    pub fn context(&self, fd_code: &str) -> Result<DataSourceContext, FdError> {
        let fd = self
            .datasources
            .get(fd_code)
            .ok_or_else(|| FdError::illegal(format!("unknown fact datasource '{}'", fd_code)))?;
        let dao = self.daos.get(&fd.source_name).ok_or_else(|| {
            FdError::illegal(format!(
                "fact datasource '{}' refers to unknown source '{}'",
                fd_code, fd.source_name
            ))
        })?;
        let dialect = SqlDialect::by_name(&fd.dialect).ok_or_else(|| {
            FdError::illegal(format!(
                "fact datasource '{}' has unknown dialect '{}'",
                fd_code, fd.dialect
            ))
        })?;
        if dialect.name != dao.dialect_name() {
            return Err(FdError::illegal(format!(
                "fact datasource '{}' uses dialect '{}' but source '{}' speaks '{}'",
                fd_code,
                dialect.name,
                fd.source_name,
                dao.dialect_name()
            )));
        }
        Ok(
            DataSourceContext::new(fd.clone(), dao.clone(), SqlGenerator::new(dialect))
                .with_insert_retries(self.insert_retries),
        )
    }
}
