//! Statement builders.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::condition::{render_predicate, ConditionGroup};
use super::{SqlDialect, SqlValue, SqlWrap};
use crate::error::FdError;
use crate::models::Record;

/// Builds dialect-specific statements. Holds no per-call state.
#[derive(Debug, Clone)]
pub struct SqlGenerator {
    dialect: Arc<SqlDialect>,
}

impl SqlGenerator {
    pub fn new(dialect: SqlDialect) -> Self {
        Self {
            dialect: Arc::new(dialect),
        }
    }

    pub fn dialect(&self) -> &SqlDialect {
        &self.dialect
    }

    fn table(&self, table: &str) -> Result<String, FdError> {
        self.dialect
            .quote_identifier(table)
            .ok_or_else(|| FdError::generate(table, "invalid table name"))
    }

    /// `SELECT COUNT(1) FROM t`
    pub fn size(&self, table: &str) -> Result<SqlWrap, FdError> {
        Ok(SqlWrap::new(format!("SELECT COUNT(1) FROM {}", self.table(table)?)))
    }

    /// `SELECT EXISTS(SELECT 1 FROM t)`, or `None` when the dialect has no EXISTS.
    pub fn exists(&self, table: &str) -> Result<Option<SqlWrap>, FdError> {
        if !self.dialect.supports_exists {
            return Ok(None);
        }
        Ok(Some(SqlWrap::new(format!(
            "SELECT EXISTS(SELECT 1 FROM {})",
            self.table(table)?
        ))))
    }

    /// `SELECT * FROM t [WHERE ...] [LIMIT n [OFFSET m]]`
    pub fn select_page(
        &self,
        table: &str,
        groups: Option<&[ConditionGroup]>,
        limit: Option<u64>,
        offset: Option<u64>,
    ) -> Result<SqlWrap, FdError> {
        let mut params = BTreeMap::new();
        let mut sql = format!("SELECT * FROM {}", self.table(table)?);
        if let Some(groups) = groups {
            if let Some(predicate) = render_predicate(groups, &self.dialect, table, &mut params)? {
                sql.push_str(" WHERE ");
                sql.push_str(&predicate);
            }
        }
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
            if let Some(offset) = offset.filter(|o| *o > 0) {
                sql.push_str(&format!(" OFFSET {}", offset));
            }
        }
        Ok(SqlWrap::with_params(sql, params))
    }

    /// Wrap an arbitrary query so only one page of it is returned.
    pub fn paginate(&self, wrap: &SqlWrap, limit: u64, offset: u64) -> SqlWrap {
        SqlWrap::with_params(
            format!(
                "SELECT * FROM ({}) AS page_ LIMIT {} OFFSET {}",
                wrap.sql, limit, offset
            ),
            wrap.params.clone(),
        )
    }

    /// Wrap an arbitrary query into a row count.
    pub fn count_of(&self, wrap: &SqlWrap) -> SqlWrap {
        SqlWrap::with_params(
            format!("SELECT COUNT(1) FROM ({}) AS count_", wrap.sql),
            wrap.params.clone(),
        )
    }

    /// `INSERT INTO t (cols) VALUES (:cols)` over every non-null field.
    ///
    /// Fields whose names are not plain identifiers are ignored. Fails when
    /// no column remains.
    pub fn insert(&self, table: &str, record: &Record) -> Result<SqlWrap, FdError> {
        let table_sql = self.table(table)?;
        let mut columns = Vec::new();
        let mut markers = Vec::new();
        let mut params = BTreeMap::new();

        for (field, value) in record {
            if value.is_null() {
                continue;
            }
            let Some(column) = self.dialect.quote_identifier(field) else {
                tracing::debug!(table, field = %field, "skipping field that is not a column name");
                continue;
            };
            if field.contains('.') {
                continue;
            }
            columns.push(column);
            markers.push(format!(":{}", field));
            params.insert(field.clone(), SqlValue::from_json(value));
        }

        if columns.is_empty() {
            return Err(FdError::generate(table, "no valid columns to insert"));
        }

        Ok(SqlWrap::with_params(
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                table_sql,
                columns.join(", "),
                markers.join(", ")
            ),
            params,
        ))
    }

    /// `UPDATE t SET ... WHERE pk = :pk`, setting every non-null field
    /// except the key.
    pub fn update_by_key(
        &self,
        table: &str,
        primary_key: &str,
        record: &Record,
    ) -> Result<SqlWrap, FdError> {
        let table_sql = self.table(table)?;
        let key_column = self
            .dialect
            .quote_identifier(primary_key)
            .ok_or_else(|| FdError::generate(table, "invalid primary key name"))?;
        let key_value = record
            .get(primary_key)
            .filter(|v| !v.is_null())
            .ok_or_else(|| {
                FdError::generate(table, format!("primary key '{}' is missing", primary_key))
            })?;

        let mut params = BTreeMap::new();
        let mut assignments = Vec::new();
        for (field, value) in record {
            if field == primary_key || value.is_null() || field.contains('.') {
                continue;
            }
            let Some(column) = self.dialect.quote_identifier(field) else {
                continue;
            };
            assignments.push(format!("{} = :{}", column, field));
            params.insert(field.clone(), SqlValue::from_json(value));
        }

        if assignments.is_empty() {
            return Err(FdError::generate(table, "no columns to update"));
        }

        // The key binds as `__pk` unless a record field already uses the name.
        let mut key_param = "__pk".to_string();
        while params.contains_key(&key_param) {
            key_param.push('_');
        }
        let sql = format!(
            "UPDATE {} SET {} WHERE {} = :{}",
            table_sql,
            assignments.join(", "),
            key_column,
            key_param
        );
        params.insert(key_param, SqlValue::from_json(key_value));
        Ok(SqlWrap::with_params(sql, params))
    }

    /// Remove every row: `TRUNCATE TABLE` where supported, `DELETE FROM` otherwise.
    pub fn delete_all(&self, table: &str) -> Result<SqlWrap, FdError> {
        let table_sql = self.table(table)?;
        Ok(SqlWrap::new(if self.dialect.supports_truncate {
            format!("TRUNCATE TABLE {}", table_sql)
        } else {
            format!("DELETE FROM {}", table_sql)
        }))
    }

    /// `DELETE FROM t WHERE <predicate>` with a caller-supplied predicate.
    pub fn delete_where(&self, table: &str, predicate: &str) -> Result<SqlWrap, FdError> {
        if predicate.trim().is_empty() {
            return Err(FdError::illegal("delete predicate must not be empty"));
        }
        Ok(SqlWrap::new(format!(
            "DELETE FROM {} WHERE {}",
            self.table(table)?,
            predicate.trim()
        )))
    }

    /// `DELETE FROM t WHERE <condition groups>`. Refuses an empty filter.
    pub fn delete_conditions(
        &self,
        table: &str,
        groups: &[ConditionGroup],
    ) -> Result<SqlWrap, FdError> {
        let table_sql = self.table(table)?;
        let mut params = BTreeMap::new();
        let predicate = render_predicate(groups, &self.dialect, table, &mut params)?
            .ok_or_else(|| FdError::illegal("refusing to delete without conditions"))?;
        Ok(SqlWrap::with_params(
            format!("DELETE FROM {} WHERE {}", table_sql, predicate),
            params,
        ))
    }
}

impl Default for SqlGenerator {
    fn default() -> Self {
        Self::new(SqlDialect::sqlite())
    }
}
