//! Raw statement execution.
//!
//! A [`Dao`] runs a [`SqlWrap`] against one physical source and reports
//! driver failures as [`DaoError`]. It knows nothing about tables, keys or
//! retries; [`DataSourceContext`](crate::datasource::DataSourceContext)
//! layers those on top and turns every `DaoError` into
//! [`FdError::Execute`](crate::error::FdError::Execute).

use async_trait::async_trait;
use serde_json::Value;
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqlitePool, SqliteRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};

use crate::error::DaoError;
use crate::models::Record;
use crate::sql::placeholder::to_positional;
use crate::sql::{SqlDialect, SqlValue, SqlWrap};

/// Statement executor for one source.
#[async_trait]
pub trait Dao: Send + Sync {
    /// First column of the first row as an integer. `None` when the query
    /// returns no row or a NULL.
    async fn select_num(&self, wrap: &SqlWrap) -> Result<Option<i64>, DaoError>;

    async fn select_all(&self, wrap: &SqlWrap) -> Result<Vec<Record>, DaoError>;

    /// Row count produced by a `COUNT` query; zero when it yields nothing.
    async fn select_total(&self, wrap: &SqlWrap) -> Result<i64, DaoError> {
        Ok(self.select_num(wrap).await?.unwrap_or(0))
    }

    /// Run a write statement and return the affected row count.
    async fn execute(&self, wrap: &SqlWrap) -> Result<u64, DaoError>;

    /// Name of the SQL dialect this source speaks. Fact datasources on the
    /// source must be generated for the same dialect.
    fn dialect_name(&self) -> &str {
        "sqlite"
    }
}

/// [`Dao`] over a sqlx SQLite pool.
pub struct SqliteDao {
    pool: SqlitePool,
    dialect: SqlDialect,
}

impl SqliteDao {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            dialect: SqlDialect::sqlite(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn prepare(&self, wrap: &SqlWrap) -> Result<(String, Vec<SqlValue>), DaoError> {
        to_positional(&wrap.sql, &wrap.params, self.dialect.placeholder_style)
            .map_err(|e| DaoError::driver(e.to_string()))
    }
}

fn bind_values<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    values: Vec<SqlValue>,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for value in values {
        query = match value {
            SqlValue::Null => query.bind(Option::<String>::None),
            SqlValue::Bool(b) => query.bind(b),
            SqlValue::Int(i) => query.bind(i),
            SqlValue::Float(f) => query.bind(f),
            SqlValue::Text(s) => query.bind(s),
        };
    }
    query
}

fn row_to_record(row: &SqliteRow) -> Result<Record, DaoError> {
    let mut record = Record::new();
    for column in row.columns() {
        let idx = column.ordinal();
        let (is_null, type_name) = {
            let raw = row.try_get_raw(idx)?;
            (raw.is_null(), raw.type_info().name().to_string())
        };
        let value = if is_null {
            Value::Null
        } else {
            match type_name.as_str() {
                "INTEGER" => Value::from(row.try_get::<i64, _>(idx)?),
                "REAL" => serde_json::Number::from_f64(row.try_get::<f64, _>(idx)?)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
                "BOOLEAN" => Value::Bool(row.try_get::<bool, _>(idx)?),
                "BLOB" => Value::String(hex::encode(row.try_get::<Vec<u8>, _>(idx)?)),
                _ => Value::String(row.try_get_unchecked::<String, _>(idx)?),
            }
        };
        record.insert(column.name().to_string(), value);
    }
    Ok(record)
}

#[async_trait]
impl Dao for SqliteDao {
    async fn select_num(&self, wrap: &SqlWrap) -> Result<Option<i64>, DaoError> {
        let (sql, values) = self.prepare(wrap)?;
        let row = bind_values(sqlx::query(&sql), values)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        if row.try_get_raw(0)?.is_null() {
            return Ok(None);
        }
        Ok(Some(row.try_get::<i64, _>(0)?))
    }

    async fn select_all(&self, wrap: &SqlWrap) -> Result<Vec<Record>, DaoError> {
        let (sql, values) = self.prepare(wrap)?;
        let rows = bind_values(sqlx::query(&sql), values)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn execute(&self, wrap: &SqlWrap) -> Result<u64, DaoError> {
        let (sql, values) = self.prepare(wrap)?;
        let result = bind_values(sqlx::query(&sql), values)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    fn dialect_name(&self) -> &str {
        &self.dialect.name
    }
}
