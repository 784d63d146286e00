//! Integration tests for fact datasource writes and reads.
//!
//! Retry and fallback rules are checked against a scripted DAO that replays
//! canned results; query and paging behaviour against a real SQLite file.

use async_trait::async_trait;
use ficus::config::SourceConfig;
use ficus::context;
use ficus::dao::{Dao, SqliteDao};
use ficus::datasource::{DataSourceContext, DataSourceRegistry};
use ficus::db;
use ficus::error::{DaoError, FdError};
use ficus::models::{
    ExecutionParams, FactDatasource, QueryResult, Record, RowAction, RowOutcome,
};
use ficus::sql::{Condition, ConditionGroup, Operator, SqlDialect, SqlGenerator, SqlWrap};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

// ─── Scripted DAO ───────────────────────────────────────────────────

/// Replays queued results per statement kind; records every statement and
/// the active-source marker seen while it ran. Empty queues answer `Ok(1)`.
#[derive(Default)]
struct ScriptedDao {
    updates: Mutex<VecDeque<Result<u64, String>>>,
    inserts: Mutex<VecDeque<Result<u64, String>>>,
    statements: Mutex<Vec<String>>,
    active_sources: Mutex<Vec<Option<String>>>,
    dialect: Option<&'static str>,
}

impl ScriptedDao {
    fn with_updates(self, results: Vec<Result<u64, String>>) -> Self {
        *self.updates.lock().unwrap() = results.into();
        self
    }

    fn with_inserts(self, results: Vec<Result<u64, String>>) -> Self {
        *self.inserts.lock().unwrap() = results.into();
        self
    }

    fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.statements()
            .iter()
            .filter(|s| s.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl Dao for ScriptedDao {
    async fn select_num(&self, wrap: &SqlWrap) -> Result<Option<i64>, DaoError> {
        self.statements.lock().unwrap().push(wrap.sql.clone());
        Ok(Some(0))
    }

    async fn select_all(&self, wrap: &SqlWrap) -> Result<Vec<Record>, DaoError> {
        self.statements.lock().unwrap().push(wrap.sql.clone());
        Ok(Vec::new())
    }

    async fn execute(&self, wrap: &SqlWrap) -> Result<u64, DaoError> {
        self.statements.lock().unwrap().push(wrap.sql.clone());
        self.active_sources
            .lock()
            .unwrap()
            .push(context::active_source());

        let queue = if wrap.sql.starts_with("UPDATE") {
            &self.updates
        } else {
            &self.inserts
        };
        match queue.lock().unwrap().pop_front() {
            Some(Ok(n)) => Ok(n),
            Some(Err(message)) => Err(DaoError::driver(message)),
            None => Ok(1),
        }
    }

    fn dialect_name(&self) -> &str {
        self.dialect.unwrap_or("sqlite")
    }
}

fn items_fd() -> FactDatasource {
    FactDatasource {
        code: "items".into(),
        source_name: "warehouse".into(),
        table: "items".into(),
        primary_key: "id".into(),
        dialect: "sqlite".into(),
    }
}

fn scripted(dao: ScriptedDao) -> (Arc<ScriptedDao>, DataSourceContext) {
    let dao = Arc::new(dao);
    let ctx = DataSourceContext::new(
        items_fd(),
        dao.clone(),
        SqlGenerator::new(SqlDialect::sqlite()),
    );
    (dao, ctx)
}

fn record(id: i64, name: &str) -> Record {
    match json!({ "id": id, "name": name }) {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

fn failures(n: usize) -> Vec<Result<u64, String>> {
    (0..n).map(|i| Err(format!("database is locked ({})", i))).collect()
}

// ─── Insert retries ─────────────────────────────────────────────────

#[tokio::test]
async fn insert_succeeds_after_four_failures() {
    let (dao, ctx) = scripted(ScriptedDao::default().with_inserts(failures(4)));

    let outcomes = ctx.insert_batch(&[record(1, "a")]).await.unwrap();

    assert_eq!(outcomes, vec![RowOutcome::inserted()]);
    assert_eq!(dao.count("INSERT"), 5);
}

#[tokio::test]
async fn insert_gives_up_after_five_retries() {
    let (dao, ctx) = scripted(ScriptedDao::default().with_inserts(failures(10)));

    let err = ctx.insert_batch(&[record(1, "a")]).await.unwrap_err();

    assert!(err.is_execute());
    let message = err.to_string();
    assert!(message.contains("retried 5 times"), "{}", message);
    assert!(message.contains("warehouse"), "{}", message);
    assert!(message.contains("INSERT INTO items"), "{}", message);
    assert_eq!(dao.count("INSERT"), 6);
}

#[tokio::test]
async fn insert_retry_count_is_configurable() {
    let dao = Arc::new(ScriptedDao::default().with_inserts(failures(10)));
    let ctx = DataSourceContext::new(
        items_fd(),
        dao.clone(),
        SqlGenerator::new(SqlDialect::sqlite()),
    )
    .with_insert_retries(2);

    let err = ctx.insert_batch(&[record(1, "a")]).await.unwrap_err();
    assert!(err.to_string().contains("retried 2 times"));
    assert_eq!(dao.count("INSERT"), 3);
}

#[tokio::test]
async fn insert_skips_records_without_columns() {
    let (dao, ctx) = scripted(ScriptedDao::default());
    let mut empty = Record::new();
    empty.insert("nothing".into(), Value::Null);

    let outcomes = ctx.insert_batch(&[empty, record(2, "b")]).await.unwrap();

    assert_eq!(
        outcomes,
        vec![RowOutcome::failed(RowAction::Skipped), RowOutcome::inserted()]
    );
    assert_eq!(dao.count("INSERT"), 1);
}

// ─── Upsert fallback ────────────────────────────────────────────────

#[tokio::test]
async fn upsert_update_hit_does_not_insert() {
    let (dao, ctx) = scripted(ScriptedDao::default().with_updates(vec![Ok(1)]));

    let outcomes = ctx.upsert_batch(&[record(1, "a")]).await.unwrap();

    assert_eq!(outcomes, vec![RowOutcome::updated()]);
    assert_eq!(dao.count("UPDATE"), 1);
    assert_eq!(dao.count("INSERT"), 0);
}

#[tokio::test]
async fn upsert_inserts_when_update_misses() {
    let (dao, ctx) = scripted(ScriptedDao::default().with_updates(vec![Ok(0)]));

    let outcomes = ctx.upsert_batch(&[record(1, "a")]).await.unwrap();

    assert_eq!(outcomes, vec![RowOutcome::inserted()]);
    assert_eq!(dao.count("INSERT"), 1);
}

#[tokio::test]
async fn upsert_retries_update_once_after_insert_conflict() {
    let (dao, ctx) = scripted(
        ScriptedDao::default()
            .with_updates(vec![Ok(0), Ok(1)])
            .with_inserts(vec![Err("UNIQUE constraint failed: items.id".into())]),
    );

    let outcomes = ctx.upsert_batch(&[record(1, "a")]).await.unwrap();

    assert_eq!(outcomes, vec![RowOutcome::updated()]);
    assert_eq!(dao.count("UPDATE"), 2);
    assert_eq!(dao.count("INSERT"), 1);
}

#[tokio::test]
async fn upsert_reports_unresolved_when_retry_misses() {
    let (dao, ctx) = scripted(
        ScriptedDao::default()
            .with_updates(vec![Ok(0), Ok(0)])
            .with_inserts(vec![Err("UNIQUE constraint failed: items.id".into())]),
    );

    let outcomes = ctx.upsert_batch(&[record(1, "a")]).await.unwrap();

    assert_eq!(outcomes, vec![RowOutcome::failed(RowAction::Unresolved)]);
    assert!(!outcomes[0].success);
    assert_eq!(dao.count("UPDATE"), 2);
}

#[tokio::test]
async fn upsert_update_error_is_raised_immediately() {
    let (dao, ctx) = scripted(
        ScriptedDao::default().with_updates(vec![Err("no such column: name".into())]),
    );

    let err = ctx
        .upsert_batch(&[record(1, "a"), record(2, "b")])
        .await
        .unwrap_err();

    assert!(matches!(err, FdError::Execute { .. }));
    assert!(err.to_string().contains("no such column"));
    assert_eq!(dao.count("INSERT"), 0);
    assert_eq!(dao.statements().len(), 1);
}

#[tokio::test]
async fn registry_ties_datasource_dialect_to_its_source() {
    let analytics = Arc::new(ScriptedDao {
        dialect: Some("postgres"),
        ..Default::default()
    });
    let warehouse = Arc::new(ScriptedDao::default());
    let mut registry = DataSourceRegistry::new(5);
    registry.register_source("analytics", analytics.clone());
    registry.register_source("warehouse", warehouse.clone());
    for (code, source, dialect) in [
        ("events", "analytics", "postgres"),
        ("items", "warehouse", "sqlite"),
        ("misplaced", "warehouse", "postgres"),
    ] {
        registry.register_datasource(FactDatasource {
            code: code.into(),
            source_name: source.into(),
            table: code.into(),
            primary_key: "id".into(),
            dialect: dialect.into(),
        });
    }

    registry.context("events").unwrap().delete_all().await.unwrap();
    registry.context("items").unwrap().delete_all().await.unwrap();
    assert_eq!(analytics.statements(), vec!["TRUNCATE TABLE events"]);
    assert_eq!(warehouse.statements(), vec!["DELETE FROM items"]);

    match registry.context("misplaced") {
        Err(FdError::IllegalArgument(message)) => {
            assert!(message.contains("postgres"), "{}", message);
            assert!(message.contains("warehouse"), "{}", message);
        }
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("dialect mismatch was accepted"),
    }
}

#[tokio::test]
async fn active_source_is_marked_per_statement() {
    let (dao, ctx) = scripted(ScriptedDao::default().with_updates(vec![Ok(0)]));

    context::scope(async {
        ctx.upsert_batch(&[record(1, "a")]).await.unwrap();
        assert_eq!(context::active_source(), None);
    })
    .await;

    let seen = dao.active_sources.lock().unwrap().clone();
    assert_eq!(seen.len(), 2);
    assert!(seen.iter().all(|s| s.as_deref() == Some("warehouse")));
}

// ─── SQLite end to end ──────────────────────────────────────────────

async fn sqlite_context(tmp: &TempDir) -> DataSourceContext {
    let pool = db::connect_source(&SourceConfig {
        path: tmp.path().join("warehouse.sqlite"),
        max_connections: 1,
    })
    .await
    .unwrap();
    sqlx::query("CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT, price REAL, tags TEXT)")
        .execute(&pool)
        .await
        .unwrap();

    DataSourceContext::new(
        items_fd(),
        Arc::new(SqliteDao::new(pool)),
        SqlGenerator::new(SqlDialect::sqlite()),
    )
}

fn priced(id: i64, name: &str, price: f64) -> Record {
    match json!({ "id": id, "name": name, "price": price, "tags": ["x", "ü"] }) {
        Value::Object(map) => map,
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn sqlite_upsert_then_query_pages() {
    let tmp = TempDir::new().unwrap();
    let ctx = sqlite_context(&tmp).await;

    assert!(ctx.is_empty().await.unwrap());

    let records: Vec<Record> = (1..=5)
        .map(|i| priced(i, &format!("item-{}", i), i as f64 * 1.5))
        .collect();
    let outcomes = ctx.upsert_batch(&records).await.unwrap();
    assert!(outcomes.iter().all(|o| o.action == RowAction::Inserted));

    // Second pass updates in place.
    let outcomes = ctx.upsert_batch(&records[..2]).await.unwrap();
    assert!(outcomes.iter().all(|o| o.action == RowAction::Updated));

    assert_eq!(ctx.size().await.unwrap(), 5);
    assert!(!ctx.is_empty().await.unwrap());

    let params = ExecutionParams::new()
        .with("table", "items")
        .with("min", 2.0)
        .with("pageNum_", 2)
        .with("pageSize_", 2)
        .with("needCount_", true);
    let result = ctx
        .query("SELECT * FROM ${table} WHERE price > #{min} ORDER BY id", &params)
        .await
        .unwrap();

    let QueryResult::Page(page) = result else {
        panic!("expected a page");
    };
    assert_eq!(page.total, Some(4));
    let ids: Vec<i64> = page.rows.iter().map(|r| r["id"].as_i64().unwrap()).collect();
    assert_eq!(ids, vec![4, 5]);
    assert_eq!(page.rows[0]["tags"], json!(r#"["x","ü"]"#));
}

#[tokio::test]
async fn sqlite_query_without_paging_returns_rows() {
    let tmp = TempDir::new().unwrap();
    let ctx = sqlite_context(&tmp).await;
    ctx.insert_batch(&[priced(1, "a", 1.0), priced(2, "b", 2.0)])
        .await
        .unwrap();

    let params = ExecutionParams::new().with("name", "b");
    let result = ctx
        .query("SELECT id, name FROM items WHERE name = #{name}", &params)
        .await
        .unwrap();
    let QueryResult::Rows(rows) = result else {
        panic!("expected plain rows");
    };
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"], json!(2));

    let counted = ctx
        .query(
            "SELECT * FROM items",
            &ExecutionParams::new().with("pageNum_", 1),
        )
        .await
        .unwrap();
    let QueryResult::Page(page) = counted else {
        panic!("expected a page");
    };
    assert_eq!(page.total, None);
    assert_eq!(page.rows.len(), 2);
}

#[tokio::test]
async fn sqlite_collect_and_delete() {
    let tmp = TempDir::new().unwrap();
    let ctx = sqlite_context(&tmp).await;
    let records: Vec<Record> = (1..=4).map(|i| priced(i, "n", i as f64)).collect();
    ctx.insert_batch(&records).await.unwrap();

    assert_eq!(ctx.collect(0).await.unwrap().len(), 4);
    assert_eq!(ctx.collect(3).await.unwrap().len(), 3);

    let cheap = vec![ConditionGroup::and(vec![Condition::new(
        "price",
        Operator::Lt,
        json!(3),
    )])];
    assert_eq!(ctx.collect_conditions(0, &cheap).await.unwrap().len(), 2);

    assert_eq!(ctx.delete_conditions(&cheap).await.unwrap(), 2);
    assert_eq!(ctx.delete("id = 3").await.unwrap(), 1);
    assert_eq!(ctx.size().await.unwrap(), 1);

    let err = ctx.delete_conditions(&[]).await.unwrap_err();
    assert!(matches!(err, FdError::IllegalArgument(_)));

    ctx.delete_all().await.unwrap();
    assert!(ctx.is_empty().await.unwrap());
}

#[tokio::test]
async fn sqlite_driver_errors_carry_sql_and_source() {
    let tmp = TempDir::new().unwrap();
    let ctx = sqlite_context(&tmp).await;

    let err = ctx
        .query("SELECT missing_column FROM items", &ExecutionParams::new())
        .await
        .unwrap_err();

    let message = err.to_string();
    assert!(err.is_execute());
    assert!(message.contains("warehouse"), "{}", message);
    assert!(message.contains("SELECT missing_column FROM items"), "{}", message);
}

#[tokio::test]
async fn update_batch_reports_missed_rows() {
    let tmp = TempDir::new().unwrap();
    let ctx = sqlite_context(&tmp).await;
    ctx.insert_batch(&[priced(1, "a", 1.0)]).await.unwrap();

    let outcomes = ctx
        .update_batch(&[priced(1, "renamed", 1.0), priced(9, "ghost", 1.0)])
        .await
        .unwrap();

    assert_eq!(
        outcomes,
        vec![RowOutcome::updated(), RowOutcome::failed(RowAction::Missed)]
    );
}
