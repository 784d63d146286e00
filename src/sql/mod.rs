//! Dialect-aware SQL generation.
//!
//! Everything here is pure: generators take declarative inputs (table,
//! record, condition groups) and return a [`SqlWrap`], a statement paired
//! with its bound parameters. Statements always use `:name` markers;
//! [`placeholder::to_positional`] turns them into whatever the driver
//! expects right before execution.
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`dialect`] | Per-backend lexical rules: reserved words, quoting, placeholder style |
//! | [`condition`] | Structured AND/OR condition groups |
//! | [`generator`] | COUNT / EXISTS / SELECT / INSERT / UPDATE / DELETE builders |
//! | [`placeholder`] | `${key}` / `#{key}` query templates and marker rewriting |

pub mod condition;
pub mod dialect;
pub mod generator;
pub mod placeholder;

use serde_json::Value;
use std::collections::BTreeMap;

pub use condition::{Condition, ConditionGroup, Logic, Operator};
pub use dialect::{PlaceholderStyle, SqlDialect};
pub use generator::SqlGenerator;

/// A scalar that can be bound to a statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl SqlValue {
    /// Convert a JSON value into a bindable scalar.
    ///
    /// Strings pass through unchanged, arrays and objects are serialized to
    /// JSON text (non-ASCII preserved), everything else keeps its type.
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => SqlValue::Null,
            Value::Bool(b) => SqlValue::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => SqlValue::Int(i),
                None => SqlValue::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => SqlValue::Text(s.clone()),
            Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
        }
    }

    /// Render the value as SQL literal text for `${key}` substitution.
    pub fn literal_text(&self) -> String {
        match self {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Bool(b) => if *b { "1" } else { "0" }.to_string(),
            SqlValue::Int(i) => i.to_string(),
            SqlValue::Float(f) => f.to_string(),
            SqlValue::Text(s) => s.clone(),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self {
        SqlValue::Text(s.to_string())
    }
}

impl From<i64> for SqlValue {
    fn from(i: i64) -> Self {
        SqlValue::Int(i)
    }
}

/// A generated statement with its named parameters.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SqlWrap {
    pub sql: String,
    pub params: BTreeMap<String, SqlValue>,
}

impl SqlWrap {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: BTreeMap::new(),
        }
    }

    pub fn with_params(sql: impl Into<String>, params: BTreeMap<String, SqlValue>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}
