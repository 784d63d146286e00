//! Structured filter conditions.
//!
//! A filter is a list of [`ConditionGroup`]s joined with `AND`; inside a
//! group the conditions are joined with the group's [`Logic`]. Groups
//! deserialize from JSON, so crawl scripts and CLI callers can pass them
//! as data:
//!
//! ```json
//! [
//!   {"logic": "or", "conditions": [
//!     {"field": "status", "operator": "eq", "value": "active"},
//!     {"field": "status", "operator": "eq", "value": "pending"}
//!   ]},
//!   {"conditions": [{"field": "price", "operator": ">", "value": 10}]}
//! ]
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::{SqlDialect, SqlValue};
use crate::error::FdError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Logic {
    #[default]
    And,
    Or,
}

impl Logic {
    fn keyword(self) -> &'static str {
        match self {
            Logic::And => " AND ",
            Logic::Or => " OR ",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    #[serde(alias = "=")]
    Eq,
    #[serde(alias = "!=", alias = "<>")]
    Ne,
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = ">=")]
    Ge,
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = "<=")]
    Le,
    Like,
    NotLike,
    In,
    NotIn,
    IsNull,
    IsNotNull,
}

impl Operator {
    fn binary_symbol(self) -> Option<&'static str> {
        Some(match self {
            Operator::Eq => "=",
            Operator::Ne => "<>",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Like => "LIKE",
            Operator::NotLike => "NOT LIKE",
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    #[serde(alias = "op")]
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ConditionGroup {
    #[serde(default)]
    pub logic: Logic,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl ConditionGroup {
    pub fn and(conditions: Vec<Condition>) -> Self {
        Self {
            logic: Logic::And,
            conditions,
        }
    }

    pub fn or(conditions: Vec<Condition>) -> Self {
        Self {
            logic: Logic::Or,
            conditions,
        }
    }
}

/// Render condition groups into a predicate, adding bound values to `params`.
///
/// Parameter names are `w0`, `w1`, ... (`w3_0`, `w3_1` for list members).
/// Returns `None` when no group holds a condition.
pub(crate) fn render_predicate(
    groups: &[ConditionGroup],
    dialect: &SqlDialect,
    table: &str,
    params: &mut BTreeMap<String, SqlValue>,
) -> Result<Option<String>, FdError> {
    let mut rendered_groups = Vec::new();
    let mut counter = 0usize;

    for group in groups {
        if group.conditions.is_empty() {
            continue;
        }
        let mut parts = Vec::with_capacity(group.conditions.len());
        for cond in &group.conditions {
            let column = dialect.quote_identifier(&cond.field).ok_or_else(|| {
                FdError::generate(table, format!("invalid condition field '{}'", cond.field))
            })?;
            let name = format!("w{}", counter);
            counter += 1;
            parts.push(render_condition(&column, cond, &name, params));
        }
        let joined = parts.join(group.logic.keyword());
        rendered_groups.push(if parts.len() > 1 {
            format!("({})", joined)
        } else {
            joined
        });
    }

    if rendered_groups.is_empty() {
        Ok(None)
    } else {
        Ok(Some(rendered_groups.join(" AND ")))
    }
}

fn render_condition(
    column: &str,
    cond: &Condition,
    name: &str,
    params: &mut BTreeMap<String, SqlValue>,
) -> String {
    if let Some(symbol) = cond.operator.binary_symbol() {
        params.insert(name.to_string(), SqlValue::from_json(&cond.value));
        return format!("{} {} :{}", column, symbol, name);
    }

    match cond.operator {
        Operator::IsNull => format!("{} IS NULL", column),
        Operator::IsNotNull => format!("{} IS NOT NULL", column),
        Operator::In | Operator::NotIn => {
            let items: Vec<&Value> = match &cond.value {
                Value::Array(values) => values.iter().collect(),
                Value::Null => Vec::new(),
                other => vec![other],
            };
            let negate = cond.operator == Operator::NotIn;
            if items.is_empty() {
                // IN () is not valid SQL; an empty set matches nothing.
                return if negate { "1 = 1" } else { "1 = 0" }.to_string();
            }
            let markers: Vec<String> = items
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    let item_name = format!("{}_{}", name, i);
                    params.insert(item_name.clone(), SqlValue::from_json(v));
                    format!(":{}", item_name)
                })
                .collect();
            format!(
                "{} {} ({})",
                column,
                if negate { "NOT IN" } else { "IN" },
                markers.join(", ")
            )
        }
        _ => unreachable!("binary operators handled above"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn render(groups: &[ConditionGroup]) -> (Option<String>, BTreeMap<String, SqlValue>) {
        let mut params = BTreeMap::new();
        let sql = render_predicate(groups, &SqlDialect::sqlite(), "t", &mut params).unwrap();
        (sql, params)
    }

    #[test]
    fn groups_join_with_and_inside_logic() {
        let groups = vec![
            ConditionGroup::or(vec![
                Condition::new("status", Operator::Eq, "active"),
                Condition::new("status", Operator::Eq, "pending"),
            ]),
            ConditionGroup::and(vec![Condition::new("price", Operator::Gt, 10)]),
        ];
        let (sql, params) = render(&groups);
        assert_eq!(
            sql.as_deref(),
            Some("(status = :w0 OR status = :w1) AND price > :w2")
        );
        assert_eq!(params["w0"], SqlValue::Text("active".into()));
        assert_eq!(params["w2"], SqlValue::Int(10));
    }

    #[test]
    fn in_lists_and_null_checks() {
        let groups = vec![ConditionGroup::and(vec![
            Condition::new("id", Operator::In, json!([1, 2])),
            Condition::new("deleted_at", Operator::IsNull, Value::Null),
        ])];
        let (sql, params) = render(&groups);
        assert_eq!(
            sql.as_deref(),
            Some("(id IN (:w0_0, :w0_1) AND deleted_at IS NULL)")
        );
        assert_eq!(params.len(), 2);
    }

    #[test]
    fn empty_in_matches_nothing() {
        let groups = vec![ConditionGroup::and(vec![Condition::new(
            "id",
            Operator::In,
            json!([]),
        )])];
        assert_eq!(render(&groups).0.as_deref(), Some("1 = 0"));
    }

    #[test]
    fn empty_groups_render_nothing() {
        assert_eq!(render(&[ConditionGroup::default()]).0, None);
    }

    #[test]
    fn symbols_deserialize_as_operators() {
        let groups: Vec<ConditionGroup> = serde_json::from_value(json!([
            {"logic": "or", "conditions": [{"field": "a", "op": ">=", "value": 3}]}
        ]))
        .unwrap();
        assert_eq!(groups[0].logic, Logic::Or);
        assert_eq!(groups[0].conditions[0].operator, Operator::Ge);
    }

    #[test]
    fn bad_field_is_a_generate_error() {
        let groups = vec![ConditionGroup::and(vec![Condition::new(
            "a = 1 OR 1",
            Operator::Eq,
            1,
        )])];
        let mut params = BTreeMap::new();
        let err = render_predicate(&groups, &SqlDialect::sqlite(), "t", &mut params).unwrap_err();
        assert!(matches!(err, FdError::Generate { .. }));
    }
}
