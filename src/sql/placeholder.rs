//! Query templates and bind-marker rewriting.
//!
//! Free-form queries use two placeholder syntaxes:
//!
//! | Syntax | Result | Use for |
//! |--------|--------|---------|
//! | `${key}` | the value's literal text | identifiers that cannot be bound (table, column, sort order) |
//! | `#{key}` | the marker `:key`, with `key` bound | values |
//!
//! Only keys referenced through `#{}` end up in the bound parameters.
//!
//! `${}` text is later scanned for `:name` markers like the rest of the
//! query. Text that would read as a marker outside quotes is rejected; quote
//! the placeholder (`'${key}'`) or bind it with `#{key}` instead.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::dialect::{is_plain_identifier, PlaceholderStyle};
use super::{SqlValue, SqlWrap};
use crate::error::FdError;

/// Expand `${key}` and `#{key}` placeholders in `query` from `params`.
///
/// The template is scanned once, left to right, so text produced by a
/// `${}` substitution is never re-scanned. A referenced key that is
/// missing from `params` is an illegal argument, and so is unquoted `${}`
/// text containing a `:name` marker.
pub fn render_query(query: &str, params: &Map<String, Value>) -> Result<SqlWrap, FdError> {
    let mut sql = String::with_capacity(query.len());
    let mut bound = BTreeMap::new();
    let mut rest = query;
    let mut quote = None;

    while let Some(pos) = rest.find(['$', '#']) {
        let (before, tail) = rest.split_at(pos);
        sql.push_str(before);
        quote = track_quotes(quote, before);

        let sigil = tail.as_bytes()[0];
        if !tail[1..].starts_with('{') {
            sql.push(sigil as char);
            rest = &tail[1..];
            continue;
        }
        let close = tail.find('}').ok_or_else(|| {
            FdError::illegal(format!("unterminated placeholder in query: {}", tail))
        })?;
        let key = tail[2..close].trim();
        let value = params
            .get(key)
            .ok_or_else(|| FdError::illegal(format!("missing query parameter '{}'", key)))?;

        if sigil == b'$' {
            let text = SqlValue::from_json(value).literal_text();
            let reads_as_marker =
                to_positional(&text, &BTreeMap::new(), PlaceholderStyle::Colon).is_err();
            if quote.is_none() && reads_as_marker {
                return Err(FdError::illegal(format!(
                    "literal parameter '{}' reads as a bind marker; quote it or use #{{{}}}",
                    key, key
                )));
            }
            sql.push_str(&text);
        } else {
            if !is_plain_identifier(key) {
                return Err(FdError::illegal(format!(
                    "invalid bind parameter name '{}'",
                    key
                )));
            }
            sql.push(':');
            sql.push_str(key);
            bound.insert(key.to_string(), SqlValue::from_json(value));
        }
        rest = &tail[close + 1..];
    }
    sql.push_str(rest);

    Ok(SqlWrap::with_params(sql, bound))
}

/// Quote state after `text`, starting from `quote`. Doubled quotes toggle
/// twice and leave the state unchanged.
fn track_quotes(mut quote: Option<char>, text: &str) -> Option<char> {
    for c in text.chars() {
        match quote {
            Some(open) if c == open => quote = None,
            None if matches!(c, '\'' | '"' | '`') => quote = Some(c),
            _ => {}
        }
    }
    quote
}

/// Rewrite `:name` markers into the driver's style and collect the values in
/// marker order.
///
/// Quoted strings and identifiers are copied verbatim, and `::` casts are
/// not treated as markers. Every marker must have a parameter.
pub fn to_positional(
    sql: &str,
    params: &BTreeMap<String, SqlValue>,
    style: PlaceholderStyle,
) -> Result<(String, Vec<SqlValue>), FdError> {
    let chars: Vec<char> = sql.chars().collect();
    let mut out = String::with_capacity(sql.len());
    let mut values = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '\'' | '"' | '`' => {
                // Copy the quoted section, honouring doubled quotes.
                out.push(c);
                i += 1;
                while i < chars.len() {
                    out.push(chars[i]);
                    if chars[i] == c {
                        if i + 1 < chars.len() && chars[i + 1] == c {
                            out.push(c);
                            i += 2;
                            continue;
                        }
                        break;
                    }
                    i += 1;
                }
                i += 1;
            }
            ':' if i + 1 < chars.len() && chars[i + 1] == ':' => {
                out.push_str("::");
                i += 2;
            }
            ':' if i + 1 < chars.len()
                && (chars[i + 1].is_ascii_alphabetic() || chars[i + 1] == '_') =>
            {
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && (chars[end].is_ascii_alphanumeric() || chars[end] == '_')
                {
                    end += 1;
                }
                let name: String = chars[start..end].iter().collect();
                let value = params.get(&name).ok_or_else(|| {
                    FdError::illegal(format!("no value bound for parameter ':{}'", name))
                })?;
                values.push(value.clone());
                match style {
                    PlaceholderStyle::Colon => {
                        out.push(':');
                        out.push_str(&name);
                    }
                    PlaceholderStyle::Question => out.push('?'),
                    PlaceholderStyle::Dollar => out.push_str(&format!("${}", values.len())),
                }
                i = end;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }

    Ok((out, values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: Value) -> Map<String, Value> {
        v.as_object().unwrap().clone()
    }

    #[test]
    fn literal_and_bound_placeholders() {
        let wrap = render_query(
            "WHERE x=${a} AND y=#{b}",
            &map(json!({"a": "5", "b": "hello"})),
        )
        .unwrap();
        assert_eq!(wrap.sql, "WHERE x=5 AND y=:b");
        assert_eq!(wrap.params.len(), 1);
        assert_eq!(wrap.params["b"], SqlValue::Text("hello".into()));
        assert!(!wrap.params.contains_key("a"));
    }

    #[test]
    fn unreferenced_params_do_not_leak() {
        let wrap = render_query(
            "SELECT * FROM t WHERE id = #{id}",
            &map(json!({"id": 3, "pageNum_": 1, "pageSize_": 10})),
        )
        .unwrap();
        assert_eq!(wrap.params.keys().collect::<Vec<_>>(), vec!["id"]);
        assert_eq!(wrap.params["id"], SqlValue::Int(3));
    }

    #[test]
    fn substituted_text_is_not_rescanned() {
        let wrap = render_query("SELECT ${col}", &map(json!({"col": "#{x}"}))).unwrap();
        assert_eq!(wrap.sql, "SELECT #{x}");
        assert!(wrap.params.is_empty());
    }

    #[test]
    fn literal_marker_text_must_be_quoted() {
        let params = map(json!({"tag": "a:b", "cast": "x::text"}));

        let err = render_query("SELECT * FROM t WHERE tag = ${tag}", &params).unwrap_err();
        assert!(matches!(err, FdError::IllegalArgument(ref m) if m.contains("'tag'")), "{}", err);

        let wrap = render_query("SELECT * FROM t WHERE tag = '${tag}'", &params).unwrap();
        assert_eq!(wrap.sql, "SELECT * FROM t WHERE tag = 'a:b'");
        let (sql, values) =
            to_positional(&wrap.sql, &wrap.params, PlaceholderStyle::Question).unwrap();
        assert_eq!(sql, wrap.sql);
        assert!(values.is_empty());

        let wrap = render_query("SELECT ${cast} FROM t", &params).unwrap();
        assert_eq!(wrap.sql, "SELECT x::text FROM t");
    }

    #[test]
    fn bare_sigils_pass_through() {
        let wrap = render_query("SELECT '$5' || '#tag'", &Map::new()).unwrap();
        assert_eq!(wrap.sql, "SELECT '$5' || '#tag'");
    }

    #[test]
    fn missing_parameter_is_rejected() {
        let err = render_query("WHERE y=#{b}", &Map::new()).unwrap_err();
        assert!(matches!(err, FdError::IllegalArgument(_)));
    }

    #[test]
    fn positional_rewrite_skips_quotes_and_casts() {
        let mut params = BTreeMap::new();
        params.insert("a".to_string(), SqlValue::Int(1));
        params.insert("b".to_string(), SqlValue::Text("x".into()));

        let (sql, values) = to_positional(
            "SELECT ':a', x::text FROM t WHERE a = :a AND b = :b OR a = :a",
            &params,
            PlaceholderStyle::Question,
        )
        .unwrap();
        assert_eq!(
            sql,
            "SELECT ':a', x::text FROM t WHERE a = ? AND b = ? OR a = ?"
        );
        assert_eq!(
            values,
            vec![SqlValue::Int(1), SqlValue::Text("x".into()), SqlValue::Int(1)]
        );
    }

    #[test]
    fn dollar_style_numbers_markers() {
        let mut params = BTreeMap::new();
        params.insert("a".to_string(), SqlValue::Int(1));
        let (sql, _) = to_positional("a = :a OR b = :a", &params, PlaceholderStyle::Dollar).unwrap();
        assert_eq!(sql, "a = $1 OR b = $2");
    }

    #[test]
    fn unbound_marker_is_rejected() {
        let err = to_positional("a = :missing", &BTreeMap::new(), PlaceholderStyle::Question)
            .unwrap_err();
        assert!(err.to_string().contains("missing"));
    }
}
