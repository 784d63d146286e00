//! Per-backend lexical rules.
//!
//! A [`SqlDialect`] is plain configuration injected into the
//! [`SqlGenerator`](super::SqlGenerator): which words must be quoted, how to
//! quote them, which bind-marker style the driver expects, and which
//! optional statements (EXISTS, TRUNCATE) are available.

use std::collections::HashSet;

/// Bind-marker syntax expected by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `:name`
    Colon,
    /// `?`
    Question,
    /// `$1`, `$2`, ...
    Dollar,
}

#[derive(Debug, Clone)]
pub struct SqlDialect {
    pub name: String,
    pub quote_open: char,
    pub quote_close: char,
    /// Upper-case reserved words that must be quoted when used as identifiers.
    pub reserved_words: HashSet<String>,
    pub placeholder_style: PlaceholderStyle,
    pub supports_exists: bool,
    pub supports_truncate: bool,
}

const COMMON_RESERVED: &[&str] = &[
    "ADD", "ALL", "ALTER", "AND", "AS", "ASC", "BETWEEN", "BY", "CASE", "CHECK", "COLUMN",
    "CONSTRAINT", "CREATE", "CROSS", "DEFAULT", "DELETE", "DESC", "DISTINCT", "DROP", "ELSE",
    "END", "EXISTS", "FOREIGN", "FROM", "FULL", "GROUP", "HAVING", "IN", "INDEX", "INNER",
    "INSERT", "INTO", "IS", "JOIN", "KEY", "LEFT", "LIKE", "LIMIT", "NOT", "NULL", "OFFSET",
    "ON", "OR", "ORDER", "OUTER", "PRIMARY", "REFERENCES", "RIGHT", "SELECT", "SET", "TABLE",
    "THEN", "TO", "UNION", "UNIQUE", "UPDATE", "USING", "VALUES", "WHEN", "WHERE",
];

const SQLITE_RESERVED: &[&str] = &[
    "ABORT", "ACTION", "AFTER", "ANALYZE", "ATTACH", "AUTOINCREMENT", "BEFORE", "BEGIN",
    "CASCADE", "CAST", "COLLATE", "COMMIT", "CONFLICT", "DEFERRED", "DETACH", "EACH", "ESCAPE",
    "EXCEPT", "EXCLUSIVE", "EXPLAIN", "FAIL", "GLOB", "IGNORE", "IMMEDIATE", "INDEXED",
    "INSTEAD", "INTERSECT", "ISNULL", "MATCH", "NATURAL", "NOTNULL", "PLAN", "PRAGMA", "QUERY",
    "RAISE", "RECURSIVE", "REGEXP", "REINDEX", "RELEASE", "RENAME", "REPLACE", "RESTRICT",
    "ROLLBACK", "ROW", "SAVEPOINT", "TEMP", "TEMPORARY", "TRANSACTION", "TRIGGER", "VACUUM",
    "VIEW", "VIRTUAL", "WITH", "WITHOUT",
];

const MYSQL_RESERVED: &[&str] = &[
    "ACCESSIBLE", "CHANGE", "CONDITION", "DATABASE", "DATABASES", "DESCRIBE", "DIV", "DUAL",
    "FULLTEXT", "INTERVAL", "KEYS", "KILL", "LOCK", "MATCH", "MOD", "OPTION", "RANK", "READ",
    "READS", "REGEXP", "RENAME", "REPLACE", "REQUIRE", "RLIKE", "ROW", "ROWS", "SCHEMA",
    "SHOW", "SPATIAL", "STATUS", "TRIGGER", "USAGE", "WRITE", "XOR",
];

const POSTGRES_RESERVED: &[&str] = &[
    "ANALYSE", "ANALYZE", "ARRAY", "ASYMMETRIC", "BOTH", "CAST", "COLLATE", "CURRENT_DATE",
    "CURRENT_ROLE", "CURRENT_TIME", "CURRENT_USER", "DEFERRABLE", "DO", "EXCEPT", "FETCH",
    "FOR", "GRANT", "ILIKE", "INITIALLY", "INTERSECT", "LATERAL", "LEADING", "LOCALTIME",
    "ONLY", "PLACING", "RETURNING", "SESSION_USER", "SOME", "SYMMETRIC", "TRAILING", "USER",
    "VARIADIC", "WINDOW", "WITH",
];

fn word_set(lists: &[&[&str]]) -> HashSet<String> {
    lists
        .iter()
        .flat_map(|list| list.iter())
        .map(|w| w.to_string())
        .collect()
}

impl SqlDialect {
    pub fn sqlite() -> Self {
        Self {
            name: "sqlite".to_string(),
            quote_open: '"',
            quote_close: '"',
            reserved_words: word_set(&[COMMON_RESERVED, SQLITE_RESERVED]),
            placeholder_style: PlaceholderStyle::Question,
            supports_exists: true,
            supports_truncate: false,
        }
    }

    pub fn mysql() -> Self {
        Self {
            name: "mysql".to_string(),
            quote_open: '`',
            quote_close: '`',
            reserved_words: word_set(&[COMMON_RESERVED, MYSQL_RESERVED]),
            placeholder_style: PlaceholderStyle::Question,
            supports_exists: true,
            supports_truncate: true,
        }
    }

    pub fn postgres() -> Self {
        Self {
            name: "postgres".to_string(),
            quote_open: '"',
            quote_close: '"',
            reserved_words: word_set(&[COMMON_RESERVED, POSTGRES_RESERVED]),
            placeholder_style: PlaceholderStyle::Dollar,
            supports_exists: true,
            supports_truncate: true,
        }
    }

    pub fn by_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "sqlite" => Some(Self::sqlite()),
            "mysql" | "mariadb" => Some(Self::mysql()),
            "postgres" | "postgresql" => Some(Self::postgres()),
            _ => None,
        }
    }

    pub fn is_reserved(&self, word: &str) -> bool {
        self.reserved_words.contains(&word.to_ascii_uppercase())
    }

    /// Quote a (possibly schema-qualified) identifier.
    ///
    /// Each dot-separated part must be a plain identifier
    /// (`[A-Za-z_][A-Za-z0-9_]*`); reserved words are quoted. Returns `None`
    /// for anything else.
    pub fn quote_identifier(&self, ident: &str) -> Option<String> {
        let parts: Option<Vec<String>> = ident
            .split('.')
            .map(|part| {
                if !is_plain_identifier(part) {
                    return None;
                }
                if self.is_reserved(part) {
                    Some(format!("{}{}{}", self.quote_open, part, self.quote_close))
                } else {
                    Some(part.to_string())
                }
            })
            .collect();
        parts.map(|p| p.join("."))
    }
}

impl Default for SqlDialect {
    fn default() -> Self {
        Self::sqlite()
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_plain_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
