//! Error taxonomy for the data-access and service boundaries.
//!
//! Internal plumbing uses `anyhow`, but two boundaries return typed errors
//! so callers can match on the kind:
//!
//! | Type | Raised by | Meaning |
//! |------|-----------|---------|
//! | [`FdError::Execute`] | [`crate::datasource`] | A SQL statement failed against a fact datasource |
//! | [`FdError::Generate`] | [`crate::sql`] | A statement could not be built (no columns, no key) |
//! | [`FdError::IllegalArgument`] | everywhere | Setup or configuration mistake; fails fast |
//! | [`DaoError`] | [`crate::dao`] | Raw driver failure; never leaks past a datasource |
//! | [`crate::service::ServiceError`] | [`crate::service`] | Peer service unreachable or without instances |

use thiserror::Error;

/// Errors raised at the [`DataSourceContext`](crate::datasource::DataSourceContext) boundary.
#[derive(Debug, Error)]
pub enum FdError {
    /// A statement failed while executing. The SQL text and the source name
    /// are always part of the message.
    #[error("execute sql on source '{source_name}' failed: {message} [sql: {sql}]")]
    Execute {
        source_name: String,
        sql: String,
        message: String,
    },

    /// The generator could not produce a statement for the given input.
    #[error("cannot build sql for '{table}': {reason}")]
    Generate { table: String, reason: String },

    #[error("illegal argument: {0}")]
    IllegalArgument(String),
}

impl FdError {
    pub fn execute(source_name: &str, sql: &str, message: impl Into<String>) -> Self {
        FdError::Execute {
            source_name: source_name.to_string(),
            sql: sql.to_string(),
            message: message.into(),
        }
    }

    pub fn generate(table: &str, reason: impl Into<String>) -> Self {
        FdError::Generate {
            table: table.to_string(),
            reason: reason.into(),
        }
    }

    pub fn illegal(message: impl Into<String>) -> Self {
        FdError::IllegalArgument(message.into())
    }

    /// True for statement-execution failures.
    pub fn is_execute(&self) -> bool {
        matches!(self, FdError::Execute { .. })
    }
}

/// A raw failure reported by a [`Dao`](crate::dao::Dao) implementation.
#[derive(Debug, Error)]
pub enum DaoError {
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error("{0}")]
    Driver(String),
}

impl DaoError {
    pub fn driver(message: impl Into<String>) -> Self {
        DaoError::Driver(message.into())
    }
}
