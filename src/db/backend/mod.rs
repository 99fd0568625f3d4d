//! Dialect adapters.
//!
//! A [`Backend`] owns every difference between SQL dialects: literal quoting,
//! identifier formatting, `LIMIT`/`FIRST` placement, parameter placeholders,
//! transaction verbs, primary-key generation and introspection. Cursors and
//! bizobjs only ever talk to a dialect through this trait.

mod firebird;
mod postgres;
mod sqlite;

pub use firebird::Firebird;
pub use postgres::{Postgres, PostgresDriver};
pub use sqlite::{Sqlite, SqliteDriver};

use crate::config::{BackendKind, ConnectInfo};
use crate::error::Result;
use crate::sql_builder::SelectParts;
use crate::value::{ColumnInfo, FieldInfo, Value};

use super::driver::RawConnection;
use super::escape::escape_string;

/// Dialect-specific behavior consumed by connections and cursors.
///
/// Only [`kind`](Backend::kind), [`open_connection`](Backend::open_connection),
/// [`get_tables`](Backend::get_tables) and [`get_fields`](Backend::get_fields)
/// are required; everything else defaults to plain ANSI behavior.
pub trait Backend {
    fn kind(&self) -> BackendKind;

    /// Open a driver handle for `info`.
    ///
    /// # Errors
    /// Returns `DaboError::ConnectFailure` when the database cannot be reached.
    fn open_connection(&self, info: &ConnectInfo) -> Result<Box<dyn RawConnection>>;

    /// Render a string literal.
    ///
    /// The base rendering doubles both quotes and backslashes.
    fn escape(&self, s: &str) -> String {
        escape_string(s)
    }

    /// Render a date, datetime or time literal.
    fn format_date_time(&self, value: &Value) -> String {
        format!("'{}'", value)
    }

    /// Render a (possibly table-qualified) field name.
    fn format_field(&self, name: &str) -> String {
        name.to_string()
    }

    fn bool_literal(&self, value: bool) -> &'static str {
        if value { "1" } else { "0" }
    }

    /// Render any value as an SQL literal for INSERT/UPDATE/DELETE text.
    fn format_value(&self, value: &Value) -> String {
        match value {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => self.bool_literal(*b).to_string(),
            Value::Int(_) | Value::Float(_) | Value::Decimal(_) => value.to_string(),
            Value::Text(s) => self.escape(s),
            Value::Date(_) | Value::DateTime(_) | Value::Time(_) => self.format_date_time(value),
        }
    }

    fn limit_keyword(&self) -> &'static str {
        "LIMIT"
    }

    /// Assemble a SELECT from its fragments, one clause per line.
    fn compose_select(&self, parts: &SelectParts) -> String {
        let mut sql = format!("SELECT {}\nFROM {}", parts.fields, parts.from);
        push_clauses(&mut sql, parts);
        if let Some(limit) = &parts.limit {
            sql.push_str(&format!("\n{} {}", self.limit_keyword(), limit));
        }
        sql
    }

    /// Positional placeholder for the 1-based parameter `index`.
    fn param_placeholder(&self, _index: usize) -> String {
        "?".to_string()
    }

    fn get_tables(&self, conn: &mut dyn RawConnection) -> Result<Vec<String>>;

    fn get_fields(&self, conn: &mut dyn RawConnection, table: &str) -> Result<Vec<FieldInfo>>;

    fn get_table_record_count(&self, conn: &mut dyn RawConnection, table: &str) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.format_field(table));
        let result = conn.execute(&sql, &[])?;
        Ok(result
            .scalar()
            .and_then(Value::as_i64)
            .map_or(0, |n| n.max(0) as u64))
    }

    fn begin_transaction(&self, conn: &mut dyn RawConnection) -> Result<()> {
        conn.execute_batch("BEGIN")
    }

    fn commit(&self, conn: &mut dyn RawConnection) -> Result<()> {
        conn.execute_batch("COMMIT")
    }

    fn rollback(&self, conn: &mut dyn RawConnection) -> Result<()> {
        conn.execute_batch("ROLLBACK")
    }

    /// Key value to write into a new row before its INSERT, for dialects that
    /// draw keys from a generator.
    fn pregenerate_primary_key(
        &self,
        _conn: &mut dyn RawConnection,
        _table: &str,
        _key_field: &str,
    ) -> Result<Option<Value>> {
        Ok(None)
    }

    /// Key value assigned by the database to the row just inserted.
    fn last_insert_id(
        &self,
        _conn: &mut dyn RawConnection,
        _table: &str,
        _key_field: &str,
    ) -> Result<Option<Value>> {
        Ok(None)
    }

    /// Normalize column metadata of a fresh result set.
    fn massage_description(&self, _description: &mut [ColumnInfo]) {}

    /// Make DML durable for dialects that need an explicit commit.
    fn flush(&self, _conn: &mut dyn RawConnection, _in_transaction: bool) -> Result<()> {
        Ok(())
    }

    /// True when UPDATE/INSERT row counts cannot be trusted.
    fn no_results_on_save(&self) -> bool {
        false
    }

    /// True when DELETE row counts cannot be trusted.
    fn no_results_on_delete(&self) -> bool {
        false
    }
}

/// WHERE, GROUP BY and ORDER BY lines shared by every dialect.
pub(crate) fn push_clauses(sql: &mut String, parts: &SelectParts) {
    if !parts.where_clause.is_empty() {
        sql.push_str("\nWHERE ");
        sql.push_str(&parts.where_clause);
    }
    if !parts.group_by.is_empty() {
        sql.push_str("\nGROUP BY ");
        sql.push_str(&parts.group_by);
    }
    if !parts.order_by.is_empty() {
        sql.push_str("\nORDER BY ");
        sql.push_str(&parts.order_by);
    }
}

/// Adapter for a backend kind.
pub fn backend_for(kind: BackendKind) -> Box<dyn Backend> {
    match kind {
        BackendKind::Sqlite => Box::new(Sqlite),
        BackendKind::Postgres => Box::new(Postgres),
        BackendKind::Firebird => Box::new(Firebird),
    }
}
