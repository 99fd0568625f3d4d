//! SQLite dialect and the bundled `rusqlite` driver.

use std::path::Path;

use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{ErrorCode, ToSql, params_from_iter};
use rust_decimal::Decimal;
use tracing::debug;

use super::Backend;
use crate::config::{BackendKind, ConnectInfo};
use crate::db::driver::{RawConnection, RawResult};
use crate::db::escape::escape_string_standard;
use crate::error::{DaboError, Result};
use crate::value::{ColumnInfo, FieldInfo, FieldType, Value};

/// SQLite dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sqlite;

impl Backend for Sqlite {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn open_connection(&self, info: &ConnectInfo) -> Result<Box<dyn RawConnection>> {
        let driver = if info.is_memory() {
            SqliteDriver::open_in_memory()
        } else {
            SqliteDriver::open(Path::new(&info.database))
        };
        Ok(Box::new(driver?))
    }

    fn escape(&self, s: &str) -> String {
        escape_string_standard(s)
    }

    fn get_tables(&self, conn: &mut dyn RawConnection) -> Result<Vec<String>> {
        let result = conn.execute(
            "SELECT name FROM sqlite_master WHERE type = 'table' \
             AND name NOT LIKE 'sqlite_%' ORDER BY name",
            &[],
        )?;
        Ok(result
            .rows
            .iter()
            .filter_map(|row| row.first().and_then(Value::as_str).map(str::to_string))
            .collect())
    }

    fn get_fields(&self, conn: &mut dyn RawConnection, table: &str) -> Result<Vec<FieldInfo>> {
        // cid, name, type, notnull, dflt_value, pk
        let sql = format!("PRAGMA table_info({})", self.escape(table));
        let result = conn.execute(&sql, &[])?;
        Ok(result
            .rows
            .iter()
            .filter_map(|row| {
                let name = row.get(1)?.as_str()?.to_string();
                let decl = row.get(2).and_then(Value::as_str).unwrap_or_default();
                let primary_key = row.get(5).and_then(Value::as_i64).unwrap_or(0) > 0;
                Some(FieldInfo {
                    name,
                    field_type: FieldType::from_decl(decl),
                    primary_key,
                })
            })
            .collect())
    }

    fn last_insert_id(
        &self,
        conn: &mut dyn RawConnection,
        _table: &str,
        _key_field: &str,
    ) -> Result<Option<Value>> {
        let result = conn.execute("SELECT last_insert_rowid()", &[])?;
        Ok(result.scalar().cloned().filter(|v| !v.is_null()))
    }
}

/// `rusqlite` connection speaking the driver contract.
pub struct SqliteDriver {
    conn: rusqlite::Connection,
}

impl SqliteDriver {
    pub fn open(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "opening sqlite database");
        let conn = rusqlite::Connection::open(path).map_err(|e| DaboError::ConnectFailure {
            backend: "sqlite".into(),
            database: path.display().to_string(),
            message: e.to_string(),
        })?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory().map_err(|e| DaboError::ConnectFailure {
            backend: "sqlite".into(),
            database: ":memory:".into(),
            message: e.to_string(),
        })?;
        Ok(Self { conn })
    }
}

impl RawConnection for SqliteDriver {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<RawResult> {
        let mut stmt = self.conn.prepare(sql).map_err(map_sqlite_error)?;
        let declared: Vec<(String, Option<String>)> = stmt
            .columns()
            .iter()
            .map(|c| (c.name().to_string(), c.decl_type().map(str::to_string)))
            .collect();

        if declared.is_empty() {
            let changed = stmt
                .execute(params_from_iter(params.iter()))
                .map_err(map_sqlite_error)?;
            return Ok(RawResult::affected(changed as u64));
        }

        let mut description: Vec<ColumnInfo> = declared
            .iter()
            .map(|(name, decl)| match decl {
                Some(decl) => ColumnInfo::from_decl(name.clone(), decl),
                None => ColumnInfo::new(name.clone(), FieldType::Char),
            })
            .collect();

        let mut rows = Vec::new();
        let mut cursor = stmt
            .query(params_from_iter(params.iter()))
            .map_err(map_sqlite_error)?;
        while let Some(row) = cursor.next().map_err(map_sqlite_error)? {
            if rows.is_empty() {
                // Expression columns carry no declared type; take it from the data.
                for (idx, (_, decl)) in declared.iter().enumerate() {
                    if decl.is_none() {
                        let cell = row.get_ref(idx).map_err(map_sqlite_error)?;
                        description[idx].field_type = infer_type(cell);
                    }
                }
            }
            let mut values = Vec::with_capacity(description.len());
            for (idx, column) in description.iter().enumerate() {
                let cell = row.get_ref(idx).map_err(map_sqlite_error)?;
                values.push(from_sqlite(cell, column));
            }
            rows.push(values);
        }

        Ok(RawResult {
            description,
            rows,
            rowcount: 0,
        })
    }

    fn execute_batch(&mut self, sql: &str) -> Result<()> {
        self.conn.execute_batch(sql).map_err(map_sqlite_error)
    }
}

fn map_sqlite_error(e: rusqlite::Error) -> DaboError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _) if err.code == ErrorCode::ConstraintViolation => {
            DaboError::Integrity {
                message: e.to_string(),
            }
        }
        _ => DaboError::backend(e.to_string()),
    }
}

fn infer_type(cell: ValueRef<'_>) -> FieldType {
    match cell {
        ValueRef::Integer(_) => FieldType::Int,
        ValueRef::Real(_) => FieldType::Float,
        ValueRef::Blob(_) => FieldType::Memo,
        ValueRef::Null | ValueRef::Text(_) => FieldType::Char,
    }
}

fn from_sqlite(cell: ValueRef<'_>, column: &ColumnInfo) -> Value {
    match cell {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => match column.field_type {
            FieldType::Bool => Value::Bool(i != 0),
            FieldType::Float => Value::Float(i as f64),
            FieldType::Decimal => {
                Value::Decimal(Decimal::from(i)).conform(&Value::Null, Some(column))
            }
            _ => Value::Int(i),
        },
        ValueRef::Real(f) => match column.field_type {
            FieldType::Decimal => Value::Float(f).conform(&Value::Null, Some(column)),
            _ => Value::Float(f),
        },
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Value::from_text(String::from_utf8_lossy(bytes).into_owned(), column)
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let out = match self {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Bool(b) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
            Value::Int(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Value::Float(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Decimal(_) | Value::Date(_) | Value::DateTime(_) | Value::Time(_) => {
                ToSqlOutput::Owned(SqlValue::Text(self.to_string()))
            }
        };
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rstest::{fixture, rstest};
    use std::str::FromStr;

    #[fixture]
    fn driver() -> SqliteDriver {
        let mut driver = SqliteDriver::open_in_memory().unwrap();
        driver
            .execute_batch(
                "CREATE TABLE item (
                    pkid INTEGER PRIMARY KEY AUTOINCREMENT,
                    name VARCHAR(40) NOT NULL,
                    price DECIMAL(10,2),
                    active BOOLEAN,
                    added DATE
                );
                INSERT INTO item (name, price, active, added)
                    VALUES ('Widget', 10.5, 1, '2024-03-01');",
            )
            .unwrap();
        driver
    }

    #[rstest]
    fn test_query_uses_declared_types(mut driver: SqliteDriver) {
        let result = driver.execute("SELECT * FROM item", &[]).unwrap();
        let names: Vec<_> = result.description.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["pkid", "name", "price", "active", "added"]);

        let row = &result.rows[0];
        assert_eq!(row[1], Value::from("Widget"));
        assert_eq!(row[2], Value::Decimal(Decimal::from_str("10.50").unwrap()));
        assert_eq!(row[3], Value::Bool(true));
        assert_eq!(row[4], Value::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()));
    }

    #[rstest]
    fn test_expression_columns_infer_type(mut driver: SqliteDriver) {
        let result = driver.execute("SELECT count(*) AS n FROM item", &[]).unwrap();
        assert_eq!(result.description[0].field_type, FieldType::Int);
        assert_eq!(result.scalar(), Some(&Value::Int(1)));
    }

    #[rstest]
    fn test_dml_reports_rowcount_and_binds_params(mut driver: SqliteDriver) {
        let result = driver
            .execute("UPDATE item SET name = ? WHERE pkid = ?", &[Value::from("Gadget"), Value::Int(1)])
            .unwrap();
        assert_eq!(result.rowcount, 1);

        let result = driver
            .execute("SELECT name FROM item WHERE pkid = ?", &[Value::Int(1)])
            .unwrap();
        assert_eq!(result.scalar(), Some(&Value::from("Gadget")));
    }

    #[rstest]
    fn test_constraint_violation_is_integrity(mut driver: SqliteDriver) {
        let err = driver
            .execute("INSERT INTO item (name) VALUES (NULL)", &[])
            .unwrap_err();
        assert!(matches!(err, DaboError::Integrity { .. }));

        let err = driver.execute("SELECT * FROM missing", &[]).unwrap_err();
        assert!(matches!(err, DaboError::Backend { .. }));
    }

    #[rstest]
    fn test_introspection(mut driver: SqliteDriver) {
        assert_eq!(Sqlite.get_tables(&mut driver).unwrap(), vec!["item"]);

        let fields = Sqlite.get_fields(&mut driver, "item").unwrap();
        assert_eq!(fields.len(), 5);
        assert!(fields[0].primary_key);
        assert_eq!(fields[2].field_type, FieldType::Decimal);

        assert_eq!(Sqlite.get_table_record_count(&mut driver, "item").unwrap(), 1);
    }

    #[rstest]
    fn test_last_insert_id(mut driver: SqliteDriver) {
        driver
            .execute("INSERT INTO item (name) VALUES ('Sprocket')", &[])
            .unwrap();
        let id = Sqlite.last_insert_id(&mut driver, "item", "pkid").unwrap();
        assert_eq!(id, Some(Value::Int(2)));
    }

    #[rstest]
    fn test_escape_is_standard() {
        assert_eq!(Sqlite.escape(r"a'b\c"), r"'a''b\c'");
    }

    #[rstest]
    fn test_open_missing_directory_is_connect_failure() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no").join("such").join("dir.db");
        let err = Sqlite
            .open_connection(&ConnectInfo::sqlite(path.display().to_string()))
            .err()
            .unwrap();
        assert!(err.is_fatal());
    }
}
