//! Firebird dialect.
//!
//! No Firebird driver is bundled; attach one that implements
//! [`RawConnection`] with [`Connection::with_driver`](crate::db::Connection::with_driver).

use super::{Backend, push_clauses};
use crate::config::{BackendKind, ConnectInfo};
use crate::db::driver::RawConnection;
use crate::db::escape::{escape_string_standard, quote_identifier};
use crate::error::{DaboError, Result};
use crate::sql_builder::SelectParts;
use crate::value::{ColumnInfo, FieldInfo, FieldType, Value};

#[derive(Debug, Clone, Copy, Default)]
pub struct Firebird;

impl Backend for Firebird {
    fn kind(&self) -> BackendKind {
        BackendKind::Firebird
    }

    fn open_connection(&self, info: &ConnectInfo) -> Result<Box<dyn RawConnection>> {
        Err(DaboError::ConnectFailure {
            backend: "firebird".into(),
            database: info.database.clone(),
            message: "no firebird driver is available; attach one with Connection::with_driver"
                .into(),
        })
    }

    fn escape(&self, s: &str) -> String {
        escape_string_standard(s)
    }

    /// Quote and upper-case each part: `customer.name` → `"CUSTOMER"."NAME"`.
    fn format_field(&self, name: &str) -> String {
        name.split('.')
            .map(|part| quote_identifier(&part.to_uppercase()))
            .collect::<Vec<_>>()
            .join(".")
    }

    fn limit_keyword(&self) -> &'static str {
        "FIRST"
    }

    fn compose_select(&self, parts: &SelectParts) -> String {
        let mut sql = match &parts.limit {
            Some(limit) => format!("SELECT {} {} {}", self.limit_keyword(), limit, parts.fields),
            None => format!("SELECT {}", parts.fields),
        };
        sql.push_str("\nFROM ");
        sql.push_str(&parts.from);
        push_clauses(&mut sql, parts);
        sql
    }

    fn get_tables(&self, conn: &mut dyn RawConnection) -> Result<Vec<String>> {
        let result = conn.execute(
            "SELECT RDB$RELATION_NAME FROM RDB$RELATIONS \
             WHERE RDB$SYSTEM_FLAG = 0 ORDER BY RDB$RELATION_NAME",
            &[],
        )?;
        Ok(result
            .rows
            .iter()
            .filter_map(|row| row.first().and_then(Value::as_str))
            .map(|name| name.trim().to_lowercase())
            .collect())
    }

    fn get_fields(&self, conn: &mut dyn RawConnection, table: &str) -> Result<Vec<FieldInfo>> {
        let table = self.escape(&table.to_uppercase());
        let sql = format!(
            "SELECT rf.RDB$FIELD_NAME, f.RDB$FIELD_TYPE, f.RDB$FIELD_SCALE,
                    (SELECT COUNT(*) FROM RDB$RELATION_CONSTRAINTS rc
                       JOIN RDB$INDEX_SEGMENTS s ON s.RDB$INDEX_NAME = rc.RDB$INDEX_NAME
                      WHERE rc.RDB$RELATION_NAME = rf.RDB$RELATION_NAME
                        AND rc.RDB$CONSTRAINT_TYPE = 'PRIMARY KEY'
                        AND s.RDB$FIELD_NAME = rf.RDB$FIELD_NAME)
             FROM RDB$RELATION_FIELDS rf
             JOIN RDB$FIELDS f ON f.RDB$FIELD_NAME = rf.RDB$FIELD_SOURCE
             WHERE rf.RDB$RELATION_NAME = {}
             ORDER BY rf.RDB$FIELD_POSITION",
            table
        );
        let result = conn.execute(&sql, &[])?;
        Ok(result
            .rows
            .iter()
            .filter_map(|row| {
                let name = row.first()?.as_str()?.trim().to_lowercase();
                let code = row.get(1).and_then(Value::as_i64).unwrap_or(0);
                let scale = row.get(2).and_then(Value::as_i64).unwrap_or(0);
                Some(FieldInfo {
                    name,
                    field_type: field_type_for(code, scale),
                    primary_key: row.get(3).and_then(Value::as_i64).unwrap_or(0) > 0,
                })
            })
            .collect())
    }

    fn begin_transaction(&self, conn: &mut dyn RawConnection) -> Result<()> {
        conn.execute_batch("SET TRANSACTION")
    }

    fn pregenerate_primary_key(
        &self,
        conn: &mut dyn RawConnection,
        table: &str,
        _key_field: &str,
    ) -> Result<Option<Value>> {
        let sql = format!(
            "SELECT GEN_ID(GEN_{}, 1) FROM RDB$DATABASE",
            table.to_uppercase()
        );
        let result = conn.execute(&sql, &[])?;
        Ok(result.scalar().cloned().filter(|v| !v.is_null()))
    }

    fn massage_description(&self, description: &mut [ColumnInfo]) {
        for column in description {
            column.name = column.name.to_lowercase();
        }
    }

    fn flush(&self, conn: &mut dyn RawConnection, in_transaction: bool) -> Result<()> {
        if in_transaction {
            Ok(())
        } else {
            conn.execute_batch("COMMIT")
        }
    }

    fn no_results_on_save(&self) -> bool {
        true
    }

    fn no_results_on_delete(&self) -> bool {
        true
    }
}

/// Map an `RDB$FIELD_TYPE` code; scaled integers are fixed-point decimals.
fn field_type_for(code: i64, scale: i64) -> FieldType {
    match code {
        7 | 8 | 16 if scale < 0 => FieldType::Decimal,
        7 | 8 | 16 => FieldType::Int,
        10 | 27 => FieldType::Float,
        12 => FieldType::Date,
        13 => FieldType::Time,
        35 => FieldType::DateTime,
        23 => FieldType::Bool,
        261 => FieldType::Memo,
        _ => FieldType::Char,
    }
}
