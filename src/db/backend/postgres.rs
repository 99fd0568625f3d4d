//! PostgreSQL dialect and the synchronous `postgres` driver.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use postgres::types::{IsNull, ToSql, Type, private::BytesMut, to_sql_checked};
use postgres::{Client, NoTls, Row};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use tracing::{debug, info};

use super::Backend;
use crate::config::{BackendKind, ConnectInfo};
use crate::db::driver::{RawConnection, RawResult};
use crate::db::escape::escape_string_standard;
use crate::error::{DaboError, Result};
use crate::value::{ColumnInfo, FieldInfo, FieldType, Value};

/// PostgreSQL dialect.
#[derive(Debug, Clone, Copy, Default)]
pub struct Postgres;

impl Backend for Postgres {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgres
    }

    fn open_connection(&self, info: &ConnectInfo) -> Result<Box<dyn RawConnection>> {
        let conn_str = info
            .postgres_connection_string()
            .map_err(|e| DaboError::ConnectFailure {
                backend: "postgres".into(),
                database: info.database.clone(),
                message: e.to_string(),
            })?;
        Ok(Box::new(PostgresDriver::connect(&conn_str, &info.database)?))
    }

    fn escape(&self, s: &str) -> String {
        escape_string_standard(s)
    }

    fn bool_literal(&self, value: bool) -> &'static str {
        if value { "TRUE" } else { "FALSE" }
    }

    fn param_placeholder(&self, index: usize) -> String {
        format!("${}", index)
    }

    fn get_tables(&self, conn: &mut dyn RawConnection) -> Result<Vec<String>> {
        let result = conn.execute(
            "SELECT tablename FROM pg_tables WHERE schemaname = 'public' ORDER BY tablename",
            &[],
        )?;
        Ok(result
            .rows
            .iter()
            .filter_map(|row| row.first().and_then(Value::as_str).map(str::to_string))
            .collect())
    }

    fn get_fields(&self, conn: &mut dyn RawConnection, table: &str) -> Result<Vec<FieldInfo>> {
        let sql = format!(
            "SELECT c.column_name, c.data_type,
                    EXISTS (
                        SELECT 1 FROM information_schema.key_column_usage k
                        JOIN information_schema.table_constraints tc
                          ON tc.constraint_name = k.constraint_name
                         AND tc.constraint_type = 'PRIMARY KEY'
                        WHERE k.table_name = c.table_name
                          AND k.column_name = c.column_name
                    ) AS is_pk
             FROM information_schema.columns c
             WHERE c.table_name = {}
             ORDER BY c.ordinal_position",
            self.escape(table)
        );
        let result = conn.execute(&sql, &[])?;
        Ok(result
            .rows
            .iter()
            .filter_map(|row| {
                Some(FieldInfo {
                    name: row.first()?.as_str()?.to_string(),
                    field_type: FieldType::from_decl(row.get(1)?.as_str().unwrap_or_default()),
                    primary_key: row.get(2).and_then(Value::as_bool).unwrap_or(false),
                })
            })
            .collect())
    }

    fn last_insert_id(
        &self,
        conn: &mut dyn RawConnection,
        table: &str,
        key_field: &str,
    ) -> Result<Option<Value>> {
        // currval() on a column without a sequence would abort the transaction,
        // so look the sequence up first.
        let lookup = format!(
            "SELECT pg_get_serial_sequence({}, {})",
            self.escape(table),
            self.escape(key_field)
        );
        let sequence = conn.execute(&lookup, &[])?;
        let Some(Value::Text(sequence)) = sequence.scalar().cloned() else {
            return Ok(None);
        };
        let result = conn.execute(&format!("SELECT currval({})", self.escape(&sequence)), &[])?;
        Ok(result.scalar().cloned().filter(|v| !v.is_null()))
    }
}

/// `postgres::Client` speaking the driver contract.
pub struct PostgresDriver {
    client: Client,
}

impl PostgresDriver {
    pub fn connect(conn_str: &str, database: &str) -> Result<Self> {
        info!(database, "connecting to postgres");
        let client = Client::connect(conn_str, NoTls).map_err(|e| DaboError::ConnectFailure {
            backend: "postgres".into(),
            database: database.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self { client })
    }
}

impl RawConnection for PostgresDriver {
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<RawResult> {
        let stmt = self.client.prepare(sql).map_err(map_pg_error)?;
        let bound: Vec<&(dyn ToSql + Sync)> =
            params.iter().map(|v| v as &(dyn ToSql + Sync)).collect();

        if stmt.columns().is_empty() {
            let changed = self.client.execute(&stmt, &bound).map_err(map_pg_error)?;
            return Ok(RawResult::affected(changed));
        }

        let description: Vec<ColumnInfo> = stmt
            .columns()
            .iter()
            .map(|c| ColumnInfo::new(c.name(), field_type_for(c.type_())))
            .collect();

        let rows = self.client.query(&stmt, &bound).map_err(map_pg_error)?;
        let mut values = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut cells = Vec::with_capacity(description.len());
            for (idx, column) in stmt.columns().iter().enumerate() {
                cells.push(read_cell(row, idx, column.type_()).map_err(map_pg_error)?);
            }
            values.push(cells);
        }
        debug!(rows = values.len(), "postgres query fetched");

        Ok(RawResult {
            description,
            rows: values,
            rowcount: 0,
        })
    }

    fn execute_batch(&mut self, sql: &str) -> Result<()> {
        self.client.batch_execute(sql).map_err(map_pg_error)
    }
}

fn map_pg_error(e: postgres::Error) -> DaboError {
    let integrity = e
        .code()
        .map(|state| state.code().starts_with("23"))
        .unwrap_or(false);
    if integrity {
        DaboError::Integrity {
            message: e.to_string(),
        }
    } else {
        DaboError::backend(e.to_string())
    }
}

fn field_type_for(ty: &Type) -> FieldType {
    match *ty {
        Type::BOOL => FieldType::Bool,
        Type::INT2 | Type::INT4 | Type::INT8 => FieldType::Int,
        Type::FLOAT4 | Type::FLOAT8 => FieldType::Float,
        Type::NUMERIC => FieldType::Decimal,
        Type::DATE => FieldType::Date,
        Type::TIMESTAMP | Type::TIMESTAMPTZ => FieldType::DateTime,
        Type::TIME => FieldType::Time,
        Type::TEXT => FieldType::Memo,
        _ => FieldType::Char,
    }
}

fn read_cell(row: &Row, idx: usize, ty: &Type) -> std::result::Result<Value, postgres::Error> {
    let value = match *ty {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(Value::Bool),
        Type::INT2 => row.try_get::<_, Option<i16>>(idx)?.map(|v| Value::Int(v.into())),
        Type::INT4 => row.try_get::<_, Option<i32>>(idx)?.map(|v| Value::Int(v.into())),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(Value::Int),
        Type::FLOAT4 => row.try_get::<_, Option<f32>>(idx)?.map(|v| Value::Float(v.into())),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(Value::Float),
        Type::NUMERIC => row.try_get::<_, Option<Decimal>>(idx)?.map(Value::Decimal),
        Type::DATE => row.try_get::<_, Option<NaiveDate>>(idx)?.map(Value::Date),
        Type::TIMESTAMP => row.try_get::<_, Option<NaiveDateTime>>(idx)?.map(Value::DateTime),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(|v| Value::DateTime(v.naive_utc())),
        Type::TIME => row.try_get::<_, Option<NaiveTime>>(idx)?.map(Value::Time),
        _ => row.try_get::<_, Option<String>>(idx)?.map(Value::Text),
    };
    Ok(value.unwrap_or(Value::Null))
}

impl ToSql for Value {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut BytesMut,
    ) -> std::result::Result<IsNull, Box<dyn std::error::Error + Sync + Send>>
    where
        Self: Sized,
    {
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(b) => b.to_sql(ty, out),
            Value::Int(i) => match *ty {
                Type::INT2 => (*i as i16).to_sql(ty, out),
                Type::INT4 => (*i as i32).to_sql(ty, out),
                Type::FLOAT4 => (*i as f32).to_sql(ty, out),
                Type::FLOAT8 => (*i as f64).to_sql(ty, out),
                Type::NUMERIC => Decimal::from(*i).to_sql(ty, out),
                Type::TEXT | Type::VARCHAR => i.to_string().to_sql(ty, out),
                _ => i.to_sql(ty, out),
            },
            Value::Float(f) => match *ty {
                Type::FLOAT4 => (*f as f32).to_sql(ty, out),
                Type::NUMERIC => Decimal::try_from(*f)?.to_sql(ty, out),
                _ => f.to_sql(ty, out),
            },
            Value::Decimal(d) => match *ty {
                Type::FLOAT4 | Type::FLOAT8 => d.to_f64().unwrap_or_default().to_sql(ty, out),
                Type::INT8 => d.trunc().to_i64().unwrap_or_default().to_sql(ty, out),
                _ => d.to_sql(ty, out),
            },
            Value::Text(s) => s.to_sql(ty, out),
            Value::Date(d) => d.to_sql(ty, out),
            Value::DateTime(dt) => dt.to_sql(ty, out),
            Value::Time(t) => t.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}
