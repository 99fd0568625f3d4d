//! DML text and the zero-row structure query.

use std::sync::LazyLock;

use regex::Regex;

use crate::db::Backend;
use crate::value::Value;

static WHERE_CLAUSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)\bwhere\b(.*?)(\bgroup\s+by\b|\border\s+by\b|\blimit\b|$)")
        .expect("valid where regex")
});

static TRAILING_CLAUSE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)\b(group\s+by|order\s+by|limit)\b").expect("valid clause regex")
});

/// `a=1 AND b='x'` for the given key fields and their stored values.
pub fn pk_predicate(backend: &dyn Backend, fields: &[&str], values: &[Value]) -> String {
    fields
        .iter()
        .zip(values)
        .map(|(field, value)| {
            let field = backend.format_field(field);
            if value.is_null() {
                format!("{} IS NULL", field)
            } else {
                format!("{}={}", field, backend.format_value(value))
            }
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

pub fn update_sql(
    backend: &dyn Backend,
    table: &str,
    assignments: &[(&str, &Value)],
    predicate: &str,
) -> String {
    let set = assignments
        .iter()
        .map(|(field, value)| {
            format!("{} = {}", backend.format_field(field), backend.format_value(value))
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "UPDATE {} SET {} WHERE {}",
        backend.format_field(table),
        set,
        predicate
    )
}

pub fn insert_sql(backend: &dyn Backend, table: &str, columns: &[(&str, &Value)]) -> String {
    let table = backend.format_field(table);
    if columns.is_empty() {
        return format!("INSERT INTO {} DEFAULT VALUES", table);
    }
    let names = columns
        .iter()
        .map(|(field, _)| backend.format_field(field))
        .collect::<Vec<_>>()
        .join(", ");
    let values = columns
        .iter()
        .map(|(_, value)| backend.format_value(value))
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO {} ({}) VALUES ({})", table, names, values)
}

pub fn delete_sql(backend: &dyn Backend, table: &str, predicate: &str) -> String {
    format!("DELETE FROM {} WHERE {}", backend.format_field(table), predicate)
}

/// Rewrite opaque SQL so it returns no rows but keeps its columns.
///
/// An existing WHERE becomes `WHERE 1=0 AND (...)`; otherwise `WHERE 1=0` goes
/// in front of GROUP BY, ORDER BY or LIMIT, or at the end.
pub fn structure_sql(sql: &str) -> String {
    rewrite_where(sql, |body| match body {
        Some(body) => format!("1=0 AND ({})", body),
        None => "1=0".to_string(),
    })
}

/// Restrict opaque SQL to rows matching `predicate`.
///
/// An existing WHERE becomes `WHERE (...) AND predicate`, keeping any
/// placeholders in the original text ahead of the new one.
pub fn link_sql(sql: &str, predicate: &str) -> String {
    rewrite_where(sql, |body| match body {
        Some(body) => format!("({}) AND {}", body, predicate),
        None => predicate.to_string(),
    })
}

fn rewrite_where(sql: &str, condition: impl Fn(Option<&str>) -> String) -> String {
    let sql = sql.trim().trim_end_matches(';');
    if let Some(caps) = WHERE_CLAUSE.captures(sql) {
        let (Some(whole), Some(body)) = (caps.get(0), caps.get(1)) else {
            return sql.to_string();
        };
        let tail = caps.get(2).map_or("", |m| m.as_str());
        let mut patched = format!("WHERE {}", condition(Some(body.as_str().trim())));
        if !tail.is_empty() {
            patched.push(' ');
            patched.push_str(tail);
        }
        return format!("{}{}{}", &sql[..whole.start()], patched, &sql[whole.end()..]);
    }
    match TRAILING_CLAUSE.find(sql) {
        Some(m) => format!(
            "{}WHERE {} {}",
            &sql[..m.start()],
            condition(None),
            &sql[m.start()..]
        ),
        None => format!("{} WHERE {}", sql, condition(None)),
    }
}
