//! Field values, column types and column metadata.
//!
//! Every backend converts its native cells into [`Value`], and every SQL
//! literal the cursor emits is rendered from one. Column types come from the
//! backend's description of a result set and drive blank-row templates and
//! decimal quantization.

use std::cmp::Ordering;
use std::fmt;

use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, SubsecRound};
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};

/// A single field value.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Decimal(Decimal),
    Text(String),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    Time(NaiveTime),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// True for null, empty text, zero numbers and `false`.
    ///
    /// New rows only write fields that are non-blank or were explicitly changed.
    pub fn is_blank(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Bool(b) => !b,
            Value::Int(i) => *i == 0,
            Value::Float(f) => *f == 0.0,
            Value::Decimal(d) => d.is_zero(),
            Value::Text(s) => s.is_empty(),
            Value::Date(_) | Value::DateTime(_) | Value::Time(_) => false,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_) | Value::Decimal(_))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) => Some(*f as i64),
            Value::Decimal(d) => d.trunc().to_i64(),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Decimal(d) => d.to_f64(),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            Value::Decimal(d) => Some(*d),
            Value::Int(i) => Some(Decimal::from(*i)),
            Value::Float(f) => Decimal::try_from(*f).ok(),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_i64_or(&self, default: i64) -> i64 {
        self.as_i64().unwrap_or(default)
    }

    pub fn as_string_or(&self, default: &str) -> String {
        self.as_str().map_or_else(|| default.to_string(), str::to_string)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Decimal(_) => "decimal",
            Value::Text(_) => "text",
            Value::Date(_) => "date",
            Value::DateTime(_) => "datetime",
            Value::Time(_) => "time",
        }
    }

    /// Adapt an incoming value to the column it is written into.
    ///
    /// A decimal previously held in the field keeps its exponent: the incoming
    /// value is quantized to the same scale. Decimal columns without a previous
    /// decimal use the column's declared scale.
    pub fn conform(self, previous: &Value, column: Option<&ColumnInfo>) -> Value {
        if let Value::Decimal(prev) = previous {
            return match self.as_decimal() {
                Some(d) => Value::Decimal(quantize(d, prev.scale())),
                None => self,
            };
        }
        match column {
            Some(col) if col.field_type == FieldType::Decimal => match self.as_decimal() {
                Some(d) => Value::Decimal(match col.scale {
                    Some(scale) => quantize(d, scale),
                    None => d,
                }),
                None => self,
            },
            _ => self,
        }
    }

    /// Convert text read from a backend into the column's type.
    ///
    /// Text that does not parse as the declared type is kept as text.
    pub fn from_text(text: String, column: &ColumnInfo) -> Value {
        let trimmed = text.trim();
        let parsed = match column.field_type {
            FieldType::Date => parse_date(trimmed).map(Value::Date),
            FieldType::DateTime => parse_datetime(trimmed).map(Value::DateTime),
            FieldType::Time => parse_time(trimmed).map(Value::Time),
            FieldType::Decimal => trimmed
                .parse::<Decimal>()
                .ok()
                .map(|d| Value::Decimal(column.scale.map_or(d, |s| quantize(d, s)))),
            FieldType::Int => trimmed.parse().ok().map(Value::Int),
            FieldType::Float => trimmed.parse().ok().map(Value::Float),
            FieldType::Bool => match trimmed.to_ascii_lowercase().as_str() {
                "1" | "t" | "true" | "y" | "yes" => Some(Value::Bool(true)),
                "0" | "f" | "false" | "n" | "no" => Some(Value::Bool(false)),
                _ => None,
            },
            FieldType::Char | FieldType::Memo => None,
        };
        parsed.unwrap_or(Value::Text(text))
    }

    /// Ordering used by sort and seek. Nulls sort first; numbers compare
    /// across int, float and decimal.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Date(a), Value::Date(b)) => a.cmp(b),
            (Value::DateTime(a), Value::DateTime(b)) => a.cmp(b),
            (Value::Time(a), Value::Time(b)) => a.cmp(b),
            (Value::Decimal(a), Value::Decimal(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (a, b) if a.is_numeric() && b.is_numeric() => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
                _ => Ordering::Equal,
            },
            (a, b) => a.to_string().cmp(&b.to_string()),
        }
    }

    /// Equality that treats `1`, `1.0` and decimal `1.00` as the same key.
    pub fn loose_eq(&self, other: &Value) -> bool {
        if self.is_numeric() && other.is_numeric() {
            self.compare(other) == Ordering::Equal
        } else {
            self == other
        }
    }
}

fn quantize(mut d: Decimal, scale: u32) -> Decimal {
    d.rescale(scale);
    d
}

fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .or_else(|| parse_datetime(s).map(|dt| dt.date()))
}

fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn parse_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .ok()
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Decimal(d) => write!(f, "{}", d),
            Value::Text(s) => f.write_str(s),
            Value::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Value::DateTime(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M:%S%.f")),
            Value::Time(t) => write!(f, "{}", t.format("%H:%M:%S%.f")),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Decimal> for Value {
    fn from(d: Decimal) -> Self {
        Value::Decimal(d)
    }
}

impl From<NaiveDate> for Value {
    fn from(d: NaiveDate) -> Self {
        Value::Date(d)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(dt: NaiveDateTime) -> Self {
        Value::DateTime(dt)
    }
}

impl From<NaiveTime> for Value {
    fn from(t: NaiveTime) -> Self {
        Value::Time(t)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map_or(Value::Null, Into::into)
    }
}

/// Column type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    #[default]
    Char,
    Memo,
    Int,
    Float,
    Decimal,
    Bool,
    Date,
    DateTime,
    Time,
}

impl FieldType {
    /// Parse a type name as written in field specs.
    pub fn from_name(name: &str) -> Option<FieldType> {
        let ty = match name.trim().to_ascii_lowercase().as_str() {
            "char" | "string" | "varchar" | "c" => FieldType::Char,
            "memo" | "text" | "m" => FieldType::Memo,
            "int" | "integer" | "long" | "i" => FieldType::Int,
            "float" | "real" | "double" | "f" => FieldType::Float,
            "decimal" | "numeric" | "money" | "n" => FieldType::Decimal,
            "bool" | "boolean" | "logical" | "l" => FieldType::Bool,
            "date" | "d" => FieldType::Date,
            "datetime" | "timestamp" | "t" => FieldType::DateTime,
            "time" => FieldType::Time,
            _ => return None,
        };
        Some(ty)
    }

    /// Classify a declared SQL column type, e.g. `VARCHAR(40)` or `DECIMAL(10,2)`.
    pub fn from_decl(decl: &str) -> FieldType {
        let base = decl
            .split('(')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_uppercase();
        if base.contains("DATETIME") || base.contains("TIMESTAMP") {
            FieldType::DateTime
        } else if base.contains("DATE") {
            FieldType::Date
        } else if base.contains("TIME") {
            FieldType::Time
        } else if base.contains("BOOL") {
            FieldType::Bool
        } else if base.contains("INT") || base == "SERIAL" || base == "BIGSERIAL" {
            FieldType::Int
        } else if base.contains("DEC") || base.contains("NUMERIC") || base.contains("MONEY") {
            FieldType::Decimal
        } else if base.contains("REAL") || base.contains("FLOA") || base.contains("DOUB") {
            FieldType::Float
        } else if base == "TEXT" || base.contains("CLOB") || base.contains("MEMO") || base.contains("BLOB") {
            FieldType::Memo
        } else {
            FieldType::Char
        }
    }

    pub fn is_string(&self) -> bool {
        matches!(self, FieldType::Char | FieldType::Memo)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, FieldType::Int | FieldType::Float | FieldType::Decimal)
    }

    /// Value a freshly added row starts with.
    pub fn blank(&self, scale: Option<u32>) -> Value {
        match self {
            FieldType::Char | FieldType::Memo => Value::Text(String::new()),
            FieldType::Int => Value::Int(0),
            FieldType::Float => Value::Float(0.0),
            FieldType::Decimal => Value::Decimal(quantize(Decimal::ZERO, scale.unwrap_or(0))),
            FieldType::Bool => Value::Bool(false),
            FieldType::Date => Value::Date(Local::now().date_naive()),
            FieldType::DateTime => Value::DateTime(Local::now().naive_local().trunc_subsecs(0)),
            FieldType::Time => Value::Null,
        }
    }
}

/// One entry of a result-set description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub field_type: FieldType,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            precision: None,
            scale: None,
        }
    }

    /// Build from a declared SQL type, picking up `(precision, scale)` when present.
    pub fn from_decl(name: impl Into<String>, decl: &str) -> Self {
        let mut args = decl
            .split_once('(')
            .map(|(_, rest)| rest.trim_end_matches(')'))
            .unwrap_or_default()
            .split(',')
            .filter_map(|part| part.trim().parse::<u32>().ok());
        Self {
            name: name.into(),
            field_type: FieldType::from_decl(decl),
            precision: args.next(),
            scale: args.next(),
        }
    }

    pub fn with_scale(mut self, precision: u32, scale: u32) -> Self {
        self.precision = Some(precision);
        self.scale = Some(scale);
        self
    }

    pub fn blank(&self) -> Value {
        self.field_type.blank(self.scale)
    }
}

/// A table column as reported by backend introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldInfo {
    pub name: String,
    pub field_type: FieldType,
    pub primary_key: bool,
}
