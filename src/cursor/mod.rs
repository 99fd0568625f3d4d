//! The cursor engine: one navigable, mutable result set with change tracking.
//!
//! A [`Cursor`] buffers the rows of one SELECT, keeps a current position,
//! records per-row mementos and synthesizes INSERT/UPDATE/DELETE text for the
//! rows that changed. SELECTs are parameterized; DML is literalized through
//! the connection's dialect.
//!
//! Every operation returns a [`Code`]. Statement failures are captured into the
//! cursor's [`ErrorLog`]; only connection failures come back as `Err`.

mod row;
mod sql;

pub use row::Row;
pub use sql::{delete_sql, insert_sql, link_sql, pk_predicate, structure_sql, update_sql};

use std::collections::BTreeMap;
use std::rc::Rc;

use serde_json::{Map, Value as JsonValue, json};
use tracing::{debug, warn};

use crate::constants::{Code, MEMENTO, NEW_RECORD_FLAG};
use crate::db::{Connection, RawResult};
use crate::error::{DaboError, ErrorLog, Result};
use crate::sql_builder::SqlBuilder;
use crate::value::{ColumnInfo, Value};

/// Direction of an in-memory sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Child-side link: rows are restricted to `field = value`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkFilter {
    pub field: String,
    pub value: Value,
}

/// A row written during the current save cycle and its state beforehand.
#[derive(Debug, Clone)]
struct PendingSave {
    row: usize,
    prior: Row,
}

pub struct Cursor {
    conn: Rc<Connection>,
    table: String,
    key_field: String,
    sql: Option<String>,
    builder: SqlBuilder,
    params: Vec<Value>,
    link: Option<LinkFilter>,
    description: Vec<ColumnInfo>,
    rows: Vec<Row>,
    row_number: Option<usize>,
    non_update_fields: Vec<String>,
    auto_populate_pk: bool,
    sort: Option<(String, SortOrder)>,
    pending: Vec<PendingSave>,
    errors: ErrorLog,
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("table", &self.table)
            .field("key_field", &self.key_field)
            .field("rows", &self.rows.len())
            .field("row_number", &self.row_number)
            .finish_non_exhaustive()
    }
}

impl Cursor {
    pub fn new(conn: Rc<Connection>) -> Self {
        Self {
            conn,
            table: String::new(),
            key_field: String::new(),
            sql: None,
            builder: SqlBuilder::new(),
            params: Vec::new(),
            link: None,
            description: Vec::new(),
            rows: Vec::new(),
            row_number: None,
            non_update_fields: Vec::new(),
            auto_populate_pk: true,
            sort: None,
            pending: Vec::new(),
            errors: ErrorLog::new(),
        }
    }

    // ---------------------------------------------------------------------
    // Configuration
    // ---------------------------------------------------------------------

    pub fn connection(&self) -> &Rc<Connection> {
        &self.conn
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn set_table(&mut self, table: &str) {
        self.table = table.to_string();
    }

    /// Key field name(s), comma separated for composite keys.
    pub fn key_field(&self) -> &str {
        &self.key_field
    }

    pub fn set_key_field(&mut self, key_field: &str) {
        self.key_field = key_field.to_string();
    }

    pub fn key_fields(&self) -> Vec<&str> {
        self.key_field
            .split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .collect()
    }

    /// Use opaque SQL instead of the builder.
    pub fn set_sql(&mut self, sql: &str) {
        self.sql = Some(sql.to_string());
    }

    pub fn clear_sql(&mut self) {
        self.sql = None;
    }

    pub fn builder(&self) -> &SqlBuilder {
        &self.builder
    }

    pub fn builder_mut(&mut self) -> &mut SqlBuilder {
        &mut self.builder
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn set_params(&mut self, params: Vec<Value>) {
        self.params = params;
    }

    pub fn link(&self) -> Option<&LinkFilter> {
        self.link.as_ref()
    }

    pub fn set_link(&mut self, field: &str, value: Value) {
        self.link = Some(LinkFilter {
            field: field.to_string(),
            value,
        });
    }

    pub fn set_link_value(&mut self, value: Value) {
        if let Some(link) = &mut self.link {
            link.value = value;
        }
    }

    pub fn clear_link(&mut self) {
        self.link = None;
    }

    pub fn non_update_fields(&self) -> &[String] {
        &self.non_update_fields
    }

    pub fn set_non_update_fields(&mut self, fields: Vec<String>) {
        self.non_update_fields = fields;
    }

    pub fn auto_populate_pk(&self) -> bool {
        self.auto_populate_pk
    }

    pub fn set_auto_populate_pk(&mut self, on: bool) {
        self.auto_populate_pk = on;
    }

    /// SELECT text and parameters the next requery will run.
    pub fn current_sql(&self) -> (String, Vec<Value>) {
        let backend = self.conn.backend();
        let mut params = self.params.clone();
        let mut extras = Vec::new();
        if let Some(link) = &self.link {
            params.push(link.value.clone());
            extras.push(format!(
                "{} = {}",
                backend.format_field(&link.field),
                backend.param_placeholder(params.len())
            ));
        }
        match &self.sql {
            Some(sql) => match extras.first() {
                Some(predicate) => (link_sql(sql, predicate), params),
                None => (sql.clone(), params),
            },
            None => (self.builder.get_sql_with(backend, &self.table, &extras), params),
        }
    }

    // ---------------------------------------------------------------------
    // State
    // ---------------------------------------------------------------------

    pub fn description(&self) -> &[ColumnInfo] {
        &self.description
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.description.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.description
            .iter()
            .position(|c| c.name == name)
            .or_else(|| {
                self.description
                    .iter()
                    .position(|c| c.name.eq_ignore_ascii_case(name))
            })
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Current position; `None` when the buffer is empty.
    pub fn row_number(&self) -> Option<usize> {
        self.row_number
    }

    pub fn current_row(&self) -> Option<&Row> {
        self.row_number.and_then(|n| self.rows.get(n))
    }

    pub fn errors(&self) -> &ErrorLog {
        &self.errors
    }

    pub fn clear_errors(&mut self) {
        self.errors.clear();
    }

    pub fn is_adding(&self) -> bool {
        self.current_row().is_some_and(Row::is_new)
    }

    pub fn is_changed(&self) -> bool {
        self.rows.iter().any(Row::is_changed)
    }

    pub fn is_row_changed(&self, row: usize) -> bool {
        self.rows.get(row).is_some_and(Row::is_changed)
    }

    pub fn changed_rows(&self) -> Vec<usize> {
        (0..self.rows.len())
            .filter(|&n| self.rows[n].is_changed())
            .collect()
    }

    /// Snapshot the current row's values into its memento.
    pub fn set_memento(&mut self) {
        if let Some(row) = self.current_row_mut() {
            row.set_memento();
        }
    }

    /// Snapshot the current row only if it has no memento yet.
    pub fn ensure_memento(&mut self) {
        if let Some(row) = self.current_row_mut() {
            row.ensure_memento();
        }
    }

    fn current_row_mut(&mut self) -> Option<&mut Row> {
        self.row_number.and_then(|n| self.rows.get_mut(n))
    }

    // ---------------------------------------------------------------------
    // Field access
    // ---------------------------------------------------------------------

    pub fn get_field_val(&self, name: &str) -> Option<&Value> {
        let idx = self.field_index(name)?;
        self.current_row()?.get(idx)
    }

    /// Like [`get_field_val`](Self::get_field_val) but reports why no value exists.
    pub fn try_get_field_val(&self, name: &str) -> Result<&Value> {
        let row = self.current_row().ok_or(DaboError::NoRecords)?;
        let idx = self.field_index(name).ok_or_else(|| DaboError::FieldNotFound {
            name: name.to_string(),
        })?;
        row.get(idx).ok_or(DaboError::FieldNotFound {
            name: name.to_string(),
        })
    }

    pub fn get_field_val_at(&self, row: usize, name: &str) -> Option<&Value> {
        let idx = self.field_index(name)?;
        self.rows.get(row)?.get(idx)
    }

    /// Write a field of the current row, conformed to the column type.
    pub fn set_field_val(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        let row = self.row_number.ok_or(DaboError::NoRecords)?;
        self.set_field_val_at(row, name, value)
    }

    pub fn set_field_val_at(&mut self, row: usize, name: &str, value: impl Into<Value>) -> Result<()> {
        let idx = self.field_index(name).ok_or_else(|| DaboError::FieldNotFound {
            name: name.to_string(),
        })?;
        let column = &self.description[idx];
        let row = self.rows.get_mut(row).ok_or(DaboError::NoRecords)?;
        let previous = row.get(idx).cloned().unwrap_or_default();
        row.set(idx, value.into().conform(&previous, Some(column)));
        Ok(())
    }

    /// Set a field on every row.
    pub fn replace(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        for row in 0..self.rows.len() {
            self.set_field_val_at(row, name, value.clone())?;
        }
        Ok(())
    }

    /// First key component of the current row.
    pub fn get_pk(&self) -> Option<Value> {
        let field = *self.key_fields().first()?;
        self.get_field_val(field).cloned()
    }

    /// Every key component of the current row.
    pub fn get_pk_values(&self) -> Vec<Value> {
        self.key_fields()
            .into_iter()
            .filter_map(|f| self.get_field_val(f).cloned())
            .collect()
    }

    // ---------------------------------------------------------------------
    // Navigation
    // ---------------------------------------------------------------------

    pub fn first(&mut self) -> Code {
        self.errors.clear();
        if self.rows.is_empty() {
            return Code::FileNoRecords;
        }
        self.row_number = Some(0);
        Code::FileOk
    }

    pub fn prior(&mut self) -> Code {
        self.errors.clear();
        match self.row_number {
            None => Code::FileNoRecords,
            Some(0) => Code::FileBof,
            Some(n) => {
                self.row_number = Some(n - 1);
                Code::FileOk
            }
        }
    }

    pub fn next(&mut self) -> Code {
        self.errors.clear();
        match self.row_number {
            None => Code::FileNoRecords,
            Some(n) if n + 1 >= self.rows.len() => Code::FileEof,
            Some(n) => {
                self.row_number = Some(n + 1);
                Code::FileOk
            }
        }
    }

    pub fn last(&mut self) -> Code {
        self.errors.clear();
        if self.rows.is_empty() {
            return Code::FileNoRecords;
        }
        self.row_number = Some(self.rows.len() - 1);
        Code::FileOk
    }

    pub fn move_to_row(&mut self, row: usize) -> Code {
        self.errors.clear();
        if self.rows.is_empty() {
            Code::FileNoRecords
        } else if row >= self.rows.len() {
            Code::FileEof
        } else {
            self.row_number = Some(row);
            Code::FileOk
        }
    }

    /// Move to the first row whose first key component equals `value`.
    pub fn move_to_pk(&mut self, value: &Value) -> Code {
        self.errors.clear();
        let Some(field) = self.key_fields().first().and_then(|f| self.field_index(f)) else {
            return Code::FileNoRecords;
        };
        match self
            .rows
            .iter()
            .position(|row| row.get(field).is_some_and(|v| v.loose_eq(value)))
        {
            Some(n) => {
                self.row_number = Some(n);
                Code::FileOk
            }
            None => Code::FileNoRecords,
        }
    }

    /// Move to the first row whose `field` matches `value`.
    ///
    /// Text compares case-insensitively unless `case_sensitive`. With `near`,
    /// a miss moves to the first row whose value is not less than `value`.
    /// Returns the row moved to.
    pub fn seek(
        &mut self,
        field: &str,
        value: &Value,
        case_sensitive: bool,
        near: bool,
    ) -> Result<Option<usize>> {
        self.errors.clear();
        let idx = self.field_index(field).ok_or_else(|| DaboError::FieldNotFound {
            name: field.to_string(),
        })?;
        let fold = |v: &Value| match v {
            Value::Text(s) if !case_sensitive => Value::Text(s.to_lowercase()),
            other => other.clone(),
        };
        let target = fold(value);
        let cells: Vec<Value> = self
            .rows
            .iter()
            .map(|row| row.get(idx).map(fold).unwrap_or_default())
            .collect();

        let found = cells
            .iter()
            .position(|cell| cell.loose_eq(&target))
            .or_else(|| {
                near.then(|| {
                    cells
                        .iter()
                        .position(|cell| cell.compare(&target) != std::cmp::Ordering::Less)
                })
                .flatten()
            });
        if let Some(n) = found {
            self.row_number = Some(n);
        }
        Ok(found)
    }

    /// Stable in-memory sort; the current row stays current.
    pub fn sort(&mut self, field: &str, order: SortOrder) -> Result<()> {
        let idx = self.field_index(field).ok_or_else(|| DaboError::FieldNotFound {
            name: field.to_string(),
        })?;
        self.sort = Some((field.to_string(), order));
        self.apply_sort(idx, order);
        Ok(())
    }

    pub fn clear_sort(&mut self) {
        self.sort = None;
    }

    fn apply_sort(&mut self, idx: usize, order: SortOrder) {
        let mut positions: Vec<usize> = (0..self.rows.len()).collect();
        positions.sort_by(|&a, &b| {
            let ordering = self.rows[a]
                .get(idx)
                .unwrap_or(&Value::Null)
                .compare(self.rows[b].get(idx).unwrap_or(&Value::Null));
            match order {
                SortOrder::Asc => ordering,
                SortOrder::Desc => ordering.reverse(),
            }
        });
        let current = self
            .row_number
            .and_then(|n| positions.iter().position(|&p| p == n));
        let mut old: Vec<Option<Row>> = std::mem::take(&mut self.rows).into_iter().map(Some).collect();
        self.rows = positions.iter().filter_map(|&p| old[p].take()).collect();
        self.row_number = current;
    }

    // ---------------------------------------------------------------------
    // Requery and structure
    // ---------------------------------------------------------------------

    /// Run the current SELECT and replace the buffer.
    pub fn requery(&mut self) -> Result<Code> {
        self.errors.clear();
        let (sql, params) = self.current_sql();
        match self.conn.execute(&sql, &params) {
            Ok(result) => {
                self.load(result);
                if let Some((field, order)) = self.sort.clone() {
                    if let Some(idx) = self.field_index(&field) {
                        self.apply_sort(idx, order);
                        self.row_number = (!self.rows.is_empty()).then_some(0);
                    }
                }
                Ok(Code::RequerySuccess)
            }
            Err(e) => self.capture(e, Code::RequeryError),
        }
    }

    fn load(&mut self, result: RawResult) {
        self.description = result.description;
        self.rows = result.rows.into_iter().map(Row::loaded).collect();
        self.row_number = (!self.rows.is_empty()).then_some(0);
        self.pending.clear();
    }

    /// Populate the description without fetching data.
    pub fn set_structure(&mut self) -> Result<Code> {
        self.errors.clear();
        let backend = self.conn.backend();
        let (sql, params) = match &self.sql {
            Some(_) => {
                let (sql, params) = self.current_sql();
                (structure_sql(&sql), params)
            }
            None => (
                self.builder
                    .get_sql_with(backend, &self.table, &["1=0".to_string()]),
                self.params.clone(),
            ),
        };
        match self.conn.execute(&sql, &params) {
            Ok(result) => {
                self.load(result);
                Ok(Code::RequerySuccess)
            }
            Err(e) => self.capture(e, Code::RequeryError),
        }
    }

    // ---------------------------------------------------------------------
    // Mutation
    // ---------------------------------------------------------------------

    /// Append a blank row and make it current.
    pub fn new_record(&mut self) -> Result<Code> {
        self.errors.clear();
        if self.description.is_empty() {
            self.set_structure()?;
        }
        if self.description.is_empty() {
            self.errors.push(
                self.table.clone(),
                Code::FileCancel,
                "Cannot add a record: the data set has no structure",
            );
            return Ok(Code::FileCancel);
        }
        self.rows.push(Row::blank(&self.description));
        self.row_number = Some(self.rows.len() - 1);
        Ok(Code::FileOk)
    }

    /// Undo changes to the current row, or to every row.
    ///
    /// New rows are discarded; existing rows get their memento back.
    pub fn cancel(&mut self, all_rows: bool) -> Code {
        self.errors.clear();
        let targets: Vec<usize> = if all_rows {
            self.changed_rows()
        } else {
            self.row_number
                .filter(|&n| self.is_row_changed(n))
                .into_iter()
                .collect()
        };
        for &n in targets.iter().rev() {
            if self.rows[n].is_new() {
                self.remove_row(n);
            } else {
                self.rows[n].revert();
            }
        }
        Code::FileOk
    }

    fn remove_row(&mut self, n: usize) {
        self.rows.remove(n);
        self.row_number = match self.row_number {
            _ if self.rows.is_empty() => None,
            Some(current) if current > n => Some(current - 1),
            Some(current) => Some(current.min(self.rows.len() - 1)),
            None => None,
        };
    }

    /// Delete the current row.
    ///
    /// New rows are discarded in memory. Persisted rows are deleted on the
    /// backend right away, inside a transaction the cursor opens when none is
    /// active.
    pub fn delete(&mut self) -> Result<Code> {
        self.errors.clear();
        let Some(n) = self.row_number else {
            return Ok(Code::FileNoRecords);
        };
        if self.rows[n].is_new() {
            self.remove_row(n);
            return Ok(Code::FileOk);
        }
        let Some(predicate) = self.row_predicate(n) else {
            return Ok(Code::FileCancel);
        };
        let sql = delete_sql(self.conn.backend(), &self.table, &predicate);

        let opened = self.conn.begin()?;
        let affected = match self.conn.execute(&sql, &[]) {
            Ok(result) => result.rowcount,
            Err(e) => {
                if opened {
                    self.conn.rollback()?;
                }
                return self.capture(e, Code::FileCancel);
            }
        };
        if opened {
            if let Err(e) = self.conn.commit() {
                return self.capture(e, Code::FileCancel);
            }
        }
        if let Err(e) = self.conn.flush() {
            return self.capture(e, Code::FileCancel);
        }

        self.remove_row(n);
        if affected == 0 && !self.conn.backend().no_results_on_delete() {
            debug!(table = %self.table, "delete affected no rows");
            return Ok(Code::UpdateNoRows);
        }
        Ok(Code::FileOk)
    }

    /// Delete every row, in one transaction when none is active.
    pub fn delete_all(&mut self) -> Result<Code> {
        let opened = self.conn.begin()?;
        while !self.rows.is_empty() {
            self.row_number = Some(0);
            let code = self.delete()?;
            if !matches!(code, Code::FileOk | Code::UpdateNoRows) {
                if opened {
                    self.conn.rollback()?;
                }
                return Ok(code);
            }
        }
        if opened {
            if let Err(e) = self.conn.commit() {
                return self.capture(e, Code::FileCancel);
            }
        }
        Ok(Code::FileOk)
    }

    /// Write changes and confirm them.
    ///
    /// Opens a transaction when none is active so that an all-rows save is
    /// atomic. Saving with nothing changed issues no SQL.
    pub fn save(&mut self, all_rows: bool) -> Result<Code> {
        self.errors.clear();
        if self.rows_to_save(all_rows).is_empty() {
            return Ok(Code::FileOk);
        }
        let opened = self.conn.begin()?;
        let code = self.write_changes(all_rows)?;
        if code == Code::FileOk {
            if opened {
                if let Err(e) = self.conn.commit() {
                    self.abandon_saved();
                    return self.capture(e, Code::FileCancel);
                }
            }
            self.confirm_saved();
        } else {
            if opened {
                self.conn.rollback()?;
            }
            self.abandon_saved();
        }
        Ok(code)
    }

    /// Rows a save with this scope would write.
    pub fn rows_to_save(&self, all_rows: bool) -> Vec<usize> {
        if all_rows {
            self.changed_rows()
        } else {
            self.row_number
                .filter(|&n| self.is_row_changed(n))
                .into_iter()
                .collect()
        }
    }

    /// Issue INSERT/UPDATE for changed rows without touching their mementos.
    ///
    /// The caller owns the transaction and must finish the cycle with
    /// [`confirm_saved`](Self::confirm_saved) after commit or
    /// [`abandon_saved`](Self::abandon_saved) after rollback.
    pub fn write_changes(&mut self, all_rows: bool) -> Result<Code> {
        for n in self.rows_to_save(all_rows) {
            let code = self.save_row(n)?;
            if code != Code::FileOk {
                return Ok(code);
            }
        }
        Ok(Code::FileOk)
    }

    /// Committed: written rows become clean.
    pub fn confirm_saved(&mut self) {
        for pending in self.pending.drain(..) {
            if let Some(row) = self.rows.get_mut(pending.row) {
                row.mark_saved();
            }
        }
    }

    /// Rolled back: restore rows to their state before the write.
    pub fn abandon_saved(&mut self) {
        let pending: Vec<PendingSave> = self.pending.drain(..).collect();
        for p in pending.into_iter().rev() {
            if let Some(row) = self.rows.get_mut(p.row) {
                *row = p.prior;
            }
        }
    }

    /// Remember row `n` as it is now, so an abandoned cycle can restore it.
    ///
    /// The first snapshot of a cycle wins; later calls for the same row are
    /// ignored.
    pub fn stage_row(&mut self, n: usize) {
        if n < self.rows.len() && !self.pending.iter().any(|p| p.row == n) {
            self.pending.push(PendingSave {
                row: n,
                prior: self.rows[n].clone(),
            });
        }
    }

    fn save_row(&mut self, n: usize) -> Result<Code> {
        self.stage_row(n);
        let is_new = self.rows[n].is_new();
        let keys: Vec<String> = self.key_fields().iter().map(|s| s.to_string()).collect();

        if is_new && self.auto_populate_pk && keys.len() == 1 {
            if let Some(idx) = self.field_index(&keys[0]) {
                if self.rows[n].get(idx).is_none_or(Value::is_blank) {
                    match self.conn.pregenerate_primary_key(&self.table, &keys[0]) {
                        Ok(Some(pk)) => self.rows[n].set_raw(idx, pk),
                        Ok(None) => {}
                        Err(e) => return self.capture(e, Code::FileCancel),
                    }
                }
            }
        }

        let predicate = if is_new {
            None
        } else {
            match self.row_predicate(n) {
                Some(predicate) => Some(predicate),
                None => return Ok(Code::FileCancel),
            }
        };

        let row = &self.rows[n];
        let columns: Vec<(&str, &Value)> = row
            .diff()
            .into_iter()
            .filter_map(|idx| {
                let name = self.description[idx].name.as_str();
                let skip = self
                    .non_update_fields
                    .iter()
                    .any(|f| f.eq_ignore_ascii_case(name));
                (!skip).then(|| (name, &row.values()[idx]))
            })
            .collect();

        let backend = self.conn.backend();
        let sql = match &predicate {
            None => insert_sql(backend, &self.table, &columns),
            Some(_) if columns.is_empty() => return Ok(Code::FileOk),
            Some(predicate) => update_sql(backend, &self.table, &columns, predicate),
        };

        let affected = match self.conn.execute(&sql, &[]) {
            Ok(result) => result.rowcount,
            Err(e) => return self.capture(e, Code::FileCancel),
        };
        if let Err(e) = self.conn.flush() {
            return self.capture(e, Code::FileCancel);
        }
        if !is_new && affected == 0 && !self.conn.backend().no_results_on_save() {
            warn!(table = %self.table, "update affected no rows");
            self.errors.push(
                self.table.clone(),
                Code::UpdateNoRows,
                format!("Update of {} affected no rows", self.table),
            );
            return Ok(Code::FileCancel);
        }

        if is_new && self.auto_populate_pk && keys.len() == 1 {
            if let Some(idx) = self.field_index(&keys[0]) {
                if self.rows[n].get(idx).is_none_or(Value::is_blank) {
                    match self.conn.last_insert_id(&self.table, &keys[0]) {
                        Ok(Some(pk)) => self.rows[n].set_raw(idx, pk),
                        Ok(None) => {}
                        Err(e) => return self.capture(e, Code::FileCancel),
                    }
                }
            }
        }

        Ok(Code::FileOk)
    }

    /// Key predicate for row `n`, built from its stored key values.
    fn row_predicate(&mut self, n: usize) -> Option<String> {
        let keys = self.key_fields();
        if keys.is_empty() {
            self.errors.push(
                self.table.clone(),
                Code::FileCancel,
                format!("No key field defined for table {}", self.table),
            );
            return None;
        }
        let mut values = Vec::with_capacity(keys.len());
        for key in &keys {
            match self.field_index(key) {
                Some(idx) => values.push(self.rows[n].original(idx).cloned().unwrap_or_default()),
                None => {
                    let message = format!("Key field '{}' is not in the data set", key);
                    self.errors.push(self.table.clone(), Code::FileCancel, message);
                    return None;
                }
            }
        }
        Some(pk_predicate(self.conn.backend(), &keys, &values))
    }

    fn capture(&mut self, e: DaboError, code: Code) -> Result<Code> {
        if e.is_fatal() {
            return Err(e);
        }
        warn!(table = %self.table, error = %e, "statement failed");
        self.errors.push(self.table.clone(), code, e.to_string());
        Ok(code)
    }

    // ---------------------------------------------------------------------
    // Transactions
    // ---------------------------------------------------------------------

    /// Returns `false` when a transaction was already active.
    pub fn begin_transaction(&self) -> Result<bool> {
        self.conn.begin()
    }

    pub fn commit_transaction(&self) -> Result<()> {
        self.conn.commit()
    }

    pub fn rollback_transaction(&self) -> Result<()> {
        self.conn.rollback()
    }

    // ---------------------------------------------------------------------
    // Export
    // ---------------------------------------------------------------------

    /// Every row as a `field → value` map.
    pub fn get_data_set(&self) -> Vec<BTreeMap<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.description
                    .iter()
                    .zip(row.values())
                    .map(|(col, value)| (col.name.clone(), value.clone()))
                    .collect()
            })
            .collect()
    }

    /// Rows as a JSON array. With `include_state`, changed rows carry their
    /// memento and new rows carry the new-record flag.
    pub fn export_json(&self, include_state: bool) -> Result<String> {
        let to_json = |value: &Value| {
            serde_json::to_value(value).map_err(|e| DaboError::backend(e.to_string()))
        };
        let mut out = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            let mut object = Map::new();
            for (col, value) in self.description.iter().zip(row.values()) {
                object.insert(col.name.clone(), to_json(value)?);
            }
            if include_state && row.is_changed() {
                if let Some(memento) = row.memento() {
                    let mut saved = Map::new();
                    for (col, value) in self.description.iter().zip(memento) {
                        saved.insert(col.name.clone(), to_json(value)?);
                    }
                    object.insert(MEMENTO.to_string(), JsonValue::Object(saved));
                }
                if row.is_new() {
                    object.insert(NEW_RECORD_FLAG.to_string(), json!(true));
                }
            }
            out.push(JsonValue::Object(object));
        }
        serde_json::to_string(&out).map_err(|e| DaboError::backend(e.to_string()))
    }
}
