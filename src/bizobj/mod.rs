//! Business objects: a cursor plus the child bizobjs linked to its rows.
//!
//! A [`Bizobj`] sequences every navigation and mutation of its cursor,
//! consults its [`BizobjHooks`] observer before and after, keeps its children
//! positioned on the current row, and applies the delete / update / insert
//! [`RefIntegrity`] policies across each parent/child edge.
//!
//! Children are owned by their parent. Instead of a back reference, a parent
//! pushes a [`ParentLink`] (the link value of its current row, whether that
//! row is persisted, and its insert policy) to each child whenever its
//! position changes.

mod builder;
mod hooks;

pub use builder::BizobjBuilder;
pub use hooks::{BizobjHooks, Hook, NoHooks};

use std::fmt;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::constants::{Code, RefIntegrity};
use crate::cursor::{Cursor, SortOrder};
use crate::db::Connection;
use crate::error::{ErrorLog, Result};
use crate::spec::TableSpec;
use crate::value::Value;

/// Value assigned to a field of every new row.
#[derive(Clone)]
pub enum DefaultValue {
    Value(Value),
    /// Evaluated once per new row.
    Func(Rc<dyn Fn() -> Value>),
}

impl DefaultValue {
    pub fn resolve(&self) -> Value {
        match self {
            DefaultValue::Value(v) => v.clone(),
            DefaultValue::Func(f) => f(),
        }
    }
}

impl fmt::Debug for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultValue::Value(v) => f.debug_tuple("Value").field(v).finish(),
            DefaultValue::Func(_) => f.write_str("Func(..)"),
        }
    }
}

/// State a parent pushes to each child.
#[derive(Debug, Clone, PartialEq)]
pub struct ParentLink {
    /// Parent's link-field value on its current row
    pub value: Value,
    /// Parent's current row exists on the backend
    pub persisted: bool,
    /// Parent's insert policy
    pub insert_policy: RefIntegrity,
}

/// Options for [`Bizobj::save_with`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveOptions {
    pub start_transaction: bool,
    pub all_rows: bool,
    pub top_level: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            start_transaction: true,
            all_rows: false,
            top_level: true,
        }
    }
}

/// Flags controlling parent/child behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BizobjFlags {
    pub requery_child_on_save: bool,
    pub new_child_on_new: bool,
    pub new_record_on_new_parent: bool,
    pub fill_link_from_parent: bool,
    pub save_position_on_requery: bool,
    pub no_data_on_load: bool,
}

impl Default for BizobjFlags {
    fn default() -> Self {
        Self {
            requery_child_on_save: false,
            new_child_on_new: false,
            new_record_on_new_parent: false,
            fill_link_from_parent: true,
            save_position_on_requery: true,
            no_data_on_load: false,
        }
    }
}

/// Referential policies a parent applies to its children.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Policies {
    pub delete: RefIntegrity,
    pub update: RefIntegrity,
    pub insert: RefIntegrity,
}

pub struct Bizobj {
    name: String,
    cursor: Cursor,
    children: Vec<Bizobj>,
    link_field: String,
    parent_link_field: String,
    parent_link: Option<ParentLink>,
    policies: Policies,
    flags: BizobjFlags,
    defaults: Vec<(String, DefaultValue)>,
    hooks: Rc<dyn BizobjHooks>,
    errors: ErrorLog,
}

impl fmt::Debug for Bizobj {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bizobj")
            .field("name", &self.name)
            .field("cursor", &self.cursor)
            .field("children", &self.children)
            .field("link_field", &self.link_field)
            .field("policies", &self.policies)
            .finish_non_exhaustive()
    }
}

impl Bizobj {
    pub fn builder(table: &str) -> BizobjBuilder {
        BizobjBuilder::new(table)
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub fn cursor_mut(&mut self) -> &mut Cursor {
        &mut self.cursor
    }

    pub fn connection(&self) -> &Rc<Connection> {
        self.cursor.connection()
    }

    pub fn table(&self) -> &str {
        self.cursor.table()
    }

    pub fn key_field(&self) -> &str {
        self.cursor.key_field()
    }

    pub fn link_field(&self) -> &str {
        &self.link_field
    }

    /// Takes effect at the next attach or requery.
    pub fn set_link_field(&mut self, field: &str) {
        self.link_field = field.to_string();
    }

    pub fn set_parent_link_field(&mut self, field: &str) {
        self.parent_link_field = field.to_string();
    }

    /// Field of this bizobj that children link to; the first key field unless set.
    pub fn parent_link_field(&self) -> &str {
        if self.parent_link_field.is_empty() {
            self.cursor.key_fields().first().copied().unwrap_or_default()
        } else {
            &self.parent_link_field
        }
    }

    pub fn parent_link(&self) -> Option<&ParentLink> {
        self.parent_link.as_ref()
    }

    pub fn policies(&self) -> Policies {
        self.policies
    }

    pub fn set_policies(&mut self, policies: Policies) {
        self.policies = policies;
    }

    pub fn flags(&self) -> BizobjFlags {
        self.flags
    }

    pub fn flags_mut(&mut self) -> &mut BizobjFlags {
        &mut self.flags
    }

    pub fn set_hooks(&mut self, hooks: Rc<dyn BizobjHooks>) {
        self.hooks = hooks;
    }

    pub fn set_default(&mut self, field: &str, value: DefaultValue) {
        self.defaults.retain(|(f, _)| f != field);
        self.defaults.push((field.to_string(), value));
    }

    pub fn errors(&self) -> &ErrorLog {
        &self.errors
    }

    /// Messages of the last operation, one per line.
    pub fn get_error_msg(&self) -> String {
        self.errors.render()
    }

    pub fn get_field_val(&self, name: &str) -> Option<&Value> {
        self.cursor.get_field_val(name)
    }

    pub fn set_field_val(&mut self, name: &str, value: impl Into<Value>) -> Result<()> {
        self.cursor.set_field_val(name, value)
    }

    pub fn get_row_count(&self) -> usize {
        self.cursor.row_count()
    }

    pub fn row_number(&self) -> Option<usize> {
        self.cursor.row_number()
    }

    pub fn get_pk(&self) -> Option<Value> {
        self.cursor.get_pk()
    }

    pub fn get_pk_values(&self) -> Vec<Value> {
        self.cursor.get_pk_values()
    }

    /// Link value pushed by the parent, if this bizobj is a child.
    pub fn get_parent_pk(&self) -> Option<&Value> {
        self.parent_link.as_ref().map(|link| &link.value)
    }

    pub fn is_adding(&self) -> bool {
        self.cursor.is_adding()
    }

    /// True when this cursor or any descendant has unsaved changes.
    pub fn is_changed(&self) -> bool {
        self.cursor.is_changed() || self.children.iter().any(Bizobj::is_changed)
    }

    pub fn set_where_clause(&mut self, clause: &str) {
        self.cursor.builder_mut().set_where_clause(clause);
    }

    pub fn get_where_clause(&self) -> &str {
        self.cursor.builder().get_where_clause()
    }

    pub fn set_params(&mut self, params: Vec<Value>) {
        self.cursor.set_params(params);
    }

    pub fn set_sql(&mut self, sql: &str) {
        self.cursor.set_sql(sql);
    }

    pub fn get_sql(&self) -> String {
        self.cursor.current_sql().0
    }

    pub fn get_data_set(&self) -> Vec<std::collections::BTreeMap<String, Value>> {
        self.cursor.get_data_set()
    }

    /// Restrict the select list to the fields a table spec shows, plus the key.
    pub fn apply_field_specs(&mut self, spec: &TableSpec) {
        let mut fields: Vec<String> = Vec::new();
        let mut push = |name: &str| {
            if !fields.iter().any(|f| f.eq_ignore_ascii_case(name)) {
                fields.push(name.to_string());
            }
        };
        for key in self.cursor.key_fields() {
            push(key);
        }
        for name in spec
            .list_fields()
            .into_iter()
            .chain(spec.edit_fields())
            .chain(spec.search_fields())
        {
            push(name);
        }
        let builder = self.cursor.builder_mut();
        builder.clear_fields();
        for field in &fields {
            builder.add_field(field);
        }
    }

    // ---------------------------------------------------------------------
    // Tree
    // ---------------------------------------------------------------------

    pub fn children(&self) -> &[Bizobj] {
        &self.children
    }

    /// Attach `child`, link it to the current row and load its rows.
    pub fn add_child(&mut self, mut child: Bizobj) -> Result<()> {
        let link = self.link_for_children();
        child.attach(link);
        if !child.flags.no_data_on_load {
            child.requery()?;
        }
        self.children.push(child);
        Ok(())
    }

    fn attach(&mut self, link: ParentLink) {
        if !self.link_field.is_empty() {
            let field = self.link_field.clone();
            self.cursor.set_link(&field, link.value.clone());
        }
        self.parent_link = Some(link);
    }

    pub fn child(&self, name: &str) -> Option<&Bizobj> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Bizobj> {
        self.children.iter_mut().find(|c| c.name == name)
    }

    /// This bizobj or the first descendant named `name`.
    pub fn find(&self, name: &str) -> Option<&Bizobj> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(name))
    }

    pub fn find_mut(&mut self, name: &str) -> Option<&mut Bizobj> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter_mut().find_map(|c| c.find_mut(name))
    }

    fn link_for_children(&self) -> ParentLink {
        let field = self.parent_link_field();
        ParentLink {
            value: self.cursor.get_field_val(field).cloned().unwrap_or_default(),
            persisted: self.cursor.current_row().is_some_and(|row| !row.is_new()),
            insert_policy: self.policies.insert,
        }
    }

    /// Point every child at the current row and reload it.
    fn requery_children(&mut self) -> Result<()> {
        let link = self.link_for_children();
        for child in &mut self.children {
            child.attach(link.clone());
            let code = child.requery()?;
            if code != Code::RequerySuccess {
                self.errors.extend(&child.errors);
            }
        }
        Ok(())
    }

    fn children_have_rows(&self) -> bool {
        self.children.iter().any(|c| c.cursor.row_count() > 0)
    }

    // ---------------------------------------------------------------------
    // Navigation
    // ---------------------------------------------------------------------

    fn navigate(&mut self, hook: Option<Hook>, op: impl FnOnce(&mut Cursor) -> Code) -> Result<Code> {
        self.errors.clear();
        let allowed = hook.is_none_or(|h| self.hooks.before(h, &self.cursor))
            && self.hooks.before(Hook::PointerMove, &self.cursor);
        if !allowed {
            debug!(bizobj = %self.name, ?hook, "navigation vetoed");
            return Ok(Code::FileCancel);
        }
        let code = op(&mut self.cursor);
        if code == Code::FileOk {
            self.requery_children()?;
            self.cursor.ensure_memento();
        }
        self.hooks.after(Hook::PointerMove, code);
        if let Some(hook) = hook {
            self.hooks.after(hook, code);
        }
        Ok(code)
    }

    pub fn first(&mut self) -> Result<Code> {
        self.navigate(Some(Hook::First), Cursor::first)
    }

    pub fn prior(&mut self) -> Result<Code> {
        self.navigate(Some(Hook::Prior), Cursor::prior)
    }

    pub fn next(&mut self) -> Result<Code> {
        self.navigate(Some(Hook::Next), Cursor::next)
    }

    pub fn last(&mut self) -> Result<Code> {
        self.navigate(Some(Hook::Last), Cursor::last)
    }

    pub fn move_to_row(&mut self, row: usize) -> Result<Code> {
        self.navigate(None, |cursor| cursor.move_to_row(row))
    }

    pub fn move_to_pk(&mut self, value: &Value) -> Result<Code> {
        self.navigate(None, |cursor| cursor.move_to_pk(value))
    }

    /// Move to the first row matching `value`; see [`Cursor::seek`].
    pub fn seek(
        &mut self,
        field: &str,
        value: &Value,
        case_sensitive: bool,
        near: bool,
    ) -> Result<Option<usize>> {
        let mut found = Ok(None);
        self.navigate(None, |cursor| {
            found = cursor.seek(field, value, case_sensitive, near);
            match found {
                Ok(Some(_)) => Code::FileOk,
                _ => Code::FileNoRecords,
            }
        })?;
        found
    }

    pub fn sort(&mut self, field: &str, order: SortOrder) -> Result<()> {
        self.cursor.sort(field, order)
    }

    /// Run `f` with the pointer on each row in turn, then restore the position.
    pub fn scan(&mut self, mut f: impl FnMut(&mut Bizobj) -> Result<()>) -> Result<()> {
        let saved = self.cursor.row_number();
        let mut row = 0;
        while row < self.cursor.row_count() {
            self.move_to_row(row)?;
            f(self)?;
            row += 1;
        }
        if let Some(saved) = saved {
            let row = saved.min(self.cursor.row_count().saturating_sub(1));
            self.move_to_row(row)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Requery
    // ---------------------------------------------------------------------

    pub fn requery(&mut self) -> Result<Code> {
        self.errors.clear();
        if !self.hooks.before(Hook::Requery, &self.cursor) {
            return Ok(Code::FileCancel);
        }
        let pk = self.cursor.get_pk();
        let code = self.cursor.requery()?;
        if code == Code::RequerySuccess {
            if self.flags.save_position_on_requery {
                if let Some(pk) = pk {
                    self.cursor.move_to_pk(&pk);
                }
            }
            self.requery_children()?;
            self.cursor.ensure_memento();
        } else {
            self.errors.extend(self.cursor.errors());
        }
        self.hooks.after(Hook::Requery, code);
        Ok(code)
    }

    /// Load the description without fetching rows.
    pub fn set_structure(&mut self) -> Result<Code> {
        self.errors.clear();
        let code = self.cursor.set_structure()?;
        if code != Code::RequerySuccess {
            self.errors.extend(self.cursor.errors());
        }
        Ok(code)
    }

    // ---------------------------------------------------------------------
    // New
    // ---------------------------------------------------------------------

    /// Add a row, apply defaults and the parent link, then create child rows
    /// where the flags or the insert policy ask for them.
    pub fn new_record(&mut self) -> Result<Code> {
        self.errors.clear();
        if !self.hooks.before(Hook::New, &self.cursor)
            || !self.hooks.before(Hook::PointerMove, &self.cursor)
        {
            debug!(bizobj = %self.name, "new vetoed");
            return Ok(Code::FileCancel);
        }
        if let Some(link) = &self.parent_link {
            if link.insert_policy == RefIntegrity::Restrict && !link.persisted {
                debug!(bizobj = %self.name, "insert restricted");
                self.errors.push(
                    self.name.clone(),
                    Code::FileCancel,
                    "Insertion prohibited: the parent record has not been saved",
                );
                return Ok(Code::FileCancel);
            }
        }

        let code = self.cursor.new_record()?;
        if code != Code::FileOk {
            self.errors.extend(self.cursor.errors());
            self.hooks.after(Hook::PointerMove, code);
            self.hooks.after(Hook::New, code);
            return Ok(code);
        }

        for (field, default) in &self.defaults {
            if let Err(e) = self.cursor.set_field_val(field, default.resolve()) {
                warn!(bizobj = %self.name, field = %field, error = %e, "default not applied");
            }
        }
        if self.flags.fill_link_from_parent && !self.link_field.is_empty() {
            if let Some(link) = &self.parent_link {
                let field = self.link_field.clone();
                self.cursor.set_field_val(&field, link.value.clone())?;
            }
        }
        self.hooks.on_new(&mut self.cursor);

        self.requery_children()?;
        let create_children =
            self.flags.new_child_on_new || self.policies.insert == RefIntegrity::Cascade;
        for child in &mut self.children {
            if create_children || child.flags.new_record_on_new_parent {
                let child_code = child.new_record()?;
                if child_code != Code::FileOk {
                    self.errors.extend(&child.errors);
                }
            }
        }

        self.hooks.after(Hook::PointerMove, code);
        self.hooks.after(Hook::New, code);
        Ok(code)
    }

    // ---------------------------------------------------------------------
    // Save
    // ---------------------------------------------------------------------

    /// Save the current row and its changed children in one transaction.
    pub fn save(&mut self) -> Result<Code> {
        self.save_with(SaveOptions::default())
    }

    /// Save every changed row.
    pub fn save_all(&mut self) -> Result<Code> {
        self.save_with(SaveOptions {
            all_rows: true,
            ..SaveOptions::default()
        })
    }

    /// Save with explicit transaction and scope options.
    ///
    /// Only the call that opened the transaction commits or rolls it back;
    /// a top-level call then confirms or abandons the written rows of the
    /// whole tree.
    pub fn save_with(&mut self, opts: SaveOptions) -> Result<Code> {
        self.errors.clear();
        if !self.hooks.before(Hook::Save, &self.cursor) {
            debug!(bizobj = %self.name, "save vetoed");
            return Ok(Code::FileCancel);
        }
        if !self.validate_rows(opts.all_rows) {
            return Ok(Code::FileCancel);
        }
        if opts.top_level && !self.has_changes_to_save(opts.all_rows) {
            self.hooks.after_change(Code::FileOk);
            self.hooks.after(Hook::Save, Code::FileOk);
            return Ok(Code::FileOk);
        }

        let key_change = self.changed_link_value();
        if key_change.is_some()
            && self.policies.update == RefIntegrity::Restrict
            && self.children_have_rows()
        {
            debug!(bizobj = %self.name, "update restricted");
            self.errors.push(
                self.name.clone(),
                Code::FileCancel,
                "Update prohibited: child records exist",
            );
            return Ok(Code::FileCancel);
        }

        let adding = self.cursor.is_adding();
        let opened = if opts.start_transaction {
            self.cursor.begin_transaction()?
        } else {
            false
        };

        let mut code = self.write_tree(opts.all_rows, key_change.is_some())?;
        if opened {
            if code == Code::FileOk {
                if let Err(e) = self.cursor.commit_transaction() {
                    if e.is_fatal() {
                        return Err(e);
                    }
                    self.errors.push(self.name.clone(), Code::FileCancel, e.to_string());
                    code = Code::FileCancel;
                }
            } else {
                self.cursor.rollback_transaction()?;
            }
        }

        if opts.top_level {
            if code == Code::FileOk {
                self.confirm_tree();
            } else {
                self.abandon_tree();
            }
        }

        if code == Code::FileOk {
            if adding {
                self.hooks.on_save_new(&self.cursor);
            }
            if opts.top_level && self.flags.requery_child_on_save {
                self.requery_children()?;
            }
        } else {
            warn!(bizobj = %self.name, %code, "save failed");
        }
        self.hooks.after_change(code);
        self.hooks.after(Hook::Save, code);
        Ok(code)
    }

    /// Whether a save with this scope has anything to write.
    ///
    /// Children only ever hold the current row's records, so any change
    /// below counts for either scope.
    fn has_changes_to_save(&self, all_rows: bool) -> bool {
        !self.cursor.rows_to_save(all_rows).is_empty()
            || self.children.iter().any(Bizobj::is_changed)
    }

    fn validate_rows(&mut self, all_rows: bool) -> bool {
        let rows: Vec<usize> = if all_rows {
            self.cursor.changed_rows()
        } else {
            self.cursor
                .row_number()
                .filter(|&n| self.cursor.is_row_changed(n))
                .into_iter()
                .collect()
        };
        let position = self.cursor.row_number();
        let mut valid = true;
        for n in rows {
            self.cursor.move_to_row(n);
            if let Err(message) = self.hooks.validate_record(&self.cursor) {
                debug!(bizobj = %self.name, row = n, "validation failed");
                self.errors.push(self.name.clone(), Code::FileCancel, message);
                valid = false;
                break;
            }
        }
        if let Some(position) = position {
            self.cursor.move_to_row(position);
        }
        valid
    }

    /// New link value when the current persisted row's link field was edited.
    fn changed_link_value(&self) -> Option<Value> {
        let row = self.cursor.current_row()?;
        if row.is_new() {
            return None;
        }
        let idx = self.cursor.field_index(self.parent_link_field())?;
        let current = row.get(idx)?;
        (row.original(idx) != Some(current)).then(|| current.clone())
    }

    /// Write this cursor, then each changed child with the link refreshed.
    fn write_tree(&mut self, all_rows: bool, key_changed: bool) -> Result<Code> {
        let code = self.cursor.write_changes(all_rows)?;
        if code != Code::FileOk {
            self.errors.extend(self.cursor.errors());
            return Ok(code);
        }

        let mut link = self.link_for_children();
        link.persisted = true;
        let cascade_update = key_changed && self.policies.update == RefIntegrity::Cascade;
        for child in &mut self.children {
            child.attach(link.clone());
            if cascade_update {
                child.relink(&link.value, false)?;
            } else if child.flags.fill_link_from_parent {
                child.relink(&link.value, true)?;
            }
            if !child.is_changed() {
                continue;
            }
            let child_code = child.save_with(SaveOptions {
                start_transaction: false,
                all_rows: true,
                top_level: false,
            })?;
            if child_code != Code::FileOk {
                self.errors.extend(&child.errors);
                return Ok(child_code);
            }
        }
        Ok(Code::FileOk)
    }

    /// Point rows' link field at `value`; with `only_new`, just unsaved rows.
    fn relink(&mut self, value: &Value, only_new: bool) -> Result<()> {
        if self.link_field.is_empty() {
            return Ok(());
        }
        let Some(idx) = self.cursor.field_index(&self.link_field) else {
            return Ok(());
        };
        let targets: Vec<usize> = self
            .cursor
            .rows()
            .iter()
            .enumerate()
            .filter(|(_, row)| !only_new || row.is_new())
            .filter(|(_, row)| row.get(idx).is_some_and(|v| !v.loose_eq(value)))
            .map(|(n, _)| n)
            .collect();
        let field = self.link_field.clone();
        for n in targets {
            self.cursor.stage_row(n);
            self.cursor.set_field_val_at(n, &field, value.clone())?;
        }
        Ok(())
    }

    fn confirm_tree(&mut self) {
        self.cursor.confirm_saved();
        for child in &mut self.children {
            child.confirm_tree();
        }
    }

    fn abandon_tree(&mut self) {
        self.cursor.abandon_saved();
        for child in &mut self.children {
            child.abandon_tree();
        }
    }

    // ---------------------------------------------------------------------
    // Delete
    // ---------------------------------------------------------------------

    /// Delete the current row under the delete policy.
    pub fn delete(&mut self) -> Result<Code> {
        self.errors.clear();
        if !self.hooks.before(Hook::Delete, &self.cursor) {
            debug!(bizobj = %self.name, "delete vetoed");
            return Ok(Code::FileCancel);
        }
        if self.cursor.row_count() == 0 {
            return Ok(Code::FileNoRecords);
        }
        if self.delete_restricted() {
            self.hooks.after_change(Code::FileCancel);
            self.hooks.after(Hook::Delete, Code::FileCancel);
            return Ok(Code::FileCancel);
        }

        let opened = if self.cursor.is_adding() {
            false
        } else {
            self.cursor.begin_transaction()?
        };
        let mut code = self.delete_current()?;
        code = self.finish_transaction(opened, code)?;

        self.after_delete(Hook::Delete, code)
    }

    /// Delete every row under the delete policy.
    pub fn delete_all(&mut self) -> Result<Code> {
        self.errors.clear();
        if !self.hooks.before(Hook::DeleteAll, &self.cursor) {
            return Ok(Code::FileCancel);
        }
        let opened = self.cursor.begin_transaction()?;
        let mut code = self.delete_rows()?;
        code = self.finish_transaction(opened, code)?;

        self.after_delete(Hook::DeleteAll, code)
    }

    fn finish_transaction(&mut self, opened: bool, code: Code) -> Result<Code> {
        let ok = matches!(code, Code::FileOk | Code::UpdateNoRows);
        if !opened {
            return Ok(code);
        }
        if ok {
            if let Err(e) = self.cursor.commit_transaction() {
                if e.is_fatal() {
                    return Err(e);
                }
                self.errors.push(self.name.clone(), Code::FileCancel, e.to_string());
                return Ok(Code::FileCancel);
            }
        } else {
            self.cursor.rollback_transaction()?;
        }
        Ok(code)
    }

    fn after_delete(&mut self, hook: Hook, code: Code) -> Result<Code> {
        for child in &mut self.children {
            child.cursor.cancel(true);
        }
        self.requery_children()?;
        self.cursor.ensure_memento();
        if self.cursor.row_count() == 0 && matches!(code, Code::FileOk | Code::UpdateNoRows) {
            self.hooks.on_delete_last_record();
        }
        self.hooks.after_change(code);
        self.hooks.after(hook, code);
        Ok(code)
    }

    /// Apply the delete policy to the current row's children, then delete it.
    fn delete_current(&mut self) -> Result<Code> {
        if self.delete_restricted() {
            return Ok(Code::FileCancel);
        }
        if self.policies.delete == RefIntegrity::Cascade {
            for child in &mut self.children {
                let code = child.delete_rows()?;
                if code != Code::FileOk {
                    self.errors.extend(&child.errors);
                    return Ok(code);
                }
            }
        }
        let code = self.cursor.delete()?;
        if !matches!(code, Code::FileOk | Code::UpdateNoRows) {
            self.errors.extend(self.cursor.errors());
        }
        Ok(code)
    }

    /// True, with the reason logged, when RESTRICT forbids deleting the
    /// current row.
    fn delete_restricted(&mut self) -> bool {
        if self.policies.delete != RefIntegrity::Restrict || !self.children_have_rows() {
            return false;
        }
        debug!(bizobj = %self.name, "delete restricted");
        self.errors.push(
            self.name.clone(),
            Code::FileCancel,
            "Deletion prohibited: child records exist",
        );
        true
    }

    /// Delete rows from the top until none remain or one fails.
    fn delete_rows(&mut self) -> Result<Code> {
        while self.cursor.row_count() > 0 {
            self.cursor.move_to_row(0);
            if self.policies.delete != RefIntegrity::Ignore {
                self.requery_children()?;
            }
            let code = self.delete_current()?;
            if !matches!(code, Code::FileOk | Code::UpdateNoRows) {
                return Ok(code);
            }
        }
        Ok(Code::FileOk)
    }

    // ---------------------------------------------------------------------
    // Cancel
    // ---------------------------------------------------------------------

    pub fn cancel(&mut self) -> Result<Code> {
        self.cancel_with(false)
    }

    pub fn cancel_all(&mut self) -> Result<Code> {
        self.cancel_with(true)
    }

    fn cancel_with(&mut self, all_rows: bool) -> Result<Code> {
        self.errors.clear();
        if !self.hooks.before(Hook::Cancel, &self.cursor) {
            return Ok(Code::FileCancel);
        }
        let code = self.cursor.cancel(all_rows);
        for child in &mut self.children {
            child.cursor.cancel(true);
        }
        self.requery_children()?;
        self.cursor.ensure_memento();
        self.hooks.after(Hook::Cancel, code);
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::tests::recorded_connection;
    use crate::db::StatementLog;
    use rstest::{fixture, rstest};
    use std::cell::RefCell;

    const SCHEMA: &str = "
        CREATE TABLE customer (pkid INTEGER PRIMARY KEY, company VARCHAR(40) NOT NULL DEFAULT '');
        CREATE TABLE orders (
            pkid INTEGER PRIMARY KEY,
            custid INTEGER NOT NULL,
            amount DECIMAL(10,2) DEFAULT 0 CHECK (amount >= 0)
        );
        INSERT INTO customer VALUES (1, 'Acme'), (2, 'Beta');
        INSERT INTO orders VALUES (10, 1, 5), (11, 1, 7), (12, 2, 9);
    ";

    #[derive(Default)]
    struct Recorder {
        events: RefCell<Vec<String>>,
        veto: Option<Hook>,
    }

    impl BizobjHooks for Recorder {
        fn before(&self, hook: Hook, _cursor: &Cursor) -> bool {
            self.events.borrow_mut().push(format!("before {:?}", hook));
            self.veto != Some(hook)
        }

        fn after(&self, hook: Hook, code: Code) {
            self.events.borrow_mut().push(format!("after {:?} {}", hook, code));
        }

        fn validate_record(&self, cursor: &Cursor) -> std::result::Result<(), String> {
            match cursor.get_field_val("company") {
                Some(Value::Text(s)) if s.is_empty() => Err("Company is required".into()),
                _ => Ok(()),
            }
        }

        fn on_delete_last_record(&self) {
            self.events.borrow_mut().push("last record deleted".into());
        }
    }

    fn tree(policy: RefIntegrity) -> (Bizobj, StatementLog) {
        let (conn, log) = recorded_connection(SCHEMA);
        let mut parent = Bizobj::builder("customer")
            .key_field("pkid")
            .order_by("pkid")
            .delete_child_logic(policy)
            .build(&conn)
            .unwrap();
        let child = Bizobj::builder("orders")
            .key_field("pkid")
            .link_field("custid")
            .order_by("pkid")
            .build(&conn)
            .unwrap();
        parent.add_child(child).unwrap();
        log.clear();
        (parent, log)
    }

    #[fixture]
    fn ignore_tree() -> (Bizobj, StatementLog) {
        tree(RefIntegrity::Ignore)
    }

    #[rstest]
    fn test_children_follow_parent(ignore_tree: (Bizobj, StatementLog)) {
        let (mut parent, _) = ignore_tree;
        assert_eq!(parent.child("orders").unwrap().get_row_count(), 2);
        assert_eq!(parent.next().unwrap(), Code::FileOk);
        let orders = parent.child("orders").unwrap();
        assert_eq!(orders.get_row_count(), 1);
        assert_eq!(orders.get_parent_pk(), Some(&Value::Int(2)));
        assert_eq!(parent.next().unwrap(), Code::FileEof);
    }

    #[rstest]
    fn test_veto_leaves_state_unchanged(ignore_tree: (Bizobj, StatementLog)) {
        let (mut parent, log) = ignore_tree;
        let recorder = Rc::new(Recorder {
            veto: Some(Hook::Next),
            ..Recorder::default()
        });
        parent.set_hooks(recorder.clone());

        assert_eq!(parent.next().unwrap(), Code::FileCancel);
        assert_eq!(parent.row_number(), Some(0));
        assert!(log.is_empty());
        assert_eq!(*recorder.events.borrow(), vec!["before Next"]);
    }

    #[rstest]
    fn test_hook_order_for_navigation(ignore_tree: (Bizobj, StatementLog)) {
        let (mut parent, _) = ignore_tree;
        let recorder = Rc::new(Recorder::default());
        parent.set_hooks(recorder.clone());

        parent.last().unwrap();
        assert_eq!(
            *recorder.events.borrow(),
            vec![
                "before Last",
                "before PointerMove",
                "after PointerMove FILE_OK",
                "after Last FILE_OK",
            ]
        );
    }

    #[rstest]
    fn test_is_changed_includes_children(ignore_tree: (Bizobj, StatementLog)) {
        let (mut parent, _) = ignore_tree;
        assert!(!parent.is_changed());
        parent
            .child_mut("orders")
            .unwrap()
            .set_field_val("amount", 99)
            .unwrap();
        assert!(!parent.cursor().is_changed());
        assert!(parent.is_changed());
    }

    #[rstest]
    fn test_validation_blocks_save(ignore_tree: (Bizobj, StatementLog)) {
        let (mut parent, log) = ignore_tree;
        parent.set_hooks(Rc::new(Recorder::default()));
        parent.set_field_val("company", "").unwrap();

        assert_eq!(parent.save().unwrap(), Code::FileCancel);
        assert_eq!(parent.get_error_msg(), "Company is required");
        assert!(log.is_empty());
    }

    #[rstest]
    fn test_save_without_changes_issues_no_sql(ignore_tree: (Bizobj, StatementLog)) {
        let (mut parent, log) = ignore_tree;
        assert_eq!(parent.save().unwrap(), Code::FileOk);
        assert!(log.is_empty());
    }

    #[rstest]
    fn test_new_parent_and_child_link_on_save(ignore_tree: (Bizobj, StatementLog)) {
        let (mut parent, _) = ignore_tree;
        parent.flags_mut().new_child_on_new = true;

        assert_eq!(parent.new_record().unwrap(), Code::FileOk);
        parent.set_field_val("company", "Gamma").unwrap();
        let orders = parent.child_mut("orders").unwrap();
        assert_eq!(orders.get_row_count(), 1);
        orders.set_field_val("amount", 3).unwrap();

        assert_eq!(parent.save().unwrap(), Code::FileOk);
        assert_eq!(parent.get_pk(), Some(Value::Int(3)));
        let orders = parent.child("orders").unwrap();
        assert_eq!(orders.get_field_val("custid"), Some(&Value::Int(3)));
        assert!(!parent.is_changed());

        let count = parent
            .connection()
            .execute("SELECT COUNT(*) FROM orders WHERE custid = 3", &[])
            .unwrap();
        assert_eq!(count.scalar(), Some(&Value::Int(1)));
    }

    #[rstest]
    fn test_defaults_apply_to_new_rows() {
        let (conn, _) = recorded_connection(SCHEMA);
        let counter = Rc::new(RefCell::new(0));
        let next_name = {
            let counter = counter.clone();
            move || {
                *counter.borrow_mut() += 1;
                Value::from(format!("New {}", counter.borrow()))
            }
        };
        let mut biz = Bizobj::builder("customer")
            .key_field("pkid")
            .default_fn("company", next_name)
            .build(&conn)
            .unwrap();

        biz.new_record().unwrap();
        assert_eq!(biz.get_field_val("company"), Some(&Value::from("New 1")));
        biz.new_record().unwrap();
        assert_eq!(biz.get_field_val("company"), Some(&Value::from("New 2")));
    }

    #[rstest]
    fn test_restrict_insert_requires_saved_parent() {
        let (conn, _) = recorded_connection(SCHEMA);
        let mut parent = Bizobj::builder("customer")
            .key_field("pkid")
            .insert_child_logic(RefIntegrity::Restrict)
            .build(&conn)
            .unwrap();
        let child = Bizobj::builder("orders")
            .key_field("pkid")
            .link_field("custid")
            .build(&conn)
            .unwrap();
        parent.add_child(child).unwrap();

        assert_eq!(parent.child_mut("orders").unwrap().new_record().unwrap(), Code::FileOk);
        parent.child_mut("orders").unwrap().cancel().unwrap();

        parent.new_record().unwrap();
        let orders = parent.child_mut("orders").unwrap();
        assert_eq!(orders.new_record().unwrap(), Code::FileCancel);
        assert!(orders.get_error_msg().contains("Insertion prohibited"));
    }

    #[rstest]
    fn test_cascade_insert_creates_child_rows() {
        let (conn, _) = recorded_connection(SCHEMA);
        let mut parent = Bizobj::builder("customer")
            .key_field("pkid")
            .insert_child_logic(RefIntegrity::Cascade)
            .build(&conn)
            .unwrap();
        let child = Bizobj::builder("orders")
            .key_field("pkid")
            .link_field("custid")
            .build(&conn)
            .unwrap();
        parent.add_child(child).unwrap();

        parent.new_record().unwrap();
        assert!(parent.child("orders").unwrap().is_adding());
    }

    #[rstest]
    fn test_update_restrict_and_cascade(#[values(RefIntegrity::Restrict, RefIntegrity::Cascade)] policy: RefIntegrity) {
        let (mut parent, log) = tree(RefIntegrity::Ignore);
        parent.set_policies(Policies {
            update: policy,
            ..Policies::default()
        });
        parent.set_field_val("pkid", 100).unwrap();
        let code = parent.save().unwrap();

        match policy {
            RefIntegrity::Restrict => {
                assert_eq!(code, Code::FileCancel);
                assert!(parent.get_error_msg().contains("Update prohibited"));
                assert!(log.is_empty());
            }
            _ => {
                assert_eq!(code, Code::FileOk);
                let moved = parent
                    .connection()
                    .execute("SELECT COUNT(*) FROM orders WHERE custid = 100", &[])
                    .unwrap();
                assert_eq!(moved.scalar(), Some(&Value::Int(2)));
                assert_eq!(log.matching("UPDATE orders").len(), 2);
            }
        }
    }

    #[rstest]
    fn test_delete_last_record_fires_hook() {
        let (conn, _) = recorded_connection(SCHEMA);
        let recorder = Rc::new(Recorder::default());
        let mut biz = Bizobj::builder("customer")
            .key_field("pkid")
            .where_clause("pkid = 2")
            .hooks(recorder.clone())
            .build(&conn)
            .unwrap();

        assert_eq!(biz.get_row_count(), 1);
        assert_eq!(biz.delete().unwrap(), Code::FileOk);
        assert_eq!(biz.get_row_count(), 0);
        assert!(recorder.events.borrow().contains(&"last record deleted".to_string()));
        assert_eq!(biz.delete().unwrap(), Code::FileNoRecords);
    }

    #[rstest]
    fn test_requery_keeps_position(ignore_tree: (Bizobj, StatementLog)) {
        let (mut parent, _) = ignore_tree;
        parent.last().unwrap();
        parent.set_where_clause("pkid > 0");
        assert_eq!(parent.requery().unwrap(), Code::RequerySuccess);
        assert_eq!(parent.get_pk(), Some(Value::Int(2)));
        assert_eq!(parent.get_where_clause(), "pkid > 0");
    }

    #[rstest]
    fn test_cancel_discards_tree_changes(ignore_tree: (Bizobj, StatementLog)) {
        let (mut parent, _) = ignore_tree;
        parent.set_field_val("company", "Changed").unwrap();
        parent
            .child_mut("orders")
            .unwrap()
            .set_field_val("amount", 1)
            .unwrap();
        assert_eq!(parent.cancel().unwrap(), Code::FileOk);
        assert!(!parent.is_changed());
        assert_eq!(parent.get_field_val("company"), Some(&Value::from("Acme")));
    }

    #[rstest]
    fn test_scan_visits_rows_and_restores(ignore_tree: (Bizobj, StatementLog)) {
        let (mut parent, _) = ignore_tree;
        parent.last().unwrap();
        let mut seen = Vec::new();
        parent
            .scan(|biz| {
                seen.push((biz.get_pk(), biz.child("orders").map(Bizobj::get_row_count)));
                Ok(())
            })
            .unwrap();
        assert_eq!(
            seen,
            vec![(Some(Value::Int(1)), Some(2)), (Some(Value::Int(2)), Some(1))]
        );
        assert_eq!(parent.row_number(), Some(1));
    }

    #[rstest]
    fn test_apply_field_specs_sets_select_list() {
        let (conn, log) = recorded_connection(SCHEMA);
        let specs = crate::spec::parse_field_specs(
            r#"<table name="customer"><field name="company" listInclude="1"/></table>"#,
        )
        .unwrap();
        let mut biz = Bizobj::builder("customer")
            .key_field("pkid")
            .no_data_on_load(true)
            .build(&conn)
            .unwrap();

        biz.apply_field_specs(&specs["customer"]);
        biz.requery().unwrap();
        assert_eq!(log.statements(), vec!["SELECT pkid, company\nFROM customer"]);
        assert_eq!(biz.cursor().field_names(), vec!["pkid", "company"]);
    }

    #[rstest]
    fn test_find_descendants(ignore_tree: (Bizobj, StatementLog)) {
        let (mut parent, _) = ignore_tree;
        assert!(parent.find("customer").is_some());
        assert!(parent.find("orders").is_some());
        assert!(parent.find_mut("missing").is_none());
    }

    #[rstest]
    fn test_restrict_delete_issues_no_sql() {
        let (mut parent, log) = tree(RefIntegrity::Restrict);
        let recorder = Rc::new(Recorder::default());
        parent.set_hooks(recorder.clone());

        assert_eq!(parent.delete().unwrap(), Code::FileCancel);
        assert!(log.is_empty());
        assert_eq!(parent.get_row_count(), 2);
        assert_eq!(parent.child("orders").unwrap().get_row_count(), 2);
        assert_eq!(
            *recorder.events.borrow(),
            vec!["before Delete", "after Delete FILE_CANCEL"]
        );
    }

    #[rstest]
    fn test_save_current_row_skips_other_dirty_rows(ignore_tree: (Bizobj, StatementLog)) {
        let (mut parent, log) = ignore_tree;
        parent.next().unwrap();
        parent.set_field_val("company", "Changed").unwrap();
        parent.first().unwrap();
        log.clear();

        assert_eq!(parent.save().unwrap(), Code::FileOk);
        assert!(log.is_empty());
        assert!(parent.is_changed());

        assert_eq!(parent.save_all().unwrap(), Code::FileOk);
        assert_eq!(
            log.matching("UPDATE"),
            vec!["UPDATE customer SET company = 'Changed' WHERE pkid=2"]
        );
        assert!(!parent.is_changed());
    }

    #[rstest]
    fn test_child_over_opaque_sql_follows_parent() {
        let (conn, _) = recorded_connection(SCHEMA);
        let mut parent = Bizobj::builder("customer")
            .key_field("pkid")
            .order_by("pkid")
            .build(&conn)
            .unwrap();
        let child = Bizobj::builder("orders")
            .key_field("pkid")
            .sql("SELECT pkid, custid, amount FROM orders ORDER BY pkid")
            .link_field("custid")
            .build(&conn)
            .unwrap();
        parent.add_child(child).unwrap();

        let orders = parent.child("orders").unwrap();
        assert_eq!(orders.get_row_count(), 2);
        assert!(orders.get_error_msg().is_empty());

        parent.next().unwrap();
        let orders = parent.child("orders").unwrap();
        assert_eq!(orders.get_row_count(), 1);
        assert_eq!(orders.get_pk(), Some(Value::Int(12)));
    }

    #[rstest]
    fn test_rollback_restores_child_link(ignore_tree: (Bizobj, StatementLog)) {
        let (mut parent, _) = ignore_tree;
        parent.flags_mut().new_child_on_new = true;
        parent.new_record().unwrap();
        parent.set_field_val("company", "Gamma").unwrap();
        let orders = parent.child_mut("orders").unwrap();
        orders.set_field_val("amount", -1).unwrap();
        let link_before = orders.get_field_val("custid").cloned();
        let pk_before = parent.get_pk();

        assert_eq!(parent.save().unwrap(), Code::FileCancel);
        assert!(!parent.connection().in_transaction());
        assert_eq!(parent.get_pk(), pk_before);
        let orders = parent.child("orders").unwrap();
        assert_eq!(orders.get_field_val("custid").cloned(), link_before);
        assert!(orders.is_adding());
    }
}
