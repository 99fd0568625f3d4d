//! Fluent construction of [`Bizobj`] instances.

use std::rc::Rc;

use tracing::debug;

use super::{Bizobj, BizobjFlags, BizobjHooks, DefaultValue, NoHooks, Policies};
use crate::constants::RefIntegrity;
use crate::db::Connection;
use crate::error::{ErrorLog, Result};
use crate::value::Value;

/// Collects a bizobj's table, SQL, link and policy settings before it is
/// bound to a connection.
///
/// A bizobj built without a link field and without `no_data_on_load` runs
/// its first requery inside [`build`](Self::build). Children wait for their
/// parent to link them.
#[derive(Clone)]
pub struct BizobjBuilder {
    name: Option<String>,
    table: String,
    key_field: String,
    sql: Option<String>,
    fields: Vec<String>,
    where_clause: String,
    order_by: Vec<String>,
    limit: Option<String>,
    params: Vec<Value>,
    link_field: String,
    parent_link_field: String,
    non_update_fields: Vec<String>,
    auto_populate_pk: bool,
    policies: Policies,
    flags: BizobjFlags,
    defaults: Vec<(String, DefaultValue)>,
    hooks: Option<Rc<dyn BizobjHooks>>,
}

impl BizobjBuilder {
    pub fn new(table: &str) -> Self {
        Self {
            name: None,
            table: table.to_string(),
            key_field: String::new(),
            sql: None,
            fields: Vec::new(),
            where_clause: String::new(),
            order_by: Vec::new(),
            limit: None,
            params: Vec::new(),
            link_field: String::new(),
            parent_link_field: String::new(),
            non_update_fields: Vec::new(),
            auto_populate_pk: true,
            policies: Policies::default(),
            flags: BizobjFlags::default(),
            defaults: Vec::new(),
            hooks: None,
        }
    }

    /// Name used for lookups and error sources; defaults to the table.
    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    /// Key field, comma separated for composite keys.
    pub fn key_field(mut self, key_field: &str) -> Self {
        self.key_field = key_field.to_string();
        self
    }

    /// Opaque SELECT used instead of the builder fragments.
    pub fn sql(mut self, sql: &str) -> Self {
        self.sql = Some(sql.to_string());
        self
    }

    pub fn field(mut self, field: &str) -> Self {
        self.fields.push(field.to_string());
        self
    }

    pub fn where_clause(mut self, clause: &str) -> Self {
        self.where_clause = clause.to_string();
        self
    }

    pub fn order_by(mut self, expr: &str) -> Self {
        self.order_by.push(expr.to_string());
        self
    }

    pub fn limit(mut self, limit: &str) -> Self {
        self.limit = Some(limit.to_string());
        self
    }

    pub fn params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }

    /// Field of this table that holds the parent's link value.
    pub fn link_field(mut self, field: &str) -> Self {
        self.link_field = field.to_string();
        self
    }

    /// Field of this table children link to, when it is not the key.
    pub fn parent_link_field(mut self, field: &str) -> Self {
        self.parent_link_field = field.to_string();
        self
    }

    pub fn non_update_fields(mut self, fields: &[&str]) -> Self {
        self.non_update_fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn auto_populate_pk(mut self, on: bool) -> Self {
        self.auto_populate_pk = on;
        self
    }

    pub fn delete_child_logic(mut self, policy: RefIntegrity) -> Self {
        self.policies.delete = policy;
        self
    }

    pub fn update_child_logic(mut self, policy: RefIntegrity) -> Self {
        self.policies.update = policy;
        self
    }

    pub fn insert_child_logic(mut self, policy: RefIntegrity) -> Self {
        self.policies.insert = policy;
        self
    }

    pub fn flags(mut self, flags: BizobjFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn no_data_on_load(mut self, on: bool) -> Self {
        self.flags.no_data_on_load = on;
        self
    }

    pub fn default_value(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.defaults
            .push((field.to_string(), DefaultValue::Value(value.into())));
        self
    }

    /// Default computed each time a row is added.
    pub fn default_fn(mut self, field: &str, f: impl Fn() -> Value + 'static) -> Self {
        self.defaults
            .push((field.to_string(), DefaultValue::Func(Rc::new(f))));
        self
    }

    pub fn hooks(mut self, hooks: Rc<dyn BizobjHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Bind to `conn` and, for top-level bizobjs, load the first rows.
    ///
    /// # Errors
    ///
    /// Returns an error only when the connection cannot be opened. A failed
    /// initial SELECT is left in the bizobj's error log.
    pub fn build(self, conn: &Rc<Connection>) -> Result<Bizobj> {
        let mut cursor = conn.cursor();
        cursor.set_table(&self.table);
        cursor.set_key_field(&self.key_field);
        cursor.set_params(self.params);
        cursor.set_non_update_fields(self.non_update_fields);
        cursor.set_auto_populate_pk(self.auto_populate_pk);
        if let Some(sql) = &self.sql {
            cursor.set_sql(sql);
        }
        {
            let builder = cursor.builder_mut();
            for field in &self.fields {
                builder.add_field(field);
            }
            builder.set_where_clause(&self.where_clause);
            for expr in &self.order_by {
                builder.add_order_by(expr);
            }
            if let Some(limit) = &self.limit {
                builder.set_limit(limit);
            }
        }

        let mut bizobj = Bizobj {
            name: self.name.unwrap_or_else(|| self.table.clone()),
            cursor,
            children: Vec::new(),
            link_field: self.link_field,
            parent_link_field: self.parent_link_field,
            parent_link: None,
            policies: self.policies,
            flags: self.flags,
            defaults: self.defaults,
            hooks: self.hooks.unwrap_or_else(|| Rc::new(NoHooks)),
            errors: ErrorLog::new(),
        };

        if bizobj.flags.no_data_on_load || !bizobj.link_field.is_empty() {
            debug!(bizobj = %bizobj.name, "initial requery deferred");
        } else {
            bizobj.requery()?;
        }
        Ok(bizobj)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::Code;
    use crate::cursor::tests::{SCHEMA, recorded_connection};
    use rstest::rstest;

    #[rstest]
    fn test_build_runs_initial_requery() {
        let (conn, log) = recorded_connection(SCHEMA);
        let biz = BizobjBuilder::new("customer")
            .key_field("pkid")
            .field("pkid")
            .field("company")
            .where_clause("balance > 0")
            .order_by("company")
            .build(&conn)
            .unwrap();

        assert_eq!(biz.name(), "customer");
        assert_eq!(biz.get_row_count(), 2);
        assert_eq!(
            log.statements(),
            vec!["SELECT pkid, company\nFROM customer\nWHERE balance > 0\nORDER BY company"]
        );
    }

    #[rstest]
    fn test_no_data_on_load_defers_requery() {
        let (conn, log) = recorded_connection(SCHEMA);
        let mut biz = BizobjBuilder::new("customer")
            .name("customers")
            .key_field("pkid")
            .no_data_on_load(true)
            .build(&conn)
            .unwrap();

        assert!(log.is_empty());
        assert_eq!(biz.get_row_count(), 0);
        assert_eq!(biz.requery().unwrap(), Code::RequerySuccess);
        assert_eq!(biz.get_row_count(), 3);
        assert_eq!(biz.name(), "customers");
    }

    #[rstest]
    fn test_failed_initial_requery_is_logged() {
        let (conn, _) = recorded_connection(SCHEMA);
        let biz = BizobjBuilder::new("missing").build(&conn).unwrap();
        assert!(!biz.errors().is_empty());
    }
}
