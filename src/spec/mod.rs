//! Field and relation specs, and building bizobj trees from them.
//!
//! Field specs describe how each column of a table is captioned and where it
//! shows up (search form, list, edit form). Relation specs describe
//! parent/child edges between tables; [`BizobjRegistry`] turns them into a
//! bizobj tree under a root.

mod tree;
mod xml;

pub use tree::{BizobjFactory, BizobjRegistry};
pub use xml::{load_field_specs, load_relation_specs, parse_field_specs, parse_relation_specs};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::FieldType;

/// Presentation attributes of one field.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub caption: String,
    pub field_type: FieldType,
    pub search_include: bool,
    pub search_order: i32,
    pub list_include: bool,
    pub list_order: i32,
    pub edit_include: bool,
    pub edit_order: i32,
    pub edit_read_only: bool,
    pub word_search: bool,
    pub select_types: Vec<String>,
}

/// Field specs of one table, in document order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TableSpec {
    pub name: String,
    pub fields: Vec<FieldSpec>,
}

impl TableSpec {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name.eq_ignore_ascii_case(name))
    }

    /// Fields shown on the search form, by search order.
    pub fn search_fields(&self) -> Vec<&str> {
        self.ordered(|f| f.search_include, |f| f.search_order)
    }

    /// Fields shown in the browse list, by list order.
    pub fn list_fields(&self) -> Vec<&str> {
        self.ordered(|f| f.list_include, |f| f.list_order)
    }

    /// Fields shown on the edit form, by edit order.
    pub fn edit_fields(&self) -> Vec<&str> {
        self.ordered(|f| f.edit_include, |f| f.edit_order)
    }

    /// Fields searched by a free-text word search.
    pub fn word_search_fields(&self) -> Vec<&str> {
        self.fields
            .iter()
            .filter(|f| f.word_search)
            .map(|f| f.name.as_str())
            .collect()
    }

    fn ordered(&self, include: impl Fn(&FieldSpec) -> bool, order: impl Fn(&FieldSpec) -> i32) -> Vec<&str> {
        let mut fields: Vec<&FieldSpec> = self.fields.iter().filter(|f| include(f)).collect();
        fields.sort_by_key(|f| order(f));
        fields.into_iter().map(|f| f.name.as_str()).collect()
    }
}

/// Parent/child edge between two tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationSpec {
    /// Relation name, `parent:child` by convention
    pub name: String,
    pub parent: String,
    pub child: String,
    /// Parent field the child links to; the parent's key when empty
    pub parent_field: String,
    /// Child field holding the parent's value
    pub child_field: String,
}

/// Field specs keyed by table name.
pub type FieldSpecs = BTreeMap<String, TableSpec>;

/// Relation specs keyed by relation name.
pub type RelationSpecs = BTreeMap<String, RelationSpec>;
