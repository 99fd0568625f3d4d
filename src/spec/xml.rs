//! XML readers for field and relation spec documents.
//!
//! Field specs:
//!
//! ```xml
//! <tables>
//!   <table name="customer">
//!     <field name="company" caption="Company" type="char"
//!            listInclude="1" listOrder="10" wordSearch="1"/>
//!   </table>
//! </tables>
//! ```
//!
//! Relation specs:
//!
//! ```xml
//! <relations>
//!   <relation name="customer:orders" child="orders"
//!             parentField="pkid" childField="custid"/>
//! </relations>
//! ```

use std::borrow::Cow;
use std::fs;
use std::path::Path;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use tracing::debug;

use super::{FieldSpec, FieldSpecs, RelationSpec, RelationSpecs, TableSpec};
use crate::error::{DaboError, Result};
use crate::value::FieldType;

fn spec_error(message: impl Into<String>) -> DaboError {
    DaboError::Spec {
        message: message.into(),
    }
}

/// Attributes of one element as owned name/value pairs.
fn attributes(element: &BytesStart<'_>) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    for attr in element.attributes() {
        let attr = attr.map_err(|e| spec_error(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value: Cow<'_, str> = attr.unescape_value().map_err(|e| spec_error(e.to_string()))?;
        out.push((key, value.into_owned()));
    }
    Ok(out)
}

fn flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "t"
    )
}

fn order(name: &str, value: &str) -> Result<i32> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(0);
    }
    value
        .parse()
        .map_err(|_| spec_error(format!("attribute '{}' is not a number: '{}'", name, value)))
}

fn field_spec(attrs: Vec<(String, String)>) -> Result<FieldSpec> {
    let mut spec = FieldSpec::default();
    for (key, value) in attrs {
        match key.as_str() {
            "name" => spec.name = value,
            "caption" => spec.caption = value,
            "type" => {
                spec.field_type = FieldType::from_name(&value)
                    .ok_or_else(|| spec_error(format!("unknown field type '{}'", value)))?
            }
            "searchInclude" => spec.search_include = flag(&value),
            "searchOrder" => spec.search_order = order(&key, &value)?,
            "listInclude" => spec.list_include = flag(&value),
            "listOrder" => spec.list_order = order(&key, &value)?,
            "editInclude" => spec.edit_include = flag(&value),
            "editOrder" => spec.edit_order = order(&key, &value)?,
            "editReadOnly" => spec.edit_read_only = flag(&value),
            "wordSearch" => spec.word_search = flag(&value),
            "selectTypes" => {
                spec.select_types = value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            }
            _ => {}
        }
    }
    if spec.name.is_empty() {
        return Err(spec_error("<field> without a name"));
    }
    if spec.caption.is_empty() {
        spec.caption = spec.name.clone();
    }
    Ok(spec)
}

fn table_spec(element: &BytesStart<'_>) -> Result<TableSpec> {
    let name = attributes(element)?
        .into_iter()
        .find_map(|(k, v)| (k == "name").then_some(v))
        .ok_or_else(|| spec_error("<table> without a name"))?;
    Ok(TableSpec {
        name,
        fields: Vec::new(),
    })
}

/// Parse a field-spec document into `{table → fields}`.
pub fn parse_field_specs(xml: &str) -> Result<FieldSpecs> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut specs = FieldSpecs::new();
    let mut current: Option<TableSpec> = None;
    loop {
        let event = reader.read_event().map_err(|e| {
            spec_error(format!("at byte {}: {}", reader.buffer_position(), e))
        })?;
        match event {
            Event::Start(e) if e.name().as_ref() == b"table" => {
                current = Some(table_spec(&e)?);
            }
            Event::Empty(e) if e.name().as_ref() == b"table" => {
                let table = table_spec(&e)?;
                specs.insert(table.name.clone(), table);
            }
            Event::Start(e) | Event::Empty(e) if e.name().as_ref() == b"field" => {
                let table = current
                    .as_mut()
                    .ok_or_else(|| spec_error("<field> outside of a <table>"))?;
                table.fields.push(field_spec(attributes(&e)?)?);
            }
            Event::End(e) if e.name().as_ref() == b"table" => {
                if let Some(table) = current.take() {
                    specs.insert(table.name.clone(), table);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    if let Some(table) = current {
        return Err(spec_error(format!("unclosed <table name=\"{}\">", table.name)));
    }
    debug!(tables = specs.len(), "parsed field specs");
    Ok(specs)
}

/// Parse a relation-spec document into `{relation name → relation}`.
///
/// The parent table is the part of the relation name left of the colon.
pub fn parse_relation_specs(xml: &str) -> Result<RelationSpecs> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut specs = RelationSpecs::new();
    loop {
        let event = reader.read_event().map_err(|e| {
            spec_error(format!("at byte {}: {}", reader.buffer_position(), e))
        })?;
        match event {
            Event::Start(e) | Event::Empty(e) if e.name().as_ref() == b"relation" => {
                let relation = relation_spec(attributes(&e)?)?;
                specs.insert(relation.name.clone(), relation);
            }
            Event::Eof => break,
            _ => {}
        }
    }
    debug!(relations = specs.len(), "parsed relation specs");
    Ok(specs)
}

fn relation_spec(attrs: Vec<(String, String)>) -> Result<RelationSpec> {
    let mut name = String::new();
    let mut child = String::new();
    let mut parent_field = String::new();
    let mut child_field = String::new();
    for (key, value) in attrs {
        match key.as_str() {
            "name" => name = value,
            "child" => child = value,
            "parentField" => parent_field = value,
            "childField" => child_field = value,
            _ => {}
        }
    }
    let Some((parent, named_child)) = name.split_once(':') else {
        return Err(spec_error(format!(
            "relation name '{}' is not of the form parent:child",
            name
        )));
    };
    let parent = parent.trim().to_string();
    if child.is_empty() {
        child = named_child.trim().to_string();
    }
    if parent.is_empty() || child.is_empty() {
        return Err(spec_error(format!("relation '{}' names no parent or child", name)));
    }
    if child_field.is_empty() {
        return Err(spec_error(format!("relation '{}' has no childField", name)));
    }
    Ok(RelationSpec {
        name,
        parent,
        child,
        parent_field,
        child_field,
    })
}

pub fn load_field_specs(path: &Path) -> Result<FieldSpecs> {
    let content = read(path)?;
    parse_field_specs(&content)
}

pub fn load_relation_specs(path: &Path) -> Result<RelationSpecs> {
    let content = read(path)?;
    parse_relation_specs(&content)
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| spec_error(format!("failed to read {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const FIELDS: &str = r#"
        <tables>
          <table name="customer">
            <field name="pkid" caption="ID" type="int" listInclude="1" listOrder="0"/>
            <field name="company" caption="Company &amp; Co" type="char"
                   searchInclude="1" searchOrder="1" listInclude="1" listOrder="10"
                   editInclude="1" editOrder="1" wordSearch="1" selectTypes="like, equals"/>
            <field name="balance" type="decimal" editInclude="yes" editOrder="2" editReadOnly="true"/>
          </table>
          <table name="orders">
            <field name="amount" type="decimal"/>
          </table>
        </tables>
    "#;

    #[rstest]
    fn test_parse_field_specs() {
        let specs = parse_field_specs(FIELDS).unwrap();
        assert_eq!(specs.len(), 2);

        let customer = &specs["customer"];
        let company = customer.field("company").unwrap();
        assert_eq!(company.caption, "Company & Co");
        assert_eq!(company.field_type, FieldType::Char);
        assert_eq!(company.select_types, vec!["like", "equals"]);
        assert!(company.word_search);

        let balance = customer.field("balance").unwrap();
        assert_eq!(balance.caption, "balance");
        assert!(balance.edit_read_only);

        assert_eq!(customer.list_fields(), vec!["pkid", "company"]);
        assert_eq!(customer.edit_fields(), vec!["company", "balance"]);
        assert_eq!(customer.search_fields(), vec!["company"]);
    }

    #[rstest]
    #[case(r#"<field name="x"/>"#, "outside")]
    #[case(r#"<table name="t"><field caption="x"/></table>"#, "without a name")]
    #[case(r#"<table name="t"><field name="x" type="blob?"/></table>"#, "unknown field type")]
    #[case(r#"<table name="t"><field name="x" listOrder="first"/></table>"#, "not a number")]
    #[case(r#"<table><field name="x"/></table>"#, "<table> without a name")]
    fn test_field_spec_errors(#[case] xml: &str, #[case] expected: &str) {
        let err = parse_field_specs(xml).unwrap_err();
        assert!(err.to_string().contains(expected), "{}", err);
    }

    #[rstest]
    fn test_parse_relation_specs() {
        let specs = parse_relation_specs(
            r#"<relations>
                 <relation name="customer:orders" child="orders" parentField="pkid" childField="custid"/>
                 <relation name="orders:lines" childField="orderid"/>
               </relations>"#,
        )
        .unwrap();
        let orders = &specs["customer:orders"];
        assert_eq!(orders.parent, "customer");
        assert_eq!(orders.child, "orders");
        assert_eq!(orders.parent_field, "pkid");
        assert_eq!(specs["orders:lines"].child, "lines");
        assert!(specs["orders:lines"].parent_field.is_empty());
    }

    #[rstest]
    fn test_relation_name_needs_colon() {
        let err = parse_relation_specs(r#"<relation name="orders" childField="x"/>"#).unwrap_err();
        assert!(matches!(err, DaboError::Spec { .. }));
    }

    #[rstest]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(FIELDS.as_bytes()).unwrap();
        let specs = load_field_specs(file.path()).unwrap();
        assert!(specs.contains_key("orders"));

        let missing = load_relation_specs(Path::new("/nonexistent/relations.xml"));
        assert!(missing.is_err());
    }
}
