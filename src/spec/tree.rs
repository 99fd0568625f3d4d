use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use tracing::{debug, info};

use super::{RelationSpec, RelationSpecs};
use crate::bizobj::Bizobj;
use crate::db::Connection;
use crate::error::Result;

/// Constructor for a named bizobj.
pub type BizobjFactory = Box<dyn Fn(&Rc<Connection>) -> Result<Bizobj>>;

/// Named bizobj constructors used when building trees from relation specs.
///
/// A name with no registered constructor gets a generic bizobj over the
/// table of that name, keyed on the table's primary key columns.
#[derive(Default)]
pub struct BizobjRegistry {
    factories: BTreeMap<String, BizobjFactory>,
}

impl BizobjRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        name: &str,
        factory: impl Fn(&Rc<Connection>) -> Result<Bizobj> + 'static,
    ) -> &mut Self {
        self.factories.insert(name.to_string(), Box::new(factory));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Construct the child side of `relation`, linked through its child field.
    pub fn create(&self, conn: &Rc<Connection>, relation: &RelationSpec) -> Result<Bizobj> {
        let mut bizobj = match self.factories.get(&relation.child) {
            Some(factory) => factory(conn)?,
            None => generic(conn, relation)?,
        };
        if bizobj.link_field().is_empty() {
            bizobj.set_link_field(&relation.child_field);
        }
        Ok(bizobj)
    }

    /// Attach every relation's child beneath `root`.
    ///
    /// A relation is applied once its parent is present in the tree, so the
    /// pass repeats until nothing new attaches; relations whose parent never
    /// appears are left out. Returns the number of children attached.
    pub fn add_children_from_relations(
        &self,
        root: &mut Bizobj,
        relations: &RelationSpecs,
    ) -> Result<usize> {
        let conn = Rc::clone(root.connection());
        let mut applied: BTreeSet<&str> = BTreeSet::new();
        let mut total = 0;
        loop {
            let mut attached = 0;
            for (name, relation) in relations {
                if applied.contains(name.as_str()) || root.find(&relation.parent).is_none() {
                    continue;
                }
                applied.insert(name);
                if root.find(&relation.child).is_some() {
                    debug!(relation = %name, "child already in tree");
                    continue;
                }
                let child = self.create(&conn, relation)?;
                let Some(parent) = root.find_mut(&relation.parent) else {
                    continue;
                };
                if !relation.parent_field.is_empty() {
                    parent.set_parent_link_field(&relation.parent_field);
                }
                parent.add_child(child)?;
                info!(parent = %relation.parent, child = %relation.child, "attached child");
                attached += 1;
            }
            if attached == 0 {
                break;
            }
            total += attached;
        }
        Ok(total)
    }
}

fn generic(conn: &Rc<Connection>, relation: &RelationSpec) -> Result<Bizobj> {
    let table = relation.child.as_str();
    let keys: Vec<String> = conn
        .get_fields(table)?
        .into_iter()
        .filter(|f| f.primary_key)
        .map(|f| f.name)
        .collect();
    Bizobj::builder(table)
        .key_field(&keys.join(","))
        .link_field(&relation.child_field)
        .order_by(keys.first().map_or("1", String::as_str))
        .build(conn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::tests::recorded_connection;
    use crate::spec::parse_relation_specs;
    use crate::value::Value;
    use rstest::rstest;

    const SCHEMA: &str = "
        CREATE TABLE customer (pkid INTEGER PRIMARY KEY, company TEXT);
        CREATE TABLE orders (pkid INTEGER PRIMARY KEY, custid INTEGER);
        CREATE TABLE lines (pkid INTEGER PRIMARY KEY, orderid INTEGER, item TEXT);
        INSERT INTO customer VALUES (1, 'Acme');
        INSERT INTO orders VALUES (10, 1), (11, 1);
        INSERT INTO lines VALUES (100, 10, 'bolt'), (101, 10, 'nut'), (102, 11, 'gear');
    ";

    const RELATIONS: &str = r#"
        <relations>
          <relation name="orders:lines" child="lines" parentField="pkid" childField="orderid"/>
          <relation name="customer:orders" child="orders" parentField="pkid" childField="custid"/>
          <relation name="warehouse:bins" child="bins" childField="warehouseid"/>
        </relations>
    "#;

    #[rstest]
    fn test_builds_nested_tree() {
        let (conn, _) = recorded_connection(SCHEMA);
        let mut root = Bizobj::builder("customer").key_field("pkid").build(&conn).unwrap();
        let relations = parse_relation_specs(RELATIONS).unwrap();

        let attached = BizobjRegistry::new()
            .add_children_from_relations(&mut root, &relations)
            .unwrap();
        assert_eq!(attached, 2);

        let orders = root.child("orders").unwrap();
        assert_eq!(orders.link_field(), "custid");
        assert_eq!(orders.key_field(), "pkid");
        assert_eq!(orders.get_row_count(), 2);

        let lines = orders.child("lines").unwrap();
        assert_eq!(lines.get_row_count(), 2);
        assert!(root.find("bins").is_none());
    }

    #[rstest]
    fn test_registered_factory_is_used() {
        let (conn, _) = recorded_connection(SCHEMA);
        let mut root = Bizobj::builder("customer").key_field("pkid").build(&conn).unwrap();
        let relations = parse_relation_specs(RELATIONS).unwrap();

        let mut registry = BizobjRegistry::new();
        registry.register("orders", |conn| {
            Bizobj::builder("orders")
                .key_field("pkid")
                .where_clause("pkid > 10")
                .default_value("custid", 0)
                .no_data_on_load(true)
                .build(conn)
        });
        assert!(registry.contains("orders"));
        registry.add_children_from_relations(&mut root, &relations).unwrap();

        let orders = root.find_mut("orders").unwrap();
        assert_eq!(orders.link_field(), "custid");
        assert_eq!(orders.get_row_count(), 0);
        assert_eq!(orders.child("lines").unwrap().get_row_count(), 0);

        orders.requery().unwrap();
        assert_eq!(orders.get_row_count(), 1);
        assert_eq!(orders.get_pk(), Some(Value::Int(11)));
        let lines = orders.child("lines").unwrap();
        assert_eq!(lines.get_field_val("item"), Some(&Value::from("gear")));
    }
}
