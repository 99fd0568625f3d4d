//! Integration tests against a live PostgreSQL server.
//!
//! Run with: cargo test --features postgres-tests
//!
//! Prerequisites:
//! 1. PostgreSQL reachable on localhost as user `postgres`
//! 2. Create test database: `createdb -U postgres dabo_test`
//!
//! `DATABASE_URL` overrides the default connection URL.

#![cfg(feature = "postgres-tests")]

use std::rc::Rc;

use dabo::config::ConnectInfo;
use dabo::{BackendKind, Bizobj, Code, Connection, RefIntegrity, Value};
use rstest::{fixture, rstest};

const PG_URL: &str = "postgres://postgres@localhost/dabo_test";

/// Open a connection and recreate the test tables.
#[fixture]
fn conn() -> Rc<Connection> {
    let url = std::env::var("DATABASE_URL").unwrap_or_else(|_| PG_URL.to_string());
    let info = ConnectInfo::from_url(&url).expect("valid url");
    assert_eq!(info.backend, BackendKind::Postgres);
    let conn = Connection::open(info).expect("postgres reachable");
    for sql in [
        "DROP TABLE IF EXISTS dabo_orders",
        "DROP TABLE IF EXISTS dabo_customer",
        "CREATE TABLE dabo_customer (pkid SERIAL PRIMARY KEY, company VARCHAR(40) NOT NULL DEFAULT '', active BOOLEAN DEFAULT TRUE)",
        "CREATE TABLE dabo_orders (pkid SERIAL PRIMARY KEY, custid INTEGER NOT NULL, amount NUMERIC(10,2) DEFAULT 0 CHECK (amount >= 0))",
        "INSERT INTO dabo_customer (company) VALUES ('Acme')",
        "INSERT INTO dabo_orders (custid, amount) VALUES (1, 5), (1, 7.5)",
    ] {
        conn.execute(sql, &[]).expect("setup statement");
    }
    conn
}

fn tree(conn: &Rc<Connection>) -> Bizobj {
    let mut parent = Bizobj::builder("dabo_customer")
        .key_field("pkid")
        .order_by("pkid")
        .delete_child_logic(RefIntegrity::Cascade)
        .build(conn)
        .unwrap();
    let child = Bizobj::builder("dabo_orders")
        .key_field("pkid")
        .link_field("custid")
        .order_by("pkid")
        .build(conn)
        .unwrap();
    parent.add_child(child).unwrap();
    parent
}

#[rstest]
fn test_introspection(conn: Rc<Connection>) {
    let tables = conn.get_tables().unwrap();
    assert!(tables.iter().any(|t| t == "dabo_customer"));

    let fields = conn.get_fields("dabo_customer").unwrap();
    let pk: Vec<_> = fields.iter().filter(|f| f.primary_key).map(|f| f.name.as_str()).collect();
    assert_eq!(pk, vec!["pkid"]);
    assert_eq!(conn.get_table_record_count("dabo_orders").unwrap(), 2);
}

#[rstest]
fn test_link_filter_uses_numbered_placeholder(conn: Rc<Connection>) {
    let parent = tree(&conn);
    let orders = parent.child("dabo_orders").unwrap();
    assert_eq!(orders.get_row_count(), 2);
    assert!(orders.get_sql().contains("custid = $1"));
}

#[rstest]
fn test_insert_reads_serial_key(conn: Rc<Connection>) {
    let mut parent = tree(&conn);
    parent.flags_mut().new_child_on_new = true;

    assert_eq!(parent.new_record().unwrap(), Code::FileOk);
    parent.set_field_val("company", "Gamma").unwrap();
    parent
        .child_mut("dabo_orders")
        .unwrap()
        .set_field_val("amount", "12.5")
        .unwrap();
    assert_eq!(parent.save().unwrap(), Code::FileOk);

    assert_eq!(parent.get_pk(), Some(Value::Int(2)));
    let orders = parent.child("dabo_orders").unwrap();
    assert_eq!(orders.get_field_val("custid"), Some(&Value::Int(2)));
    assert!(!conn.in_transaction());
}

#[rstest]
fn test_child_failure_rolls_back(conn: Rc<Connection>) {
    let mut parent = tree(&conn);
    parent.set_field_val("company", "Changed").unwrap();
    parent
        .child_mut("dabo_orders")
        .unwrap()
        .set_field_val("amount", -1)
        .unwrap();

    assert_eq!(parent.save().unwrap(), Code::FileCancel);
    let company = conn
        .execute("SELECT company FROM dabo_customer WHERE pkid = 1", &[])
        .unwrap();
    assert_eq!(company.scalar(), Some(&Value::from("Acme")));
}

#[rstest]
fn test_cascade_delete(conn: Rc<Connection>) {
    let mut parent = tree(&conn);
    assert_eq!(parent.delete().unwrap(), Code::FileOk);
    assert_eq!(parent.get_row_count(), 0);
    assert_eq!(conn.get_table_record_count("dabo_orders").unwrap(), 0);
}
