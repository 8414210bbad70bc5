//! Shared fixtures for the end-to-end scenarios.

use atomdb::query::{FieldPath, Row};
use atomdb::{Atom, AtomRef, AtomSource, Database, Literal, ObjectTransaction, Record, Value};

/// Route engine traces into the test output; safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn lit(text: &str) -> AtomRef {
    AtomRef::new(Atom::Literal(Literal::new(text)))
}

pub fn record_ref(record: Record) -> AtomRef {
    AtomRef::new(Atom::Record(record))
}

pub fn user_record(
    tx: &ObjectTransaction,
    id: i64,
    age: i64,
    country: &str,
    last_login: i64,
) -> Record {
    tx.new_record()
        .set("id", Value::Int(id))
        .unwrap()
        .set("age", Value::Int(age))
        .unwrap()
        .set("country", Value::from(country))
        .unwrap()
        .set("last_login", Value::Int(last_login))
        .unwrap()
}

pub fn ids_of(rows: &[Row], db: &Database) -> Vec<i64> {
    let path = FieldPath::parse("r.id").unwrap();
    let src = db.storage().as_ref();
    rows.iter()
        .map(|r| match r.value(&path, src).unwrap() {
            Value::Int(i) => i,
            other => panic!("unexpected id {:?}", other),
        })
        .collect()
}

pub fn name_of(row: &Row, src: &dyn AtomSource) -> String {
    let path = FieldPath::parse("r.name").unwrap();
    match row.value(&path, src).unwrap() {
        Value::String(s) => s,
        other => panic!("unexpected name {:?}", other),
    }
}
