//! End-to-end scenarios over real storage: commit/reopen round trips,
//! indexed queries, concurrent writers, crash safety and traversal.

mod helpers;

use atomdb::query::{
    from_collection, FilterSpec, FromPlan, ListPlan, Plan, QueryContext, Queryable,
    TraverseOptions,
};
use atomdb::{Atom, AtomRef, ObjectSpace, SourceHandle, Value};
use helpers::{ids_of, init_tracing, lit, name_of, record_ref, user_record};
use std::collections::BTreeMap;
use std::sync::Arc;

#[test]
fn hash_dictionary_shape_after_three_inserts() {
    let space = ObjectSpace::in_memory().unwrap();
    let db = space.new_database("shapes").unwrap();
    let tx = db.new_transaction().unwrap();

    let dict = tx
        .new_hash_dictionary()
        .set_at(1, lit("A"), &tx)
        .unwrap()
        .set_at(2, lit("B"), &tx)
        .unwrap()
        .set_at(3, lit("C"), &tx)
        .unwrap();
    assert_eq!(dict.height(), 2);
    assert_eq!(dict.count(), 3);

    tx.set_root_object("numbers", AtomRef::new(Atom::HashDictionary(dict)))
        .unwrap();
    tx.commit().unwrap();

    let tx2 = db.new_transaction().unwrap();
    let found = tx2.get_root_object("numbers").unwrap().unwrap();
    let atom = found.resolve(&tx2).unwrap();
    let dict = atom.expect_hash_dictionary().unwrap();
    dict.verify_invariants(&tx2).unwrap();
    let entries = dict.entries(&tx2).unwrap();
    let keys: Vec<i64> = entries.iter().map(|(k, _)| *k).collect();
    assert_eq!(keys, vec![1, 2, 3]);
    let first = entries[0].1.resolve(&tx2).unwrap();
    assert_eq!(first.expect_literal().unwrap().text(), "A");
}

#[test]
fn dictionary_survives_reopen_structurally_equal() {
    let dir = tempfile::tempdir().unwrap();
    {
        let space = ObjectSpace::open_path(dir.path(), true).unwrap();
        let db = space.new_database("catalog").unwrap();
        let tx = db.new_transaction().unwrap();
        let dict = tx
            .new_dictionary()
            .set_at("alpha", lit("X"), &tx, &tx)
            .unwrap()
            .set_at("beta", lit("Y"), &tx, &tx)
            .unwrap();
        tx.set_root_object("names", AtomRef::new(Atom::Dictionary(dict)))
            .unwrap();
        tx.commit().unwrap();
        space.close().unwrap();
    }

    // A fresh process: new provider, cold cache.
    let space = ObjectSpace::open_path(dir.path(), false).unwrap();
    let db = space.open_database("catalog").unwrap();
    let tx = db.new_transaction().unwrap();
    let found = tx.get_root_object("names").unwrap().unwrap();
    let atom = found.resolve(&tx).unwrap();
    let dict = atom.expect_dictionary().unwrap();
    assert_eq!(dict.count(), 2);
    let alpha = dict.get_at("alpha", &tx).unwrap().unwrap();
    assert_eq!(alpha.resolve(&tx).unwrap().expect_literal().unwrap().text(), "X");
    assert!(dict.get_at("gamma", &tx).unwrap().is_none());
}

/// Spec scenario: adults from ES or AR, newest login first, top 3, over a
/// committed collection with a secondary index on country.
#[test]
fn indexed_query_over_committed_records() {
    init_tracing();
    let space = ObjectSpace::in_memory().unwrap();
    let db = space.new_database("people").unwrap();

    let tx = db.new_transaction().unwrap();
    let rows = [
        (1, 30, "ES", 500),
        (2, 17, "AR", 900),
        (3, 25, "US", 700),
        (4, 22, "AR", 800),
    ];
    let mut users = tx.new_set();
    let mut by_country = tx.new_repeated_keys_dictionary();
    for (id, age, country, login) in rows {
        let user = record_ref(user_record(&tx, id, age, country, login));
        users = users.add(user.clone(), &tx).unwrap();
        by_country = by_country
            .set_at(Value::from(country), user, &tx)
            .unwrap();
    }
    tx.set_root_object("users", AtomRef::new(Atom::Set(users)))
        .unwrap();
    tx.set_root_object(
        "users.by_country",
        AtomRef::new(Atom::RepeatedKeysDictionary(by_country)),
    )
    .unwrap();
    tx.commit().unwrap();

    // Query in a fresh transaction.
    let tx = db.new_transaction().unwrap();
    let users = tx.get_root_object("users").unwrap().unwrap();
    let users = users.resolve(&tx).unwrap().expect_set().unwrap().clone();
    let index_ref = tx.get_root_object("users.by_country").unwrap().unwrap();
    let index = index_ref
        .resolve(&tx)
        .unwrap()
        .expect_repeated()
        .unwrap()
        .clone();

    let src: SourceHandle = db.storage().clone();
    let ctx = QueryContext::new(src);
    let mut indexes = BTreeMap::new();
    indexes.insert("r.country".to_string(), index);

    let q = Queryable::from_set(users, ctx)
        .with_indexes(indexes)
        .where_spec(FilterSpec::cmp("r.age", ">=", 18).and(FilterSpec::in_list(
            "r.country",
            [Value::from("ES"), Value::from("AR")],
        )))
        .order_by("r.last_login", false, true)
        .unwrap()
        .take(3);

    let explain = q.explain().unwrap();
    assert!(
        explain.contains("IndexedSearchPlan") || explain.contains("WherePlan"),
        "unexpected plan: {}",
        explain
    );
    let out = q.to_list().unwrap();
    assert_eq!(ids_of(&out, &db), vec![4, 1]);
}

#[test]
fn planner_matches_linear_scan_on_committed_data() {
    let space = ObjectSpace::in_memory().unwrap();
    let db = space.new_database("equiv").unwrap();

    let tx = db.new_transaction().unwrap();
    let mut users = tx.new_set();
    let mut by_age = tx.new_repeated_keys_dictionary();
    for id in 0..60 {
        let age = (id * 7) % 40;
        let user = record_ref(user_record(&tx, id, age, "XX", 0));
        users = users.add(user.clone(), &tx).unwrap();
        by_age = by_age.set_at(Value::Int(age), user, &tx).unwrap();
    }
    tx.set_root_object("users", AtomRef::new(Atom::Set(users.clone())))
        .unwrap();
    tx.set_root_object("users.by_age", AtomRef::new(Atom::RepeatedKeysDictionary(by_age.clone())))
        .unwrap();
    tx.commit().unwrap();

    let src: SourceHandle = db.storage().clone();
    let spec = FilterSpec::between("r.age", 10, 25, (true, false));

    let scan = Queryable::from_set(users.clone(), QueryContext::new(src.clone()))
        .where_spec(spec.clone())
        .to_list()
        .unwrap();
    let mut indexes = BTreeMap::new();
    indexes.insert("r.age".to_string(), by_age);
    let planned = Queryable::from_set(users, QueryContext::new(src))
        .with_indexes(indexes)
        .where_spec(spec)
        .to_list()
        .unwrap();

    let mut scan_ids = ids_of(&scan, &db);
    let mut planned_ids = ids_of(&planned, &db);
    scan_ids.sort();
    planned_ids.sort();
    assert_eq!(scan_ids, planned_ids);
    assert!(!scan_ids.is_empty());
}

/// Spec scenario: two writers from the same root; the loser aborts and a
/// subsequent reader sees the winner's root.
#[test]
fn concurrent_writers_serialize_at_root_update() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let space = ObjectSpace::open_path(dir.path(), true).unwrap();
    let db = space.new_database("race").unwrap();

    let seed = db.new_transaction().unwrap();
    seed.set_root_object("users", lit("seed")).unwrap();
    seed.commit().unwrap();

    let t1 = db.new_transaction().unwrap();
    let t2 = db.new_transaction().unwrap();
    t1.set_root_object("users", lit("one")).unwrap();
    t2.set_root_object("users", lit("two")).unwrap();

    let h1 = std::thread::spawn(move || t1.commit().map(|_| "one"));
    let h2 = std::thread::spawn(move || t2.commit().map(|_| "two"));
    let r1 = h1.join().unwrap();
    let r2 = h2.join().unwrap();

    let (winner, loser_err) = match (r1, r2) {
        (Ok(w), Err(e)) => (w, e),
        (Err(e), Ok(w)) => (w, e),
        other => panic!("expected exactly one winner, got {:?}", other),
    };
    assert!(loser_err.is_validation());

    let reader = db.new_transaction().unwrap();
    let users = reader.get_root_object("users").unwrap().unwrap();
    let text = users
        .resolve(&reader)
        .unwrap()
        .expect_literal()
        .unwrap()
        .text()
        .to_string();
    assert_eq!(text, winner);
}

/// Commit is all-or-nothing: atoms flushed to the WAL without a root
/// publication are invisible after reopen.
#[test]
fn crash_before_root_update_preserves_old_root() {
    let dir = tempfile::tempdir().unwrap();
    {
        let space = ObjectSpace::open_path(dir.path(), true).unwrap();
        let db = space.new_database("crashy").unwrap();
        let tx = db.new_transaction().unwrap();
        tx.set_root_object("value", lit("committed")).unwrap();
        tx.commit().unwrap();

        // A second "transaction" that dies between WAL flush and root
        // publication: its atoms reach the WAL but the root is untouched.
        let storage = space.storage();
        storage
            .push_atom(Arc::new(Atom::Literal(atomdb::Literal::new("orphan"))))
            .get()
            .unwrap();
        storage.flush_wal().unwrap();
        // No close(): simulate the process dying here.
    }

    let space = ObjectSpace::open_path(dir.path(), false).unwrap();
    let db = space.open_database("crashy").unwrap();
    let tx = db.new_transaction().unwrap();
    let value = tx.get_root_object("value").unwrap().unwrap();
    assert_eq!(
        value.resolve(&tx).unwrap().expect_literal().unwrap().text(),
        "committed"
    );
}

/// Spec scenario: management-chain traversal with depth limits and a
/// cycle built from path-copied record versions.
#[test]
fn traversal_over_committed_hierarchy() {
    let space = ObjectSpace::in_memory().unwrap();
    let db = space.new_database("org").unwrap();

    let tx = db.new_transaction().unwrap();
    let named = |name: &str| {
        tx.new_record()
            .set("name", Value::from(name))
            .unwrap()
    };
    let ceo = named("CEO");
    let vp1 = named("VP1").set("manager", record_ref(ceo.clone())).unwrap();
    let dir1 = named("Director1")
        .set("manager", record_ref(vp1.clone()))
        .unwrap();
    let mgr1 = named("Manager1").set("manager", record_ref(dir1)).unwrap();
    let emp1 = named("Employee1").set("manager", record_ref(mgr1)).unwrap();

    let peer1 = named("Cyclic1");
    let peer2 = named("Cyclic2").set("peer", record_ref(peer1.clone())).unwrap();
    let peer1 = peer1.set("peer", record_ref(peer2)).unwrap();

    let mut employees = tx.new_set();
    for rec in [emp1, peer1] {
        employees = employees.add(record_ref(rec), &tx).unwrap();
    }
    tx.set_root_object("employees", AtomRef::new(Atom::Set(employees)))
        .unwrap();
    tx.commit().unwrap();

    let tx = db.new_transaction().unwrap();
    let set_ref = tx.get_root_object("employees").unwrap().unwrap();
    let employees = set_ref.resolve(&tx).unwrap().expect_set().unwrap().clone();
    let src: SourceHandle = db.storage().clone();
    let ctx = QueryContext::new(src.clone());

    let chain = Queryable::from_set(employees.clone(), ctx.clone())
        .where_spec(FilterSpec::cmp("r.name", "==", "Employee1"))
        .traverse("manager", TraverseOptions::default())
        .to_list()
        .unwrap();
    let names: Vec<String> = chain.iter().map(|r| name_of(r, &*src)).collect();
    assert_eq!(names, vec!["Manager1", "Director1", "VP1", "CEO"]);

    let bounded = Queryable::from_set(employees.clone(), ctx.clone())
        .where_spec(FilterSpec::cmp("r.name", "==", "Employee1"))
        .traverse(
            "manager",
            TraverseOptions {
                max_depth: Some(2),
                ..TraverseOptions::default()
            },
        )
        .to_list()
        .unwrap();
    let names: Vec<String> = bounded.iter().map(|r| name_of(r, &*src)).collect();
    assert_eq!(names, vec!["Manager1", "Director1"]);

    let cycle = Queryable::from_set(employees, ctx)
        .where_spec(FilterSpec::cmp("r.name", "==", "Cyclic1"))
        .traverse(
            "peer",
            TraverseOptions {
                max_depth: Some(5),
                ..TraverseOptions::default()
            },
        )
        .to_list()
        .unwrap();
    let names: Vec<String> = cycle.iter().map(|r| name_of(r, &*src)).collect();
    assert_eq!(names, vec!["Cyclic2"]);
}

#[test]
fn list_slicing_across_commits() {
    let space = ObjectSpace::in_memory().unwrap();
    let db = space.new_database("lists").unwrap();
    let tx = db.new_transaction().unwrap();
    let mut list = tx.new_list();
    for i in 0..10 {
        list = list.append_last(lit(&i.to_string()), &tx).unwrap();
    }
    tx.set_root_object("seq", AtomRef::new(Atom::List(list)))
        .unwrap();
    tx.commit().unwrap();

    let tx = db.new_transaction().unwrap();
    let list_ref = tx.get_root_object("seq").unwrap().unwrap();
    let list = list_ref.resolve(&tx).unwrap().expect_list().unwrap().clone();
    assert_eq!(list.count(), 10);
    let middle = list.slice(3, 6, &tx).unwrap();
    let texts: Vec<String> = middle
        .elements(&tx)
        .unwrap()
        .iter()
        .map(|r| {
            r.resolve(&tx)
                .unwrap()
                .expect_literal()
                .unwrap()
                .text()
                .to_string()
        })
        .collect();
    assert_eq!(texts, vec!["3", "4", "5"]);
    // Slicing never disturbs the stored list.
    assert_eq!(list.count(), 10);
}

#[test]
fn from_plan_explain_names_nodes() {
    let src: SourceHandle = Arc::new(atomdb::collections::NullSource);
    let ctx = QueryContext::new(src);
    let base = Plan::From(FromPlan::new(
        "r",
        Plan::List(ListPlan::from_rows(Vec::new())),
        BTreeMap::new(),
    ));
    let q = from_collection(base, ctx).where_spec(FilterSpec::cmp("r.x", "==", 1));
    let explain = q.explain().unwrap();
    assert!(explain.contains("plan: where"), "{}", explain);
    assert!(explain.contains("optimized: WherePlan"), "{}", explain);
}
