//! atomdb: an embedded, transactional, content-addressed object database
//!
//! Data is stored as immutable *atoms* in append-only write-ahead logs.
//! Collections are persistent AVL trees with path copying, so every commit
//! is a cheap snapshot; a single atomically updated root pointer makes
//! commits all-or-nothing. A LINQ-style query layer compiles predicates
//! into plans and rewrites them to use secondary indexes.
//!
//! ## Quick start
//!
//! ```ignore
//! use atomdb::{ObjectSpace, Atom, AtomRef, Value};
//!
//! let space = ObjectSpace::open_path("/var/lib/myapp/db", true)?;
//! let db = space.new_database("app")?;
//!
//! let tx = db.new_transaction()?;
//! let user = tx.new_record()
//!     .set("age", Value::Int(30))?
//!     .set("country", Value::from("ES"))?;
//! let users = tx.new_set().add(AtomRef::new(Atom::Record(user)), &tx)?;
//! tx.set_root_object("users", AtomRef::new(Atom::Set(users)))?;
//! tx.commit()?;
//! ```
//!
//! Queries build on [`query::Queryable`]:
//!
//! ```ignore
//! use atomdb::query::{Queryable, FilterSpec, QueryContext};
//!
//! let adults = Queryable::from_set(users, ctx)
//!     .where_spec(FilterSpec::cmp("r.age", ">=", 18))
//!     .order_by("r.age", true, true)?
//!     .to_list()?;
//! ```

#![warn(missing_docs)]

pub use atomdb_collections as collections;
pub use atomdb_core as core;
pub use atomdb_engine as engine;
pub use atomdb_executor as executor;
pub use atomdb_query as query;
pub use atomdb_storage as storage;

pub use atomdb_collections::{
    Atom, AtomRef, AtomSource, Dictionary, HashDictionary, List, Literal, Record,
    RepeatedKeysDictionary, RootObject, Set, SourceHandle,
};
pub use atomdb_core::{AtomPointer, CancellationToken, Error, Result, TxnId, Value, WalId};
pub use atomdb_engine::{Database, ObjectSpace, ObjectTransaction, TransactionStatus};
pub use atomdb_storage::{BlockProvider, FileBlockProvider, MemoryBlockProvider, SharedStorage};
