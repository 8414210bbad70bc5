//! Object spaces, databases and transactions
//!
//! The engine is the user-facing entry to the store: an [`ObjectSpace`]
//! wraps a [`atomdb_storage::SharedStorage`], names databases inside it,
//! and hands out [`ObjectTransaction`]s. A transaction captures the root
//! pointer at start (snapshot isolation), stages new atoms privately, and
//! publishes them with an optimistic, root-key-granular commit.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod space;
pub mod transaction;

pub use space::{Database, ObjectSpace};
pub use transaction::{ObjectTransaction, TransactionStatus};
