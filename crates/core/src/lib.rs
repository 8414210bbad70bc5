//! Core types for the atomdb object database
//!
//! This crate defines the foundational types used throughout the system:
//! - WalId / TxnId: 128-bit identifiers for WAL files and transactions
//! - AtomPointer: durable reference to a serialized atom
//! - Value: scalar payload for record fields and index keys
//! - Error: error type hierarchy
//! - Future: synchronous future returned by storage operations
//! - CancellationToken: cooperative cancellation with optional deadline

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cancel;
pub mod env;
pub mod error;
pub mod future;
pub mod pointer;
pub mod value;

pub use cancel::CancellationToken;
pub use error::{Error, Result};
pub use future::Future;
pub use pointer::{AtomPointer, TxnId, WalId, POINTER_ENCODED_LEN};
pub use value::Value;

/// 1 KiB.
pub const KB: usize = 1024;
/// 1 MiB.
pub const MB: usize = KB * KB;
/// 1 GiB.
pub const GB: usize = KB * MB;
