//! Atom storage: block providers, the WAL append path and the shared store
//!
//! The storage engine sits between the collection model and raw bytes:
//!
//! - a [`BlockProvider`] supplies append-only WAL streams, positional
//!   readers and the crash-safe root pointer cell
//! - the [`wal::WalBuffer`] batches serialized atoms into bounded, lock
//!   protected fragments and flushes them outside the lock
//! - the [`codec`] turns atoms into length-prefixed, tagged, checksummed
//!   records and back
//! - [`SharedStorage`] ties the three together and memoizes resolution by
//!   pointer

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod file;
pub mod memory;
pub mod provider;
pub mod shared;
pub mod wal;

pub use file::FileBlockProvider;
pub use memory::MemoryBlockProvider;
pub use provider::{BlockProvider, ReadStream, WalWriteStream};
pub use shared::SharedStorage;
pub use wal::{WalBuffer, WalConfig};
