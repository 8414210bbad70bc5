//! The block provider contract consumed by the storage engine.

use atomdb_core::{AtomPointer, Result, TxnId, WalId};
use std::io::Read;

/// Positional write access to the writer WAL.
///
/// A streamer is scoped: it is acquired for one flush batch and must leave
/// the data durable once [`WalWriteStream::flush`] returns.
pub trait WalWriteStream: Send {
    /// Position the stream at an absolute WAL offset.
    fn seek_to(&mut self, position: u64) -> Result<()>;

    /// Append a fragment at the current position.
    fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Durability barrier for everything written so far.
    fn flush(&mut self) -> Result<()>;
}

/// Read cursor over a WAL at an arbitrary position.
///
/// Multiple readers may coexist on any WAL, including the writer's; each
/// keeps an independent position.
pub trait ReadStream: Read + Send + std::fmt::Debug {}

impl<T: Read + Send + std::fmt::Debug> ReadStream for T {}

/// Append-only block storage with a durable root pointer.
///
/// All operations may fail transiently (the storage layer retries a bounded
/// number of times) or fatally (surfaced as corruption; the transaction
/// aborts without touching the root).
pub trait BlockProvider: Send + Sync {
    /// The single append-target WAL for this process, with the next free
    /// offset. Acquiring it implies an exclusive write claim.
    fn get_writer_wal(&self) -> Result<(WalId, u64)>;

    /// Scoped acquisition of a write stream over the writer WAL.
    fn write_streamer(&self) -> Result<Box<dyn WalWriteStream>>;

    /// Open a read cursor on `wal_id` at `position`.
    fn get_reader(&self, wal_id: WalId, position: u64) -> Result<Box<dyn ReadStream>>;

    /// Read the currently published root pointer, if any.
    fn get_current_root(&self) -> Result<Option<AtomPointer>>;

    /// Publish a new root pointer.
    ///
    /// Crash-safe: after this returns, any subsequent process start
    /// observes either the old or the new pointer, never a torn value.
    fn update_root(&self, pointer: AtomPointer) -> Result<()>;

    /// Durability barrier after a transaction's atoms are flushed.
    fn close_wal(&self, transaction_id: TxnId) -> Result<()>;

    /// Flush everything and release the write claim. No further operations
    /// are allowed afterwards.
    fn close(&self) -> Result<()>;
}
