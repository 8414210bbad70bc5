//! In-memory block provider for tests and ephemeral databases.

use crate::provider::{BlockProvider, ReadStream, WalWriteStream};
use atomdb_core::{AtomPointer, Error, Result, TxnId, WalId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

#[derive(Default)]
struct Wals {
    by_id: HashMap<WalId, Vec<u8>>,
}

/// Block provider keeping WALs as in-memory byte vectors.
///
/// Reads snapshot the bytes at cursor-open time, mirroring the isolation a
/// file reader gets from the page cache.
pub struct MemoryBlockProvider {
    wals: Arc<RwLock<Wals>>,
    writer: WalId,
    root: Mutex<Option<AtomPointer>>,
    closed: Mutex<bool>,
}

impl MemoryBlockProvider {
    /// A fresh provider with an empty writer WAL.
    pub fn new() -> Self {
        let writer = WalId::new();
        let mut wals = Wals::default();
        wals.by_id.insert(writer, Vec::new());
        MemoryBlockProvider {
            wals: Arc::new(RwLock::new(wals)),
            writer,
            root: Mutex::new(None),
            closed: Mutex::new(false),
        }
    }

    fn check_open(&self) -> Result<()> {
        if *self.closed.lock() {
            return Err(Error::validation("block provider is closed"));
        }
        Ok(())
    }
}

impl Default for MemoryBlockProvider {
    fn default() -> Self {
        MemoryBlockProvider::new()
    }
}

struct MemoryWriteStream {
    wals: Arc<RwLock<Wals>>,
    wal_id: WalId,
    position: u64,
}

impl WalWriteStream for MemoryWriteStream {
    fn seek_to(&mut self, position: u64) -> Result<()> {
        self.position = position;
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let mut wals = self.wals.write();
        let buf = wals
            .by_id
            .get_mut(&self.wal_id)
            .ok_or_else(|| Error::corruption(format!("unknown WAL {}", self.wal_id)))?;
        let end = self.position as usize + data.len();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[self.position as usize..end].copy_from_slice(data);
        self.position = end as u64;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl BlockProvider for MemoryBlockProvider {
    fn get_writer_wal(&self) -> Result<(WalId, u64)> {
        self.check_open()?;
        let wals = self.wals.read();
        let len = wals
            .by_id
            .get(&self.writer)
            .map(|b| b.len() as u64)
            .unwrap_or(0);
        Ok((self.writer, len))
    }

    fn write_streamer(&self) -> Result<Box<dyn WalWriteStream>> {
        self.check_open()?;
        let position = self.wals.read().by_id[&self.writer].len() as u64;
        Ok(Box::new(MemoryWriteStream {
            wals: self.wals.clone(),
            wal_id: self.writer,
            position,
        }))
    }

    fn get_reader(&self, wal_id: WalId, position: u64) -> Result<Box<dyn ReadStream>> {
        self.check_open()?;
        let wals = self.wals.read();
        let buf = wals
            .by_id
            .get(&wal_id)
            .ok_or_else(|| Error::corruption(format!("unknown WAL {}", wal_id)))?;
        if position > buf.len() as u64 {
            return Err(Error::corruption(format!(
                "read position {} past end of WAL {} ({} bytes)",
                position,
                wal_id,
                buf.len()
            )));
        }
        Ok(Box::new(Cursor::new(buf[position as usize..].to_vec())))
    }

    fn get_current_root(&self) -> Result<Option<AtomPointer>> {
        self.check_open()?;
        Ok(*self.root.lock())
    }

    fn update_root(&self, pointer: AtomPointer) -> Result<()> {
        self.check_open()?;
        *self.root.lock() = Some(pointer);
        Ok(())
    }

    fn close_wal(&self, _transaction_id: TxnId) -> Result<()> {
        self.check_open()
    }

    fn close(&self) -> Result<()> {
        *self.closed.lock() = true;
        Ok(())
    }
}
