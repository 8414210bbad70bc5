//! The shared atom store: serialization, WAL placement and resolution.

use crate::codec::{encode_record, read_record};
use crate::provider::BlockProvider;
use crate::wal::{WalBuffer, WalConfig};
use atomdb_collections::{Atom, AtomSource, RootObject};
use atomdb_core::{AtomPointer, Error, Future, Result, TxnId, WalId};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

const WAL_ACQUIRE_ATTEMPTS: usize = 3;

/// The current use instance of a permanent storage.
///
/// A `SharedStorage` owns the writer WAL of its block provider, buffers
/// atom records through the WAL append path, memoizes pointer resolution,
/// and mediates root pointer reads and updates. It is safe to share across
/// threads; read paths take no locks beyond the cache shards.
pub struct SharedStorage {
    provider: Arc<dyn BlockProvider>,
    wal_id: WalId,
    buffer: WalBuffer,
    cache: DashMap<AtomPointer, Arc<Atom>>,
    commit_lock: Mutex<()>,
}

impl std::fmt::Debug for SharedStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStorage")
            .field("wal_id", &self.wal_id)
            .finish_non_exhaustive()
    }
}

impl SharedStorage {
    /// Open a storage over a block provider with environment-tuned config.
    pub fn open(provider: Arc<dyn BlockProvider>) -> Result<Arc<Self>> {
        Self::open_with_config(provider, WalConfig::from_env())
    }

    /// Open a storage with an explicit WAL configuration.
    pub fn open_with_config(
        provider: Arc<dyn BlockProvider>,
        config: WalConfig,
    ) -> Result<Arc<Self>> {
        let mut last_err = None;
        for attempt in 0..WAL_ACQUIRE_ATTEMPTS {
            match provider.get_writer_wal() {
                Ok((wal_id, base)) => {
                    let buffer = WalBuffer::new(provider.clone(), base, config);
                    return Ok(Arc::new(SharedStorage {
                        provider,
                        wal_id,
                        buffer,
                        cache: DashMap::new(),
                        commit_lock: Mutex::new(()),
                    }));
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "writer WAL acquisition failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.expect("at least one attempt"))
    }

    /// Id of the writer WAL; pointers minted by this storage carry it.
    pub fn wal_id(&self) -> WalId {
        self.wal_id
    }

    /// Serialize an atom into the WAL and return its pointer.
    ///
    /// The atom's children must already hold pointers. The atom becomes
    /// resolvable immediately (through the cache) even before the buffer
    /// reaches disk.
    pub fn push_atom(&self, atom: Arc<Atom>) -> Future<AtomPointer> {
        Future::from_result(self.push_atom_sync(atom))
    }

    /// Resolve a pointer to its atom.
    ///
    /// Shadows the synchronous [`AtomSource::get_atom`] with the future
    /// returning form; the trait method remains callable through the trait.
    pub fn get_atom(&self, pointer: AtomPointer) -> Future<Arc<Atom>> {
        Future::from_result(self.get_atom_sync(pointer))
    }

    pub(crate) fn push_atom_sync(&self, atom: Arc<Atom>) -> Result<AtomPointer> {
        let record = encode_record(&atom)?;
        let offset = self.buffer.push_bytes(&record)?;
        let pointer = AtomPointer::new(self.wal_id, offset);
        self.cache.insert(pointer, atom);
        Ok(pointer)
    }

    pub(crate) fn get_atom_sync(&self, pointer: AtomPointer) -> Result<Arc<Atom>> {
        if let Some(hit) = self.cache.get(&pointer) {
            return Ok(hit.clone());
        }
        let mut reader = self.provider.get_reader(pointer.transaction_id, pointer.offset)?;
        let atom = Arc::new(read_record(&mut *reader)?);
        self.cache.insert(pointer, atom.clone());
        Ok(atom)
    }

    /// Read the current root object, if one was ever published.
    pub fn read_current_root(&self) -> Result<Option<(AtomPointer, RootObject)>> {
        let pointer = match self.provider.get_current_root()? {
            None => return Ok(None),
            Some(p) => p,
        };
        let atom = self.get_atom_sync(pointer)?;
        Ok(Some((pointer, atom.expect_root_object()?.clone())))
    }

    /// Publish a new root pointer.
    ///
    /// Callers must hold the commit guard and have flushed the WAL first.
    pub fn set_current_root(&self, pointer: AtomPointer) -> Result<()> {
        self.provider.update_root(pointer)
    }

    /// Force all buffered fragments to the provider.
    pub fn flush_wal(&self) -> Result<()> {
        self.buffer.flush()
    }

    /// Durability barrier on behalf of a committing transaction.
    pub fn close_wal(&self, transaction_id: TxnId) -> Result<()> {
        self.buffer.flush()?;
        self.provider.close_wal(transaction_id)
    }

    /// Serialize writers at the root-update step.
    ///
    /// The root pointer is the only shared mutable cell; everything else is
    /// immutable after commit.
    pub fn commit_guard(&self) -> MutexGuard<'_, ()> {
        self.commit_lock.lock()
    }

    /// Flush and close the underlying provider.
    pub fn close(&self) -> Result<()> {
        self.buffer.flush()?;
        self.provider.close()
    }
}

impl AtomSource for SharedStorage {
    fn get_atom(&self, pointer: AtomPointer) -> Result<Arc<Atom>> {
        self.get_atom_sync(pointer).map_err(|e| {
            if e.is_corruption() {
                Error::corruption(format!("resolving {}: {}", pointer, e))
            } else {
                e
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBlockProvider;
    use atomdb_collections::Literal;

    fn fresh() -> (Arc<MemoryBlockProvider>, Arc<SharedStorage>) {
        let provider = Arc::new(MemoryBlockProvider::new());
        let storage = SharedStorage::open(provider.clone()).unwrap();
        (provider, storage)
    }

    #[test]
    fn test_push_then_get_uses_cache() {
        let (_, storage) = fresh();
        let atom = Arc::new(Atom::Literal(Literal::new("cached")));
        let ptr = storage.push_atom(atom).get().unwrap();
        // Not flushed yet, still resolvable.
        let loaded = storage.get_atom(ptr).get().unwrap();
        assert_eq!(loaded.expect_literal().unwrap().text(), "cached");
    }

    #[test]
    fn test_flushed_atom_survives_cache_loss() {
        let (provider, storage) = fresh();
        let ptr = storage
            .push_atom(Arc::new(Atom::Literal(Literal::new("durable"))))
            .get()
            .unwrap();
        storage.flush_wal().unwrap();

        // A second storage over the same provider has a cold cache and must
        // read the record back from the WAL bytes.
        let reopened = SharedStorage::open(provider).unwrap();
        let loaded = reopened.get_atom(ptr).get().unwrap();
        assert_eq!(loaded.expect_literal().unwrap().text(), "durable");
    }

    #[test]
    fn test_unknown_pointer_is_corruption() {
        let (_, storage) = fresh();
        let bogus = AtomPointer::new(WalId::new(), 12345);
        let err = storage.get_atom(bogus).get().unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_root_round_trip() {
        let (_, storage) = fresh();
        assert!(storage.read_current_root().unwrap().is_none());

        let table = storage
            .push_atom(Arc::new(Atom::Dictionary(atomdb_collections::Dictionary::new())))
            .get()
            .unwrap();
        let literals = storage
            .push_atom(Arc::new(Atom::HashDictionary(
                atomdb_collections::HashDictionary::new(),
            )))
            .get()
            .unwrap();
        let root = RootObject::new(
            atomdb_collections::AtomRef::lazy(table),
            atomdb_collections::AtomRef::lazy(literals),
        );
        let root_ptr = storage
            .push_atom(Arc::new(Atom::RootObject(root)))
            .get()
            .unwrap();
        storage.flush_wal().unwrap();
        storage.set_current_root(root_ptr).unwrap();

        let (ptr, root) = storage.read_current_root().unwrap().unwrap();
        assert_eq!(ptr, root_ptr);
        assert_eq!(root.object_root().pointer(), Some(table));
    }
}
