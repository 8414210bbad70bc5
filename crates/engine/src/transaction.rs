//! Transactions: snapshot reads, private staging and optimistic commit.
//!
//! A transaction captures the current root pointer when it begins. Reads of
//! named roots resolve through that snapshot only and are recorded in a
//! read set; writes stage new atom graphs privately. Commit serializes all
//! reachable new atoms into the WAL and issues a durability barrier; then,
//! under the storage commit lock, it validates the read and write sets
//! against the currently published root and publishes a new root object
//! atomically.
//!
//! Validation is root-key granular (the read-set tracking discipline left
//! open by the storage design): a commit aborts when any root key it read
//! or wrote was changed by an interim commit. Interim commits touching only
//! other root keys are rebased over, last-writer-wins, which keeps disjoint
//! writers independent.

use atomdb_collections::literal::hash_str;
use atomdb_collections::{
    Atom, AtomRef, AtomSource, Dictionary, HashDictionary, List, Literal, LiteralInterner, Record,
    RepeatedKeysDictionary, RootObject, Set,
};
use atomdb_core::{AtomPointer, Error, Result, TxnId};
use atomdb_storage::SharedStorage;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Accepting reads and writes.
    Active,
    /// Commit succeeded; the transaction is finished.
    Committed,
    /// Rolled back explicitly or by a validation failure.
    Aborted,
    /// Poisoned by a corruption or unexpected error.
    Invalidated,
}

struct TxState {
    status: TransactionStatus,
    /// Root keys read, with the value pointer observed at snapshot time.
    reads: BTreeMap<String, Option<AtomPointer>>,
    /// Root keys staged for publication.
    writes: BTreeMap<String, AtomRef>,
    /// Literals interned by this transaction, by stable hash.
    literals: BTreeMap<i64, AtomRef>,
}

/// A transaction over one database of an object space.
pub struct ObjectTransaction {
    storage: Arc<SharedStorage>,
    database: String,
    txn_id: TxnId,
    snapshot: Option<(AtomPointer, RootObject)>,
    state: Mutex<TxState>,
}

impl ObjectTransaction {
    pub(crate) fn begin(storage: Arc<SharedStorage>, database: String) -> Result<Self> {
        let snapshot = storage.read_current_root()?;
        Ok(ObjectTransaction {
            storage,
            database,
            txn_id: TxnId::new(),
            snapshot,
            state: Mutex::new(TxState {
                status: TransactionStatus::Active,
                reads: BTreeMap::new(),
                writes: BTreeMap::new(),
                literals: BTreeMap::new(),
            }),
        })
    }

    /// This transaction's id.
    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    /// The database this transaction operates on.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Current lifecycle state.
    pub fn status(&self) -> TransactionStatus {
        self.state.lock().status
    }

    fn ensure_active(status: TransactionStatus) -> Result<()> {
        match status {
            TransactionStatus::Active => Ok(()),
            other => Err(Error::validation(format!(
                "transaction is not active ({:?})",
                other
            ))),
        }
    }

    /// The database catalog visible in a given root.
    fn catalog_in(&self, root: Option<&RootObject>) -> Result<Option<Dictionary>> {
        let root = match root {
            None => return Ok(None),
            Some(r) => r,
        };
        let src: &dyn AtomSource = self.storage.as_ref();
        let atom = root.object_root().resolve(src)?;
        let catalog = atom.expect_dictionary()?;
        match catalog.get_at(&self.database, src)? {
            None => Ok(None),
            Some(db_ref) => {
                let db_atom = db_ref.resolve(src)?;
                Ok(Some(db_atom.expect_dictionary()?.clone()))
            }
        }
    }

    /// The pointer of a named root in a given root object, if present.
    fn root_key_pointer(&self, root: Option<&RootObject>, name: &str) -> Result<Option<AtomPointer>> {
        let src: &dyn AtomSource = self.storage.as_ref();
        match self.catalog_in(root)? {
            None => Ok(None),
            Some(catalog) => Ok(catalog.get_at(name, src)?.and_then(|r| r.pointer())),
        }
    }

    /// Get a named root from the snapshot (or this transaction's staging).
    ///
    /// The read is recorded for commit-time validation, including misses.
    pub fn get_root_object(&self, name: &str) -> Result<Option<AtomRef>> {
        let mut state = self.state.lock();
        Self::ensure_active(state.status)?;
        if let Some(staged) = state.writes.get(name) {
            return Ok(Some(staged.clone()));
        }
        let snapshot_root = self.snapshot.as_ref().map(|(_, r)| r);
        let found = match self.catalog_in(snapshot_root)? {
            None => None,
            Some(catalog) => catalog.get_at(name, self.storage.as_ref())?,
        };
        state
            .reads
            .insert(name.to_string(), found.as_ref().and_then(|r| r.pointer()));
        Ok(found)
    }

    /// Stage a named root for publication at commit.
    pub fn set_root_object(&self, name: &str, value: AtomRef) -> Result<()> {
        if name.is_empty() {
            return Err(Error::validation("root object name must not be empty"));
        }
        let mut state = self.state.lock();
        Self::ensure_active(state.status)?;
        state.writes.insert(name.to_string(), value);
        Ok(())
    }

    // === Factories ===

    /// A fresh integer-keyed dictionary.
    pub fn new_hash_dictionary(&self) -> HashDictionary {
        HashDictionary::new()
    }

    /// A fresh string-keyed dictionary.
    pub fn new_dictionary(&self) -> Dictionary {
        Dictionary::new()
    }

    /// A fresh list.
    pub fn new_list(&self) -> List {
        List::new()
    }

    /// A fresh set.
    pub fn new_set(&self) -> Set {
        Set::new()
    }

    /// A fresh secondary-index multi-map.
    pub fn new_repeated_keys_dictionary(&self) -> RepeatedKeysDictionary {
        RepeatedKeysDictionary::new()
    }

    /// A fresh user record.
    pub fn new_record(&self) -> Record {
        Record::new()
    }

    /// Discard all staged changes; storage is untouched.
    pub fn abort(&self) -> Result<()> {
        let mut state = self.state.lock();
        Self::ensure_active(state.status)?;
        state.status = TransactionStatus::Aborted;
        Ok(())
    }

    /// Make all staged changes durable and visible.
    ///
    /// Read-only transactions commit trivially. On a validation conflict
    /// the transaction aborts; on corruption or unexpected errors it is
    /// invalidated.
    pub fn commit(&self) -> Result<()> {
        let mut state = self.state.lock();
        Self::ensure_active(state.status)?;
        if state.writes.is_empty() {
            state.status = TransactionStatus::Committed;
            return Ok(());
        }
        match self.commit_inner(&mut state) {
            Ok(()) => {
                state.status = TransactionStatus::Committed;
                Ok(())
            }
            Err(e) => {
                state.status = if e.invalidates_transaction() {
                    TransactionStatus::Invalidated
                } else {
                    TransactionStatus::Aborted
                };
                tracing::debug!(txn = %self.txn_id, error = %e, "commit failed");
                Err(e)
            }
        }
    }

    fn commit_inner(&self, state: &mut TxState) -> Result<()> {
        let src: &dyn AtomSource = self.storage.as_ref();

        // Persist every new atom reachable from the staged roots. Children
        // receive pointers before their parents are serialized.
        for staged in state.writes.values() {
            self.save_atom_tree(staged)?;
        }
        // Durability barrier: staged atoms are on disk before validation.
        self.storage.close_wal(self.txn_id)?;

        // Writers serialize at the root-update step.
        let _guard = self.storage.commit_guard();

        let current = self.storage.read_current_root()?;
        let snapshot_ptr = self.snapshot.as_ref().map(|(p, _)| *p);
        let current_ptr = current.as_ref().map(|(p, _)| *p);
        let base_root = if snapshot_ptr == current_ptr {
            self.snapshot.as_ref().map(|(_, r)| r.clone())
        } else {
            // Interim commits happened. Valid only if none of them touched
            // a root key this transaction read or wrote.
            let snapshot_root = self.snapshot.as_ref().map(|(_, r)| r);
            let current_root = current.as_ref().map(|(_, r)| r);
            let mut keys: Vec<&String> = state.reads.keys().collect();
            keys.extend(state.writes.keys());
            for key in keys {
                let before = self.root_key_pointer(snapshot_root, key)?;
                let after = self.root_key_pointer(current_root, key)?;
                if before != after {
                    return Err(Error::validation(format!(
                        "concurrent modification of root key {:?} in database {:?}",
                        key, self.database
                    )));
                }
            }
            current.as_ref().map(|(_, r)| r.clone())
        };

        // Rebuild the catalog chain on top of the base root.
        let (base_catalog, base_object_root, base_literal_root) = match &base_root {
            None => (Dictionary::new(), Dictionary::new(), HashDictionary::new()),
            Some(root) => {
                let object_root_atom = root.object_root().resolve(src)?;
                let object_root = object_root_atom.expect_dictionary()?.clone();
                let literal_atom = root.literal_root().resolve(src)?;
                let literal_root = literal_atom.expect_hash_dictionary()?.clone();
                let catalog = self.catalog_in(Some(root))?.unwrap_or_default();
                (catalog, object_root, literal_root)
            }
        };

        let interner = CommitInterner {
            table: &base_literal_root,
            src,
            discovered: RefCell::new(state.literals.clone()),
        };

        let mut catalog = base_catalog;
        for (name, staged) in &state.writes {
            catalog = catalog.set_at(name, staged.clone(), src, &interner)?;
        }
        let object_root = base_object_root.set_at(
            &self.database,
            AtomRef::new(Atom::Dictionary(catalog)),
            src,
            &interner,
        )?;

        let mut literal_root = base_literal_root.clone();
        for (hash, literal) in interner.discovered.into_inner() {
            literal_root = literal_root.set_at(hash, literal, src)?;
        }

        let root = RootObject::new(
            AtomRef::new(Atom::Dictionary(object_root)),
            AtomRef::new(Atom::HashDictionary(literal_root)),
        );
        let root_ref = AtomRef::new(Atom::RootObject(root));
        self.save_atom_tree(&root_ref)?;
        // Second barrier: the root record itself must be durable before the
        // pointer swap publishes it.
        self.storage.close_wal(self.txn_id)?;

        let root_ptr = root_ref
            .pointer()
            .ok_or_else(|| Error::corruption("root object was not assigned a pointer"))?;
        self.storage.set_current_root(root_ptr)?;
        tracing::debug!(txn = %self.txn_id, root = %root_ptr, "published new root");
        Ok(())
    }

    /// Persist a new atom graph bottom-up, assigning pointers.
    ///
    /// Atoms that already hold pointers (shared subtrees from earlier
    /// commits) are left untouched, which is what makes path copying pay
    /// off across transactions.
    fn save_atom_tree(&self, root: &AtomRef) -> Result<()> {
        use atomdb_collections::atom_ref::RefIdentity;
        let mut visited: FxHashSet<RefIdentity> = FxHashSet::default();
        let mut stack: Vec<(AtomRef, bool)> = vec![(root.clone(), false)];
        while let Some((r, expanded)) = stack.pop() {
            if r.pointer().is_some() {
                continue;
            }
            if expanded {
                let atom = r.loaded().ok_or_else(|| {
                    Error::corruption("new atom reference lost its value before save")
                })?;
                let pointer = self.storage.push_atom(atom).get()?;
                r.set_pointer(pointer)?;
            } else {
                if !visited.insert(r.identity()) {
                    continue;
                }
                let atom = r.loaded().ok_or_else(|| {
                    Error::corruption("new atom reference lost its value before save")
                })?;
                stack.push((r.clone(), true));
                for child in atom.children() {
                    if child.pointer().is_none() {
                        stack.push((child, false));
                    }
                }
            }
        }
        Ok(())
    }
}

impl AtomSource for ObjectTransaction {
    fn get_atom(&self, pointer: AtomPointer) -> Result<Arc<Atom>> {
        AtomSource::get_atom(self.storage.as_ref(), pointer)
    }
}

impl LiteralInterner for ObjectTransaction {
    /// Intern `text`: reuse this transaction's literal, then the snapshot
    /// table, then mint a new literal atom.
    fn get_literal(&self, text: &str) -> Result<AtomRef> {
        let hash = hash_str(text);
        let mut state = self.state.lock();
        Self::ensure_active(state.status)?;
        if let Some(r) = state.literals.get(&hash) {
            return Ok(r.clone());
        }
        if let Some((_, root)) = &self.snapshot {
            let src: &dyn AtomSource = self.storage.as_ref();
            let table_atom = root.literal_root().resolve(src)?;
            let table = table_atom.expect_hash_dictionary()?;
            if let Some(existing) = table.get_at(hash, src)? {
                return Ok(existing);
            }
        }
        let fresh = AtomRef::new(Atom::Literal(Literal::new(text)));
        state.literals.insert(hash, fresh.clone());
        Ok(fresh)
    }
}

/// Interner used while rebuilding the catalog chain during commit.
///
/// The transaction state lock is already held there, so this collects newly
/// minted literals locally instead of going back through the transaction.
struct CommitInterner<'a> {
    table: &'a HashDictionary,
    src: &'a dyn AtomSource,
    discovered: RefCell<BTreeMap<i64, AtomRef>>,
}

impl LiteralInterner for CommitInterner<'_> {
    fn get_literal(&self, text: &str) -> Result<AtomRef> {
        let hash = hash_str(text);
        if let Some(r) = self.discovered.borrow().get(&hash) {
            return Ok(r.clone());
        }
        if let Some(existing) = self.table.get_at(hash, self.src)? {
            return Ok(existing);
        }
        let fresh = AtomRef::new(Atom::Literal(Literal::new(text)));
        self.discovered.borrow_mut().insert(hash, fresh.clone());
        Ok(fresh)
    }
}
