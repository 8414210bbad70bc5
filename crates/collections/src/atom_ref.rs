//! Shared references between atoms with lazy materialization.

use crate::atom::{Atom, AtomSource};
use atomdb_core::{AtomPointer, Error, Result};
use once_cell::sync::OnceCell;
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug)]
struct Inner {
    /// Assigned once, when the atom is first written to the WAL (or when the
    /// reference was deserialized from one).
    pointer: OnceCell<AtomPointer>,
    /// Materialized atom; filled at creation for new atoms, or on first
    /// resolution for lazy ones.
    cell: OnceCell<Arc<Atom>>,
}

/// Handle to another atom.
///
/// Clones share state: assigning a pointer or materializing the value through
/// one clone is visible through all of them. The three lifecycle states are:
///
/// - *new*: value present, no pointer yet (not persisted)
/// - *loaded*: value and pointer both present
/// - *lazy*: pointer only; [`AtomRef::resolve`] loads and caches the value
#[derive(Clone)]
pub struct AtomRef {
    inner: Arc<Inner>,
}

impl AtomRef {
    /// Reference to a freshly created, not yet persisted atom.
    pub fn new(atom: Atom) -> Self {
        Self::from_arc(Arc::new(atom))
    }

    /// Reference to a freshly created atom already behind an `Arc`.
    pub fn from_arc(atom: Arc<Atom>) -> Self {
        let cell = OnceCell::new();
        let _ = cell.set(atom);
        AtomRef {
            inner: Arc::new(Inner {
                pointer: OnceCell::new(),
                cell,
            }),
        }
    }

    /// Lazy reference to a persisted atom.
    pub fn lazy(pointer: AtomPointer) -> Self {
        let cell = OnceCell::new();
        let ptr = OnceCell::new();
        let _ = ptr.set(pointer);
        AtomRef {
            inner: Arc::new(Inner { pointer: ptr, cell }),
        }
    }

    /// The durable pointer, if the atom has been persisted.
    pub fn pointer(&self) -> Option<AtomPointer> {
        self.inner.pointer.get().copied()
    }

    /// Record the pointer assigned by the storage engine.
    ///
    /// Pointers are immutable once assigned; a second assignment with a
    /// different pointer is a corruption error.
    pub fn set_pointer(&self, pointer: AtomPointer) -> Result<()> {
        match self.inner.pointer.try_insert(pointer) {
            Ok(_) => Ok(()),
            Err((existing, _)) if *existing == pointer => Ok(()),
            Err((existing, _)) => Err(Error::corruption(format!(
                "atom pointer reassigned: {} -> {}",
                existing, pointer
            ))),
        }
    }

    /// The materialized atom, if present (new or previously resolved).
    pub fn loaded(&self) -> Option<Arc<Atom>> {
        self.inner.cell.get().cloned()
    }

    /// Materialize the referenced atom, loading it through `src` if needed.
    pub fn resolve(&self, src: &dyn AtomSource) -> Result<Arc<Atom>> {
        if let Some(atom) = self.inner.cell.get() {
            return Ok(atom.clone());
        }
        let pointer = self.pointer().ok_or_else(|| {
            Error::corruption("atom reference has neither a value nor a pointer")
        })?;
        let atom = src.get_atom(pointer)?;
        Ok(self.inner.cell.get_or_init(|| atom).clone())
    }

    /// Identity key for visited sets and deduplication.
    ///
    /// Persisted atoms are identified by pointer; transient atoms by the
    /// address of their shared state.
    pub fn identity(&self) -> RefIdentity {
        match self.pointer() {
            Some(p) => RefIdentity::Pointer(p),
            None => RefIdentity::Transient(Arc::as_ptr(&self.inner) as usize),
        }
    }
}

/// Identity of a reference target: durable pointer or transient address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefIdentity {
    /// Persisted atom, identified by its pointer.
    Pointer(AtomPointer),
    /// Not yet persisted; identified by the shared handle address.
    Transient(usize),
}

impl fmt::Debug for AtomRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.pointer(), self.inner.cell.get()) {
            (Some(p), Some(_)) => write!(f, "AtomRef(loaded {})", p),
            (Some(p), None) => write!(f, "AtomRef(lazy {})", p),
            (None, _) => write!(f, "AtomRef(new)"),
        }
    }
}

/// Serialized form is the pointer alone; serializing an unsaved reference is
/// an error because children are always persisted before their parents.
impl Serialize for AtomRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self.pointer() {
            Some(p) => p.serialize(serializer),
            None => Err(serde::ser::Error::custom(
                "cannot serialize a reference to an unsaved atom",
            )),
        }
    }
}

impl<'de> Deserialize<'de> for AtomRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        AtomPointer::deserialize(deserializer).map(AtomRef::lazy)
    }
}
