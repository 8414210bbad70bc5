//! The tagged atom variant and the source trait used to resolve pointers.

use crate::atom_ref::AtomRef;
use crate::dictionary::{Dictionary, DictionaryItem};
use crate::hash_dictionary::HashDictionary;
use crate::list::List;
use crate::literal::Literal;
use crate::record::{ParentLink, Record};
use crate::repeated::RepeatedKeysDictionary;
use crate::root::RootObject;
use crate::set::Set;
use atomdb_core::{AtomPointer, Error, Result};
use std::sync::Arc;

/// Stable one-byte type tag written ahead of every atom payload.
///
/// Tags are part of the on-disk format and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum AtomTag {
    /// [`RootObject`]
    RootObject = 1,
    /// [`Literal`]
    Literal = 2,
    /// [`HashDictionary`]
    HashDictionary = 3,
    /// [`DictionaryItem`]
    DictionaryItem = 4,
    /// [`Dictionary`]
    Dictionary = 5,
    /// [`List`]
    List = 6,
    /// [`Set`]
    Set = 7,
    /// [`RepeatedKeysDictionary`]
    RepeatedKeysDictionary = 8,
    /// [`Record`]
    Record = 9,
    /// [`ParentLink`]
    ParentLink = 10,
}

impl AtomTag {
    /// Map an on-disk tag byte back to the tag, or fail with corruption.
    pub fn from_byte(byte: u8) -> Result<Self> {
        Ok(match byte {
            1 => AtomTag::RootObject,
            2 => AtomTag::Literal,
            3 => AtomTag::HashDictionary,
            4 => AtomTag::DictionaryItem,
            5 => AtomTag::Dictionary,
            6 => AtomTag::List,
            7 => AtomTag::Set,
            8 => AtomTag::RepeatedKeysDictionary,
            9 => AtomTag::Record,
            10 => AtomTag::ParentLink,
            other => {
                return Err(Error::corruption(format!(
                    "unknown atom type tag {:#04x}",
                    other
                )))
            }
        })
    }
}

/// The base unit of persistence: one of the known atom kinds.
///
/// Atoms are immutable after first write. Mutating operations on collection
/// atoms return new atoms sharing unchanged substructure with the old ones.
#[derive(Debug, Clone)]
pub enum Atom {
    /// The storage root: named collection catalog plus the literal table.
    RootObject(RootObject),
    /// An interned string.
    Literal(Literal),
    /// AVL node of an integer-keyed dictionary.
    HashDictionary(HashDictionary),
    /// Slot of a string-keyed dictionary: literal key plus value.
    DictionaryItem(DictionaryItem),
    /// String-keyed dictionary over interned literal hashes.
    Dictionary(Dictionary),
    /// AVL node of an indexed sequence.
    List(List),
    /// Unordered collection keyed by member identity hash.
    Set(Set),
    /// Ordered multi-map from field value to a set of records.
    RepeatedKeysDictionary(RepeatedKeysDictionary),
    /// User record: attribute map plus parent chain.
    Record(Record),
    /// One link of a record's parent chain.
    ParentLink(ParentLink),
}

impl Atom {
    /// The stable type tag of this atom kind.
    pub fn tag(&self) -> AtomTag {
        match self {
            Atom::RootObject(_) => AtomTag::RootObject,
            Atom::Literal(_) => AtomTag::Literal,
            Atom::HashDictionary(_) => AtomTag::HashDictionary,
            Atom::DictionaryItem(_) => AtomTag::DictionaryItem,
            Atom::Dictionary(_) => AtomTag::Dictionary,
            Atom::List(_) => AtomTag::List,
            Atom::Set(_) => AtomTag::Set,
            Atom::RepeatedKeysDictionary(_) => AtomTag::RepeatedKeysDictionary,
            Atom::Record(_) => AtomTag::Record,
            Atom::ParentLink(_) => AtomTag::ParentLink,
        }
    }

    /// All outgoing references of this atom.
    ///
    /// Commit walks these bottom-up so every child holds a pointer before
    /// its parent is serialized.
    pub fn children(&self) -> Vec<AtomRef> {
        match self {
            Atom::RootObject(r) => r.children(),
            Atom::Literal(_) => Vec::new(),
            Atom::HashDictionary(h) => h.children(),
            Atom::DictionaryItem(i) => i.children(),
            Atom::Dictionary(d) => d.children(),
            Atom::List(l) => l.children(),
            Atom::Set(s) => s.children(),
            Atom::RepeatedKeysDictionary(r) => r.children(),
            Atom::Record(r) => r.children(),
            Atom::ParentLink(p) => p.children(),
        }
    }

    /// View as a hash dictionary node, failing with corruption otherwise.
    pub fn expect_hash_dictionary(&self) -> Result<&HashDictionary> {
        match self {
            Atom::HashDictionary(h) => Ok(h),
            other => Err(kind_error("HashDictionary", other)),
        }
    }

    /// View as a dictionary, failing with corruption otherwise.
    pub fn expect_dictionary(&self) -> Result<&Dictionary> {
        match self {
            Atom::Dictionary(d) => Ok(d),
            other => Err(kind_error("Dictionary", other)),
        }
    }

    /// View as a dictionary item, failing with corruption otherwise.
    pub fn expect_dictionary_item(&self) -> Result<&DictionaryItem> {
        match self {
            Atom::DictionaryItem(i) => Ok(i),
            other => Err(kind_error("DictionaryItem", other)),
        }
    }

    /// View as a list node, failing with corruption otherwise.
    pub fn expect_list(&self) -> Result<&List> {
        match self {
            Atom::List(l) => Ok(l),
            other => Err(kind_error("List", other)),
        }
    }

    /// View as a set, failing with corruption otherwise.
    pub fn expect_set(&self) -> Result<&Set> {
        match self {
            Atom::Set(s) => Ok(s),
            other => Err(kind_error("Set", other)),
        }
    }

    /// View as a repeated-keys dictionary, failing with corruption otherwise.
    pub fn expect_repeated(&self) -> Result<&RepeatedKeysDictionary> {
        match self {
            Atom::RepeatedKeysDictionary(r) => Ok(r),
            other => Err(kind_error("RepeatedKeysDictionary", other)),
        }
    }

    /// View as a literal, failing with corruption otherwise.
    pub fn expect_literal(&self) -> Result<&Literal> {
        match self {
            Atom::Literal(l) => Ok(l),
            other => Err(kind_error("Literal", other)),
        }
    }

    /// View as a record, failing with corruption otherwise.
    pub fn expect_record(&self) -> Result<&Record> {
        match self {
            Atom::Record(r) => Ok(r),
            other => Err(kind_error("Record", other)),
        }
    }

    /// View as a parent link, failing with corruption otherwise.
    pub fn expect_parent_link(&self) -> Result<&ParentLink> {
        match self {
            Atom::ParentLink(p) => Ok(p),
            other => Err(kind_error("ParentLink", other)),
        }
    }

    /// View as a root object, failing with corruption otherwise.
    pub fn expect_root_object(&self) -> Result<&RootObject> {
        match self {
            Atom::RootObject(r) => Ok(r),
            other => Err(kind_error("RootObject", other)),
        }
    }
}

fn kind_error(expected: &str, got: &Atom) -> Error {
    Error::corruption(format!(
        "expected a {} atom, found {:?}",
        expected,
        got.tag()
    ))
}

/// Resolves atom pointers to materialized atoms.
///
/// The storage engine and the transaction layer implement this; collection
/// operations use it to materialize lazy references on demand.
pub trait AtomSource: Send + Sync {
    /// Load the atom behind `pointer`.
    ///
    /// Unknown pointers fail with a corruption error.
    fn get_atom(&self, pointer: AtomPointer) -> Result<Arc<Atom>>;
}

/// Owned, shareable handle to an atom source.
pub type SourceHandle = Arc<dyn AtomSource>;

/// Source for trees that live purely in memory.
///
/// Fresh collections contain no lazy references, so resolution is never
/// reached; hitting it means a pointer escaped its storage context.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSource;

impl AtomSource for NullSource {
    fn get_atom(&self, pointer: AtomPointer) -> Result<Arc<Atom>> {
        Err(Error::corruption(format!(
            "no storage attached while resolving {}",
            pointer
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_roundtrip() {
        for byte in 1u8..=10 {
            let tag = AtomTag::from_byte(byte).unwrap();
            assert_eq!(tag as u8, byte);
        }
    }

    #[test]
    fn test_unknown_tag_is_corruption() {
        assert!(AtomTag::from_byte(0).unwrap_err().is_corruption());
        assert!(AtomTag::from_byte(200).unwrap_err().is_corruption());
    }

    #[test]
    fn test_expect_mismatch_is_corruption() {
        let atom = Atom::Literal(Literal::new("x"));
        assert!(atom.expect_set().unwrap_err().is_corruption());
        assert!(atom.expect_literal().is_ok());
    }

    #[test]
    fn test_null_source_rejects_lookups() {
        use atomdb_core::WalId;
        let err = NullSource
            .get_atom(AtomPointer::new(WalId::new(), 0))
            .unwrap_err();
        assert!(err.is_corruption());
    }
}
