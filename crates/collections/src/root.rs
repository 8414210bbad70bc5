//! The storage root atom.

use crate::atom_ref::AtomRef;
use serde::{Deserialize, Serialize};

/// The root of everything reachable in a storage.
///
/// `object_root` is the user-visible namespace of named collection roots (a
/// [`crate::Dictionary`]); `literal_root` is the interning table mapping
/// stable literal hashes to [`crate::Literal`] atoms. Exactly one root
/// object is current per storage at any moment, and publishing a new one is
/// the commit point of a write transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootObject {
    object_root: AtomRef,
    literal_root: AtomRef,
}

impl RootObject {
    /// Build a root from its two tables.
    pub fn new(object_root: AtomRef, literal_root: AtomRef) -> Self {
        RootObject {
            object_root,
            literal_root,
        }
    }

    /// The named collection catalog.
    pub fn object_root(&self) -> &AtomRef {
        &self.object_root
    }

    /// The literal interning table.
    pub fn literal_root(&self) -> &AtomRef {
        &self.literal_root
    }

    /// All outgoing references.
    pub fn children(&self) -> Vec<AtomRef> {
        vec![self.object_root.clone(), self.literal_root.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::Atom;
    use crate::dictionary::Dictionary;
    use crate::hash_dictionary::HashDictionary;

    #[test]
    fn test_children_cover_both_tables() {
        let root = RootObject::new(
            AtomRef::new(Atom::Dictionary(Dictionary::new())),
            AtomRef::new(Atom::HashDictionary(HashDictionary::new())),
        );
        assert_eq!(root.children().len(), 2);
        root.object_root()
            .loaded()
            .unwrap()
            .expect_dictionary()
            .unwrap();
        root.literal_root()
            .loaded()
            .unwrap()
            .expect_hash_dictionary()
            .unwrap();
    }
}
