//! String-keyed dictionary over interned literal hashes.

use crate::atom::{Atom, AtomSource, SourceHandle};
use crate::atom_ref::AtomRef;
use crate::hash_dictionary::{HashDictionary, HashIter};
use crate::literal::{hash_str, LiteralInterner};
use atomdb_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Slot of a [`Dictionary`]: the interned key literal plus the value.
///
/// Keeping the literal in the slot makes iteration able to recover the
/// original string from the hash-keyed tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DictionaryItem {
    key: AtomRef,
    value: AtomRef,
}

impl DictionaryItem {
    /// Build a slot from an interned literal reference and a value.
    pub fn new(key: AtomRef, value: AtomRef) -> Self {
        DictionaryItem { key, value }
    }

    /// Reference to the key literal.
    pub fn key_ref(&self) -> &AtomRef {
        &self.key
    }

    /// Reference to the value.
    pub fn value_ref(&self) -> &AtomRef {
        &self.value
    }

    /// Resolve the key literal to its string.
    pub fn key_text(&self, src: &dyn AtomSource) -> Result<String> {
        let atom = self.key.resolve(src)?;
        Ok(atom.expect_literal()?.text().to_string())
    }

    /// All outgoing references of this slot.
    pub fn children(&self) -> Vec<AtomRef> {
        vec![self.key.clone(), self.value.clone()]
    }
}

/// A mapping between strings and atoms.
///
/// Keys are interned literals; the underlying tree is a [`HashDictionary`]
/// keyed by the literal's stable hash. Two distinct strings hashing to the
/// same slot would be a corruption of the interning guarantee and is
/// rejected on insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dictionary {
    content: HashDictionary,
}

impl Dictionary {
    /// The empty dictionary.
    pub fn new() -> Self {
        Dictionary {
            content: HashDictionary::new(),
        }
    }

    /// Number of entries.
    pub fn count(&self) -> u64 {
        self.content.count()
    }

    /// True when no entry is present.
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Look up the value stored under `key`.
    pub fn get_at(&self, key: &str, src: &dyn AtomSource) -> Result<Option<AtomRef>> {
        match self.content.get_at(hash_str(key), src)? {
            None => Ok(None),
            Some(item_ref) => {
                let atom = item_ref.resolve(src)?;
                let item = atom.expect_dictionary_item()?;
                Ok(Some(item.value_ref().clone()))
            }
        }
    }

    /// Test for a key without materializing its value.
    pub fn has(&self, key: &str, src: &dyn AtomSource) -> Result<bool> {
        self.content.has(hash_str(key), src)
    }

    /// Insert or replace, returning the new dictionary.
    ///
    /// The key literal is interned through `interner` so the string is
    /// persisted once and its hash survives restarts.
    pub fn set_at(
        &self,
        key: &str,
        value: AtomRef,
        src: &dyn AtomSource,
        interner: &dyn LiteralInterner,
    ) -> Result<Dictionary> {
        let hash = hash_str(key);
        if let Some(existing) = self.content.get_at(hash, src)? {
            let atom = existing.resolve(src)?;
            let item = atom.expect_dictionary_item()?;
            let existing_key = item.key_text(src)?;
            if existing_key != key {
                return Err(Error::corruption(format!(
                    "literal hash collision: {:?} and {:?} share slot {}",
                    existing_key, key, hash
                )));
            }
        }
        let literal = interner.get_literal(key)?;
        let item = AtomRef::new(Atom::DictionaryItem(DictionaryItem::new(literal, value)));
        Ok(Dictionary {
            content: self.content.set_at(hash, item, src)?,
        })
    }

    /// Remove a key if present, returning the new dictionary.
    pub fn remove_key(&self, key: &str, src: &dyn AtomSource) -> Result<Dictionary> {
        Ok(Dictionary {
            content: self.content.remove_key(hash_str(key), src)?,
        })
    }

    /// Materialize all `(key, value)` pairs through a borrowed source.
    pub fn entries(&self, src: &dyn AtomSource) -> Result<Vec<(String, AtomRef)>> {
        let mut out = Vec::with_capacity(self.count() as usize);
        for (_, item_ref) in self.content.entries(src)? {
            let atom = item_ref.resolve(src)?;
            let item = atom.expect_dictionary_item()?;
            out.push((item.key_text(src)?, item.value_ref().clone()));
        }
        Ok(out)
    }

    /// Iterator over `(key, value)` pairs in hash order.
    pub fn iter(&self, src: SourceHandle) -> DictionaryIter {
        DictionaryIter {
            inner: self.content.iter(src.clone()),
            src,
        }
    }

    /// All outgoing references.
    pub fn children(&self) -> Vec<AtomRef> {
        self.content.children()
    }
}

impl Default for Dictionary {
    fn default() -> Self {
        Dictionary::new()
    }
}

/// Iterator over dictionary entries, resolving slot literals back to strings.
pub struct DictionaryIter {
    inner: HashIter,
    src: SourceHandle,
}

impl Iterator for DictionaryIter {
    type Item = Result<(String, AtomRef)>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = match self.inner.next()? {
            Ok((_, item_ref)) => item_ref,
            Err(e) => return Some(Err(e)),
        };
        let resolved = entry
            .resolve(&*self.src)
            .and_then(|atom| {
                let item = atom.expect_dictionary_item()?;
                Ok((item.key_text(&*self.src)?, item.value_ref().clone()))
            });
        Some(resolved)
    }
}
