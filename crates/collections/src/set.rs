//! Unordered collection keyed by member identity hash.

use crate::atom::{Atom, AtomSource, SourceHandle};
use crate::atom_ref::AtomRef;
use crate::hash_dictionary::{HashDictionary, HashIter};
use atomdb_core::{Error, Result};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

/// A set of atoms, backed by a [`HashDictionary`] from member hash to member.
///
/// Member identity is stable across commits: literals hash by content,
/// records by their object id, and any already persisted atom by its
/// pointer. A transient collection atom has no stable identity and cannot
/// be a member.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Set {
    content: HashDictionary,
}

/// Stable identity hash for a set member.
pub fn member_hash(member: &AtomRef, src: &dyn AtomSource) -> Result<i64> {
    let atom = member.resolve(src)?;
    match &*atom {
        Atom::Literal(l) => Ok(l.stable_hash()),
        Atom::Record(r) => Ok(xxh3_64(r.object_id().as_bytes()) as i64),
        _ => match member.pointer() {
            Some(p) => Ok(xxh3_64(&p.to_bytes()) as i64),
            None => Err(Error::not_supported(
                "only literals, records and persisted atoms can be set members",
            )),
        },
    }
}

impl Set {
    /// The empty set.
    pub fn new() -> Self {
        Set {
            content: HashDictionary::new(),
        }
    }

    /// Number of members.
    pub fn count(&self) -> u64 {
        self.content.count()
    }

    /// True when no member is present.
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Add a member, returning the new set.
    pub fn add(&self, member: AtomRef, src: &dyn AtomSource) -> Result<Set> {
        let hash = member_hash(&member, src)?;
        Ok(Set {
            content: self.content.set_at(hash, member, src)?,
        })
    }

    /// Remove a member if present, returning the new set.
    pub fn remove_member(&self, member: &AtomRef, src: &dyn AtomSource) -> Result<Set> {
        let hash = member_hash(member, src)?;
        Ok(Set {
            content: self.content.remove_key(hash, src)?,
        })
    }

    /// Membership test.
    pub fn contains(&self, member: &AtomRef, src: &dyn AtomSource) -> Result<bool> {
        let hash = member_hash(member, src)?;
        self.content.has(hash, src)
    }

    /// Union with another set, returning the new set.
    pub fn union(&self, other: &Set, src: &dyn AtomSource) -> Result<Set> {
        let mut content = self.content.clone();
        for (hash, member) in other.content.entries(src)? {
            content = content.set_at(hash, member, src)?;
        }
        Ok(Set { content })
    }

    /// Iterator over members.
    pub fn iter(&self, src: SourceHandle) -> SetIter {
        SetIter {
            inner: self.content.iter(src),
        }
    }

    /// Materialize the members through a borrowed source.
    pub fn members(&self, src: &dyn AtomSource) -> Result<Vec<AtomRef>> {
        Ok(self
            .content
            .entries(src)?
            .into_iter()
            .map(|(_, member)| member)
            .collect())
    }

    /// All outgoing references.
    pub fn children(&self) -> Vec<AtomRef> {
        self.content.children()
    }
}

impl Default for Set {
    fn default() -> Self {
        Set::new()
    }
}

/// Iterator over set members.
pub struct SetIter {
    inner: HashIter,
}

impl Iterator for SetIter {
    type Item = Result<AtomRef>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.inner.next()?.map(|(_, member)| member))
    }
}
