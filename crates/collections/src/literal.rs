//! Interned strings with stable content-derived hashes.

use crate::atom::Atom;
use crate::atom_ref::AtomRef;
use atomdb_core::Result;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

/// An interned string.
///
/// The hash is derived from the content alone, so the same string maps to
/// the same numeric key in every transaction and across restarts. String
/// keyed dictionaries rely on this: they store values under the literal's
/// hash and keep the literal itself alongside for reverse lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Literal {
    text: String,
}

impl Literal {
    /// Intern `text` as a literal value.
    pub fn new(text: impl Into<String>) -> Self {
        Literal { text: text.into() }
    }

    /// The interned string.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Stable 64-bit hash of the content.
    pub fn stable_hash(&self) -> i64 {
        hash_str(&self.text)
    }
}

/// Stable hash of a string, identical to [`Literal::stable_hash`] for the
/// same content.
pub fn hash_str(text: &str) -> i64 {
    xxh3_64(text.as_bytes()) as i64
}

/// Supplies interned literal atoms to string-keyed collections.
///
/// Transactions implement this by consulting (and growing) the storage's
/// literal table, so every distinct string is persisted exactly once.
pub trait LiteralInterner {
    /// Return a reference to the interned literal for `text`, creating it
    /// if this is the first use.
    fn get_literal(&self, text: &str) -> Result<AtomRef>;
}

/// Interner that creates a fresh literal atom per call.
///
/// Hashes are content-derived, so semantics are unchanged; only the storage
/// dedup is lost. Used by tests and by collections detached from a
/// transaction.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineInterner;

impl LiteralInterner for InlineInterner {
    fn get_literal(&self, text: &str) -> Result<AtomRef> {
        Ok(AtomRef::new(Atom::Literal(Literal::new(text))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_stable_per_content() {
        let a = Literal::new("alpha");
        let b = Literal::new("alpha");
        assert_eq!(a.stable_hash(), b.stable_hash());
        assert_eq!(a.stable_hash(), hash_str("alpha"));
    }

    #[test]
    fn test_distinct_strings_distinct_hashes() {
        assert_ne!(hash_str("alpha"), hash_str("beta"));
        assert_ne!(hash_str(""), hash_str(" "));
    }

    #[test]
    fn test_inline_interner_builds_literals() {
        let r = InlineInterner.get_literal("k").unwrap();
        let atom = r.loaded().unwrap();
        assert_eq!(atom.expect_literal().unwrap().text(), "k");
    }
}
