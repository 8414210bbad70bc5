//! Integer-keyed persistent dictionary: an AVL tree with path copying.
//!
//! Every node is itself an atom; the tree is the node. Mutations reallocate
//! only the nodes on the path from the root to the mutation point and share
//! every other subtree with the previous version, so old roots remain valid
//! snapshots forever.
//!
//! Invariants satisfied by every node after a mutation:
//!
//! - `height = 1 + max(left.height, right.height)` (0 for the empty tree)
//! - `count = 1 + left.count + right.count`
//! - `|right.height - left.height| <= 1`
//! - `left keys < key < right keys`

use crate::atom::{Atom, AtomSource, SourceHandle};
use crate::atom_ref::AtomRef;
use atomdb_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// AVL node of an integer-keyed dictionary.
///
/// The empty dictionary is a node with no key, height 0 and count 0; child
/// subtrees are never empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashDictionary {
    key: Option<i64>,
    value: Option<AtomRef>,
    left: Option<AtomRef>,
    right: Option<AtomRef>,
    height: u32,
    count: u64,
}

/// Resolve a child reference into a node value.
///
/// Node clones are cheap: a handful of shared references and two integers.
fn child_node(r: &Option<AtomRef>, src: &dyn AtomSource) -> Result<Option<HashDictionary>> {
    match r {
        None => Ok(None),
        Some(r) => {
            let atom = r.resolve(src)?;
            Ok(Some(atom.expect_hash_dictionary()?.clone()))
        }
    }
}

fn ref_stats(r: &Option<AtomRef>, src: &dyn AtomSource) -> Result<(u32, u64)> {
    match child_node(r, src)? {
        None => Ok((0, 0)),
        Some(n) => Ok((n.height, n.count)),
    }
}

fn wrap(node: HashDictionary) -> AtomRef {
    AtomRef::new(Atom::HashDictionary(node))
}

impl HashDictionary {
    /// The empty dictionary.
    pub fn new() -> Self {
        HashDictionary {
            key: None,
            value: None,
            left: None,
            right: None,
            height: 0,
            count: 0,
        }
    }

    fn leaf(key: i64, value: AtomRef) -> Self {
        HashDictionary {
            key: Some(key),
            value: Some(value),
            left: None,
            right: None,
            height: 1,
            count: 1,
        }
    }

    fn build(
        key: i64,
        value: AtomRef,
        left: Option<AtomRef>,
        right: Option<AtomRef>,
        src: &dyn AtomSource,
    ) -> Result<Self> {
        let (lh, lc) = ref_stats(&left, src)?;
        let (rh, rc) = ref_stats(&right, src)?;
        Ok(HashDictionary {
            key: Some(key),
            value: Some(value),
            left,
            right,
            height: 1 + lh.max(rh),
            count: 1 + lc + rc,
        })
    }

    /// Wrap a subtree as a child reference, dropping empty trees.
    fn child_from(node: HashDictionary) -> Option<AtomRef> {
        if node.is_empty() {
            None
        } else {
            Some(wrap(node))
        }
    }

    /// Number of entries.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Height of the tree (0 when empty).
    pub fn height(&self) -> u32 {
        self.height
    }

    /// True when no entry is present.
    pub fn is_empty(&self) -> bool {
        self.key.is_none()
    }

    /// Look up the value stored under `key`.
    pub fn get_at(&self, key: i64, src: &dyn AtomSource) -> Result<Option<AtomRef>> {
        let mut current = self.clone();
        loop {
            let k = match current.key {
                None => return Ok(None),
                Some(k) => k,
            };
            if key == k {
                return Ok(current.value.clone());
            }
            let next = if key > k { &current.right } else { &current.left };
            match child_node(next, src)? {
                Some(n) => current = n,
                None => return Ok(None),
            }
        }
    }

    /// Test for a key without materializing its value.
    pub fn has(&self, key: i64, src: &dyn AtomSource) -> Result<bool> {
        Ok(self.get_at(key, src)?.is_some())
    }

    /// Insert or replace, returning the new root.
    pub fn set_at(&self, key: i64, value: AtomRef, src: &dyn AtomSource) -> Result<Self> {
        let k = match self.key {
            None => return Ok(Self::leaf(key, value)),
            Some(k) => k,
        };
        let node = if key > k {
            let new_right = match child_node(&self.right, src)? {
                Some(r) => r.set_at(key, value, src)?,
                None => Self::leaf(key, value),
            };
            Self::build(
                k,
                self.value.clone().expect("non-empty node has a value"),
                self.left.clone(),
                Some(wrap(new_right)),
                src,
            )?
        } else if key < k {
            let new_left = match child_node(&self.left, src)? {
                Some(l) => l.set_at(key, value, src)?,
                None => Self::leaf(key, value),
            };
            Self::build(
                k,
                self.value.clone().expect("non-empty node has a value"),
                Some(wrap(new_left)),
                self.right.clone(),
                src,
            )?
        } else {
            Self::build(k, value, self.left.clone(), self.right.clone(), src)?
        };
        node.rebalance(src)
    }

    /// Remove a key if present, returning the new root.
    pub fn remove_key(&self, key: i64, src: &dyn AtomSource) -> Result<Self> {
        let k = match self.key {
            None => return Ok(self.clone()),
            Some(k) => k,
        };
        if key < k {
            return match child_node(&self.left, src)? {
                None => Ok(self.clone()),
                Some(l) => {
                    let new_left = l.remove_key(key, src)?;
                    let node = Self::build(
                        k,
                        self.value.clone().expect("non-empty node has a value"),
                        Self::child_from(new_left),
                        self.right.clone(),
                        src,
                    )?;
                    node.rebalance(src)
                }
            };
        }
        if key > k {
            return match child_node(&self.right, src)? {
                None => Ok(self.clone()),
                Some(r) => {
                    let new_right = r.remove_key(key, src)?;
                    let node = Self::build(
                        k,
                        self.value.clone().expect("non-empty node has a value"),
                        self.left.clone(),
                        Self::child_from(new_right),
                        src,
                    )?;
                    node.rebalance(src)
                }
            };
        }
        // This node goes away.
        let left = child_node(&self.left, src)?;
        let right = child_node(&self.right, src)?;
        match (left, right) {
            (None, None) => Ok(Self::new()),
            (Some(l), None) => Ok(l),
            (None, Some(r)) => Ok(r),
            (Some(_), Some(r)) => {
                // Promote the in-order successor.
                let (succ_key, succ_value) = r
                    .first(src)?
                    .expect("right subtree of a removed node is non-empty");
                let new_right = r.remove_key(succ_key, src)?;
                let node = Self::build(
                    succ_key,
                    succ_value,
                    self.left.clone(),
                    Self::child_from(new_right),
                    src,
                )?;
                node.rebalance(src)
            }
        }
    }

    /// Smallest entry, or `None` when empty.
    pub fn first(&self, src: &dyn AtomSource) -> Result<Option<(i64, AtomRef)>> {
        let mut current = self.clone();
        if current.key.is_none() {
            return Ok(None);
        }
        while let Some(l) = child_node(&current.left, src)? {
            current = l;
        }
        Ok(Some((
            current.key.expect("non-empty node"),
            current.value.clone().expect("non-empty node has a value"),
        )))
    }

    /// Largest entry, or `None` when empty.
    pub fn last(&self, src: &dyn AtomSource) -> Result<Option<(i64, AtomRef)>> {
        let mut current = self.clone();
        if current.key.is_none() {
            return Ok(None);
        }
        while let Some(r) = child_node(&current.right, src)? {
            current = r;
        }
        Ok(Some((
            current.key.expect("non-empty node"),
            current.value.clone().expect("non-empty node has a value"),
        )))
    }

    /// In-order iterator over `(key, value)` pairs.
    ///
    /// Lazy and restartable: each call builds a fresh cursor.
    pub fn iter(&self, src: SourceHandle) -> HashIter {
        let mut it = HashIter {
            src,
            stack: Vec::with_capacity(self.height as usize),
            failed: false,
        };
        if let Err(e) = it.push_left(self.clone()) {
            it.stack.clear();
            it.stack.push(ErrNode::err(e));
        }
        it
    }

    fn balance(&self, src: &dyn AtomSource) -> Result<i64> {
        let (lh, _) = ref_stats(&self.left, src)?;
        let (rh, _) = ref_stats(&self.right, src)?;
        Ok(rh as i64 - lh as i64)
    }

    fn right_rotation(&self, src: &dyn AtomSource) -> Result<Self> {
        let left = match child_node(&self.left, src)? {
            Some(l) => l,
            None => return Ok(self.clone()),
        };
        let new_right = Self::build(
            self.key.expect("rotation on non-empty node"),
            self.value.clone().expect("non-empty node has a value"),
            left.right.clone(),
            self.right.clone(),
            src,
        )?;
        Self::build(
            left.key.expect("non-empty child"),
            left.value.clone().expect("non-empty node has a value"),
            left.left.clone(),
            Some(wrap(new_right)),
            src,
        )
    }

    fn left_rotation(&self, src: &dyn AtomSource) -> Result<Self> {
        let right = match child_node(&self.right, src)? {
            Some(r) => r,
            None => return Ok(self.clone()),
        };
        let new_left = Self::build(
            self.key.expect("rotation on non-empty node"),
            self.value.clone().expect("non-empty node has a value"),
            self.left.clone(),
            right.left.clone(),
            src,
        )?;
        Self::build(
            right.key.expect("non-empty child"),
            right.value.clone().expect("non-empty node has a value"),
            Some(wrap(new_left)),
            right.right.clone(),
            src,
        )
    }

    fn rebalance(&self, src: &dyn AtomSource) -> Result<Self> {
        let balance = self.balance(src)?;
        if (-1..=1).contains(&balance) {
            return Ok(self.clone());
        }
        if balance < -1 {
            let left = child_node(&self.left, src)?.expect("left-heavy node has a left child");
            if left.balance(src)? <= 0 {
                self.right_rotation(src)
            } else {
                let rotated = left.left_rotation(src)?;
                let node = Self::build(
                    self.key.expect("non-empty node"),
                    self.value.clone().expect("non-empty node has a value"),
                    Some(wrap(rotated)),
                    self.right.clone(),
                    src,
                )?;
                node.right_rotation(src)
            }
        } else {
            let right = child_node(&self.right, src)?.expect("right-heavy node has a right child");
            if right.balance(src)? >= 0 {
                self.left_rotation(src)
            } else {
                let rotated = right.right_rotation(src)?;
                let node = Self::build(
                    self.key.expect("non-empty node"),
                    self.value.clone().expect("non-empty node has a value"),
                    self.left.clone(),
                    Some(wrap(rotated)),
                    src,
                )?;
                node.left_rotation(src)
            }
        }
    }

    /// Materialize all entries in key order.
    ///
    /// Borrowing alternative to [`HashDictionary::iter`] for callers that
    /// only hold a plain source reference.
    pub fn entries(&self, src: &dyn AtomSource) -> Result<Vec<(i64, AtomRef)>> {
        let mut out = Vec::with_capacity(self.count as usize);
        self.collect_entries(src, &mut out)?;
        Ok(out)
    }

    fn collect_entries(
        &self,
        src: &dyn AtomSource,
        out: &mut Vec<(i64, AtomRef)>,
    ) -> Result<()> {
        let k = match self.key {
            None => return Ok(()),
            Some(k) => k,
        };
        if let Some(l) = child_node(&self.left, src)? {
            l.collect_entries(src, out)?;
        }
        out.push((k, self.value.clone().expect("non-empty node has a value")));
        if let Some(r) = child_node(&self.right, src)? {
            r.collect_entries(src, out)?;
        }
        Ok(())
    }

    /// All outgoing references of this node.
    pub fn children(&self) -> Vec<AtomRef> {
        let mut out = Vec::with_capacity(3);
        if let Some(v) = &self.value {
            out.push(v.clone());
        }
        if let Some(l) = &self.left {
            out.push(l.clone());
        }
        if let Some(r) = &self.right {
            out.push(r.clone());
        }
        out
    }

    /// Verify the AVL invariants over the whole tree.
    ///
    /// Used by property tests and by integrity checks after load; a
    /// violation is reported as corruption.
    pub fn verify_invariants(&self, src: &dyn AtomSource) -> Result<()> {
        self.verify_bounded(None, None, src).map(|_| ())
    }

    fn verify_bounded(
        &self,
        lo: Option<i64>,
        hi: Option<i64>,
        src: &dyn AtomSource,
    ) -> Result<(u32, u64)> {
        let k = match self.key {
            None => {
                if self.height != 0 || self.count != 0 {
                    return Err(Error::corruption("empty node with non-zero height or count"));
                }
                return Ok((0, 0));
            }
            Some(k) => k,
        };
        if lo.is_some_and(|lo| k <= lo) || hi.is_some_and(|hi| k >= hi) {
            return Err(Error::corruption("key order violated"));
        }
        let (lh, lc) = match child_node(&self.left, src)? {
            Some(l) => l.verify_bounded(lo, Some(k), src)?,
            None => (0, 0),
        };
        let (rh, rc) = match child_node(&self.right, src)? {
            Some(r) => r.verify_bounded(Some(k), hi, src)?,
            None => (0, 0),
        };
        if self.height != 1 + lh.max(rh) {
            return Err(Error::corruption("height invariant violated"));
        }
        if self.count != 1 + lc + rc {
            return Err(Error::corruption("count invariant violated"));
        }
        if (rh as i64 - lh as i64).abs() > 1 {
            return Err(Error::corruption("balance factor out of range"));
        }
        Ok((self.height, self.count))
    }
}

impl Default for HashDictionary {
    fn default() -> Self {
        HashDictionary::new()
    }
}

enum ErrNode {
    Node(HashDictionary),
    Failed(Error),
}

impl ErrNode {
    fn err(e: Error) -> Self {
        ErrNode::Failed(e)
    }
}

/// Lazy in-order cursor over a [`HashDictionary`].
pub struct HashIter {
    src: SourceHandle,
    stack: Vec<ErrNode>,
    failed: bool,
}

impl HashIter {
    fn push_left(&mut self, mut node: HashDictionary) -> Result<()> {
        while node.key.is_some() {
            let left = child_node(&node.left, &*self.src)?;
            self.stack.push(ErrNode::Node(node));
            match left {
                Some(l) => node = l,
                None => break,
            }
        }
        Ok(())
    }
}

impl Iterator for HashIter {
    type Item = Result<(i64, AtomRef)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let node = match self.stack.pop()? {
            ErrNode::Failed(e) => {
                self.failed = true;
                return Some(Err(e));
            }
            ErrNode::Node(n) => n,
        };
        let out = (
            node.key.expect("iterator stack holds non-empty nodes"),
            node.value.clone().expect("non-empty node has a value"),
        );
        match child_node(&node.right, &*self.src) {
            Err(e) => {
                self.failed = true;
                return Some(Err(e));
            }
            Ok(Some(r)) => {
                if let Err(e) = self.push_left(r) {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
            Ok(None) => {}
        }
        Some(Ok(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::NullSource;
    use crate::literal::Literal;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn lit(text: &str) -> AtomRef {
        AtomRef::new(Atom::Literal(Literal::new(text)))
    }

    fn text_of(r: &AtomRef) -> String {
        r.loaded()
            .unwrap()
            .expect_literal()
            .unwrap()
            .text()
            .to_string()
    }

    fn src() -> SourceHandle {
        Arc::new(NullSource)
    }

    #[test]
    fn test_empty_tree_shape() {
        let d = HashDictionary::new();
        assert!(d.is_empty());
        assert_eq!(d.height(), 0);
        assert_eq!(d.count(), 0);
        assert!(d.get_at(1, &NullSource).unwrap().is_none());
    }

    #[test]
    fn test_three_inserts_in_order() {
        let d = HashDictionary::new()
            .set_at(1, lit("A"), &NullSource)
            .unwrap()
            .set_at(2, lit("B"), &NullSource)
            .unwrap()
            .set_at(3, lit("C"), &NullSource)
            .unwrap();
        let items: Vec<(i64, String)> = d
            .iter(src())
            .map(|r| r.map(|(k, v)| (k, text_of(&v))))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(
            items,
            vec![(1, "A".into()), (2, "B".into()), (3, "C".into())]
        );
        assert_eq!(d.height(), 2);
        assert_eq!(d.count(), 3);
        d.verify_invariants(&NullSource).unwrap();
    }

    #[test]
    fn test_replace_keeps_count() {
        let d = HashDictionary::new()
            .set_at(7, lit("old"), &NullSource)
            .unwrap();
        let d2 = d.set_at(7, lit("new"), &NullSource).unwrap();
        assert_eq!(d2.count(), 1);
        assert_eq!(text_of(&d2.get_at(7, &NullSource).unwrap().unwrap()), "new");
        // Persistence: the old root still answers with the old value.
        assert_eq!(text_of(&d.get_at(7, &NullSource).unwrap().unwrap()), "old");
    }

    #[test]
    fn test_remove_only_element() {
        let d = HashDictionary::new()
            .set_at(5, lit("x"), &NullSource)
            .unwrap();
        let d2 = d.remove_key(5, &NullSource).unwrap();
        assert!(d2.is_empty());
        assert_eq!(d2.count(), 0);
        assert_eq!(d2.height(), 0);
        // Removing from the empty tree stays empty.
        assert!(d2.remove_key(5, &NullSource).unwrap().is_empty());
    }

    #[test]
    fn test_remove_with_two_children_promotes_successor() {
        let mut d = HashDictionary::new();
        for k in [50, 30, 70, 20, 40, 60, 80] {
            d = d.set_at(k, lit(&k.to_string()), &NullSource).unwrap();
        }
        let d2 = d.remove_key(50, &NullSource).unwrap();
        d2.verify_invariants(&NullSource).unwrap();
        assert_eq!(d2.count(), 6);
        assert!(!d2.has(50, &NullSource).unwrap());
        let keys: Vec<i64> = d2
            .iter(src())
            .map(|r| r.map(|(k, _)| k))
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(keys, vec![20, 30, 40, 60, 70, 80]);
    }

    #[test]
    fn test_sorted_inserts_stay_balanced() {
        let mut d = HashDictionary::new();
        for k in 0..256 {
            d = d.set_at(k, lit(&k.to_string()), &NullSource).unwrap();
        }
        d.verify_invariants(&NullSource).unwrap();
        assert_eq!(d.count(), 256);
        // A balanced tree over 256 keys is at most ~1.44 log2(n) tall.
        assert!(d.height() <= 12, "height {} too large", d.height());
    }

    #[test]
    fn test_first_and_last() {
        let mut d = HashDictionary::new();
        for k in [9, 3, 11, -4] {
            d = d.set_at(k, lit(&k.to_string()), &NullSource).unwrap();
        }
        assert_eq!(d.first(&NullSource).unwrap().unwrap().0, -4);
        assert_eq!(d.last(&NullSource).unwrap().unwrap().0, 11);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_avl_invariants_hold(ops in proptest::collection::vec((any::<i16>(), any::<bool>()), 1..120)) {
            let mut d = HashDictionary::new();
            for (key, insert) in ops {
                let key = key as i64;
                d = if insert {
                    d.set_at(key, lit("v"), &NullSource).unwrap()
                } else {
                    d.remove_key(key, &NullSource).unwrap()
                };
                d.verify_invariants(&NullSource).unwrap();
            }
        }

        #[test]
        fn prop_set_then_get(keys in proptest::collection::btree_set(any::<i32>(), 1..60)) {
            let mut d = HashDictionary::new();
            for k in &keys {
                d = d.set_at(*k as i64, lit(&k.to_string()), &NullSource).unwrap();
            }
            for k in &keys {
                let got = d.get_at(*k as i64, &NullSource).unwrap().unwrap();
                prop_assert_eq!(text_of(&got), k.to_string());
            }
            prop_assert_eq!(d.count(), keys.len() as u64);
            let in_order: Vec<i64> = d.iter(src()).map(|r| r.map(|(k, _)| k)).collect::<Result<_>>().unwrap();
            let expected: Vec<i64> = keys.iter().map(|k| *k as i64).collect();
            prop_assert_eq!(in_order, expected);
        }

        #[test]
        fn prop_untouched_keys_survive_mutations(
            keys in proptest::collection::btree_set(0i64..1000, 2..40),
            victim_idx in any::<prop::sample::Index>(),
        ) {
            let keys: Vec<i64> = keys.into_iter().collect();
            let victim = keys[victim_idx.index(keys.len())];
            let mut d = HashDictionary::new();
            for k in &keys {
                d = d.set_at(*k, lit(&k.to_string()), &NullSource).unwrap();
            }
            let d2 = d.remove_key(victim, &NullSource).unwrap();
            for k in keys.iter().filter(|k| **k != victim) {
                prop_assert!(d2.has(*k, &NullSource).unwrap());
            }
            prop_assert!(!d2.has(victim, &NullSource).unwrap());
            // The old root is untouched.
            prop_assert!(d.has(victim, &NullSource).unwrap());
        }
    }
}
