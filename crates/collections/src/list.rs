//! Indexed sequence: an AVL tree keyed by position.
//!
//! Positions are not stored; they are derived from left-subtree sizes while
//! descending, so inserting in the middle renumbers nothing. Split and join
//! keep `slice` logarithmic.

use crate::atom::{Atom, AtomSource, SourceHandle};
use crate::atom_ref::AtomRef;
use atomdb_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// AVL node of an indexed sequence.
///
/// The empty list is a node without a value; child subtrees are never empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct List {
    value: Option<AtomRef>,
    left: Option<AtomRef>,
    right: Option<AtomRef>,
    height: u32,
    count: u64,
}

fn child_node(r: &Option<AtomRef>, src: &dyn AtomSource) -> Result<Option<List>> {
    match r {
        None => Ok(None),
        Some(r) => {
            let atom = r.resolve(src)?;
            Ok(Some(atom.expect_list()?.clone()))
        }
    }
}

fn ref_stats(r: &Option<AtomRef>, src: &dyn AtomSource) -> Result<(u32, u64)> {
    match child_node(r, src)? {
        None => Ok((0, 0)),
        Some(n) => Ok((n.height, n.count)),
    }
}

fn wrap(node: List) -> AtomRef {
    AtomRef::new(Atom::List(node))
}

impl List {
    /// The empty list.
    pub fn new() -> Self {
        List {
            value: None,
            left: None,
            right: None,
            height: 0,
            count: 0,
        }
    }

    fn leaf(value: AtomRef) -> Self {
        List {
            value: Some(value),
            left: None,
            right: None,
            height: 1,
            count: 1,
        }
    }

    fn build(
        value: AtomRef,
        left: Option<AtomRef>,
        right: Option<AtomRef>,
        src: &dyn AtomSource,
    ) -> Result<Self> {
        let (lh, lc) = ref_stats(&left, src)?;
        let (rh, rc) = ref_stats(&right, src)?;
        Ok(List {
            value: Some(value),
            left,
            right,
            height: 1 + lh.max(rh),
            count: 1 + lc + rc,
        })
    }

    fn child_from(node: List) -> Option<AtomRef> {
        if node.is_empty() {
            None
        } else {
            Some(wrap(node))
        }
    }

    /// Number of elements.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Height of the tree (0 when empty).
    pub fn height(&self) -> u32 {
        self.height
    }

    /// True when no element is present.
    pub fn is_empty(&self) -> bool {
        self.value.is_none()
    }

    /// Element at `index`, or `None` past the end.
    pub fn get_at(&self, index: u64, src: &dyn AtomSource) -> Result<Option<AtomRef>> {
        if index >= self.count {
            return Ok(None);
        }
        let mut node = self.clone();
        let mut index = index;
        loop {
            let (_, lc) = ref_stats(&node.left, src)?;
            if index < lc {
                node = child_node(&node.left, src)?.expect("index within left subtree");
            } else if index == lc {
                return Ok(node.value.clone());
            } else {
                index -= lc + 1;
                node = child_node(&node.right, src)?.expect("index within right subtree");
            }
        }
    }

    /// Replace the element at `index`, returning the new list.
    pub fn set_at(&self, index: u64, value: AtomRef, src: &dyn AtomSource) -> Result<List> {
        if index >= self.count {
            return Err(Error::validation(format!(
                "set_at index {} out of range (len {})",
                index, self.count
            )));
        }
        let (_, lc) = ref_stats(&self.left, src)?;
        if index < lc {
            let l = child_node(&self.left, src)?.expect("index within left subtree");
            let new_left = l.set_at(index, value, src)?;
            Self::build(
                self.value.clone().expect("non-empty node has a value"),
                Some(wrap(new_left)),
                self.right.clone(),
                src,
            )
        } else if index == lc {
            Self::build(value, self.left.clone(), self.right.clone(), src)
        } else {
            let r = child_node(&self.right, src)?.expect("index within right subtree");
            let new_right = r.set_at(index - lc - 1, value, src)?;
            Self::build(
                self.value.clone().expect("non-empty node has a value"),
                self.left.clone(),
                Some(wrap(new_right)),
                src,
            )
        }
    }

    /// Insert before `index` (clamped to the end), returning the new list.
    pub fn insert_at(&self, index: u64, value: AtomRef, src: &dyn AtomSource) -> Result<List> {
        if self.is_empty() {
            return Ok(Self::leaf(value));
        }
        let (_, lc) = ref_stats(&self.left, src)?;
        let node = if index <= lc {
            let new_left = match child_node(&self.left, src)? {
                Some(l) => l.insert_at(index, value, src)?,
                None => Self::leaf(value),
            };
            Self::build(
                self.value.clone().expect("non-empty node has a value"),
                Some(wrap(new_left)),
                self.right.clone(),
                src,
            )?
        } else {
            let new_right = match child_node(&self.right, src)? {
                Some(r) => r.insert_at(index - lc - 1, value, src)?,
                None => Self::leaf(value),
            };
            Self::build(
                self.value.clone().expect("non-empty node has a value"),
                self.left.clone(),
                Some(wrap(new_right)),
                src,
            )?
        };
        node.rebalance(src)
    }

    /// Append at the front.
    pub fn append_first(&self, value: AtomRef, src: &dyn AtomSource) -> Result<List> {
        self.insert_at(0, value, src)
    }

    /// Append at the back.
    pub fn append_last(&self, value: AtomRef, src: &dyn AtomSource) -> Result<List> {
        self.insert_at(self.count, value, src)
    }

    /// Remove the element at `index`, returning the new list.
    pub fn remove_at(&self, index: u64, src: &dyn AtomSource) -> Result<List> {
        if index >= self.count {
            return Err(Error::validation(format!(
                "remove_at index {} out of range (len {})",
                index, self.count
            )));
        }
        let (_, lc) = ref_stats(&self.left, src)?;
        if index < lc {
            let l = child_node(&self.left, src)?.expect("index within left subtree");
            let new_left = l.remove_at(index, src)?;
            let node = Self::build(
                self.value.clone().expect("non-empty node has a value"),
                Self::child_from(new_left),
                self.right.clone(),
                src,
            )?;
            return node.rebalance(src);
        }
        if index > lc {
            let r = child_node(&self.right, src)?.expect("index within right subtree");
            let new_right = r.remove_at(index - lc - 1, src)?;
            let node = Self::build(
                self.value.clone().expect("non-empty node has a value"),
                self.left.clone(),
                Self::child_from(new_right),
                src,
            )?;
            return node.rebalance(src);
        }
        // Remove this node.
        let left = child_node(&self.left, src)?;
        let right = child_node(&self.right, src)?;
        match (left, right) {
            (None, None) => Ok(Self::new()),
            (Some(l), None) => Ok(l),
            (None, Some(r)) => Ok(r),
            (Some(_), Some(r)) => {
                let successor = r
                    .get_at(0, src)?
                    .expect("right subtree of a removed node is non-empty");
                let new_right = r.remove_at(0, src)?;
                let node = Self::build(
                    successor,
                    self.left.clone(),
                    Self::child_from(new_right),
                    src,
                )?;
                node.rebalance(src)
            }
        }
    }

    /// Elements in `[lo, hi)`, clamped to the length; `lo >= hi` is empty.
    pub fn slice(&self, lo: u64, hi: u64, src: &dyn AtomSource) -> Result<List> {
        let hi = hi.min(self.count);
        let lo = lo.min(hi);
        if lo >= hi {
            return Ok(List::new());
        }
        let (_, tail) = self.split(lo, src)?;
        let (mid, _) = tail.split(hi - lo, src)?;
        Ok(mid)
    }

    /// Split into the first `n` elements and the rest.
    pub fn split(&self, n: u64, src: &dyn AtomSource) -> Result<(List, List)> {
        if n == 0 {
            return Ok((List::new(), self.clone()));
        }
        if n >= self.count {
            return Ok((self.clone(), List::new()));
        }
        let (_, lc) = ref_stats(&self.left, src)?;
        let value = self.value.clone().expect("non-empty node has a value");
        if n <= lc {
            let l = child_node(&self.left, src)?.expect("split point within left subtree");
            let (a, b) = l.split(n, src)?;
            let right = child_node(&self.right, src)?.unwrap_or_default();
            let rest = Self::join(b, value, right, src)?;
            Ok((a, rest))
        } else {
            let r = child_node(&self.right, src)?.expect("split point within right subtree");
            let (a, b) = r.split(n - lc - 1, src)?;
            let left = child_node(&self.left, src)?.unwrap_or_default();
            let first = Self::join(left, value, a, src)?;
            Ok((first, b))
        }
    }

    /// Balanced concatenation `l ++ [v] ++ r`.
    fn join(l: List, v: AtomRef, r: List, src: &dyn AtomSource) -> Result<List> {
        if l.height.abs_diff(r.height) <= 1 {
            return Self::build(v, Self::child_from(l), Self::child_from(r), src);
        }
        if l.height > r.height {
            let lr = child_node(&l.right, src)?.unwrap_or_default();
            let new_right = Self::join(lr, v, r, src)?;
            let node = Self::build(
                l.value.clone().expect("taller side is non-empty"),
                l.left.clone(),
                Self::child_from(new_right),
                src,
            )?;
            node.rebalance(src)
        } else {
            let rl = child_node(&r.left, src)?.unwrap_or_default();
            let new_left = Self::join(l, v, rl, src)?;
            let node = Self::build(
                r.value.clone().expect("taller side is non-empty"),
                Self::child_from(new_left),
                r.right.clone(),
                src,
            )?;
            node.rebalance(src)
        }
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
            self.value.clone().expect("rotation on non-empty node"),
            left.right.clone(),
            self.right.clone(),
            src,
        )?;
        Self::build(
            left.value.clone().expect("non-empty child"),
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
            self.value.clone().expect("rotation on non-empty node"),
            self.left.clone(),
            right.left.clone(),
            src,
        )?;
        Self::build(
            right.value.clone().expect("non-empty child"),
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
                    self.value.clone().expect("non-empty node"),
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
                    self.value.clone().expect("non-empty node"),
                    self.left.clone(),
                    Some(wrap(rotated)),
                    src,
                )?;
                node.left_rotation(src)
            }
        }
    }

    /// Materialize all elements in order through a borrowed source.
    pub fn elements(&self, src: &dyn AtomSource) -> Result<Vec<AtomRef>> {
        let mut out = Vec::with_capacity(self.count as usize);
        self.collect_elements(src, &mut out)?;
        Ok(out)
    }

    fn collect_elements(&self, src: &dyn AtomSource, out: &mut Vec<AtomRef>) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }
        if let Some(l) = child_node(&self.left, src)? {
            l.collect_elements(src, out)?;
        }
        out.push(self.value.clone().expect("non-empty node has a value"));
        if let Some(r) = child_node(&self.right, src)? {
            r.collect_elements(src, out)?;
        }
        Ok(())
    }

    /// Lazy in-order iterator.
    pub fn iter(&self, src: SourceHandle) -> ListIter {
        let mut it = ListIter {
            src,
            stack: Vec::with_capacity(self.height as usize),
            failed: None,
        };
        if let Err(e) = it.push_left(self.clone()) {
            it.stack.clear();
            it.failed = Some(e);
        }
        it
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

    /// Verify height, count and balance invariants over the whole tree.
    pub fn verify_invariants(&self, src: &dyn AtomSource) -> Result<()> {
        self.verify_node(src).map(|_| ())
    }

    fn verify_node(&self, src: &dyn AtomSource) -> Result<(u32, u64)> {
        if self.is_empty() {
            if self.height != 0 || self.count != 0 {
                return Err(Error::corruption("empty node with non-zero height or count"));
            }
            return Ok((0, 0));
        }
        let (lh, lc) = match child_node(&self.left, src)? {
            Some(l) => l.verify_node(src)?,
            None => (0, 0),
        };
        let (rh, rc) = match child_node(&self.right, src)? {
            Some(r) => r.verify_node(src)?,
            None => (0, 0),
        };
        if self.height != 1 + lh.max(rh) || self.count != 1 + lc + rc {
            return Err(Error::corruption("list height or count invariant violated"));
        }
        if (rh as i64 - lh as i64).abs() > 1 {
            return Err(Error::corruption("list balance factor out of range"));
        }
        Ok((self.height, self.count))
    }
}

impl Default for List {
    fn default() -> Self {
        List::new()
    }
}

/// Lazy in-order cursor over a [`List`].
pub struct ListIter {
    src: SourceHandle,
    stack: Vec<List>,
    failed: Option<atomdb_core::Error>,
}

impl ListIter {
    fn push_left(&mut self, mut node: List) -> Result<()> {
        while !node.is_empty() {
            let left = child_node(&node.left, &*self.src)?;
            self.stack.push(node);
            match left {
                Some(l) => node = l,
                None => break,
            }
        }
        Ok(())
    }
}

impl Iterator for ListIter {
    type Item = Result<AtomRef>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(e) = self.failed.take() {
            self.stack.clear();
            return Some(Err(e));
        }
        let node = self.stack.pop()?;
        let out = node.value.clone().expect("iterator stack holds non-empty nodes");
        match child_node(&node.right, &*self.src) {
            Err(e) => {
                self.stack.clear();
                return Some(Err(e));
            }
            Ok(Some(r)) => {
                if let Err(e) = self.push_left(r) {
                    self.stack.clear();
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

    fn lit(text: &str) -> AtomRef {
        AtomRef::new(Atom::Literal(Literal::new(text)))
    }

    fn texts(list: &List) -> Vec<String> {
        list.elements(&NullSource)
            .unwrap()
            .iter()
            .map(|r| {
                r.loaded()
                    .unwrap()
                    .expect_literal()
                    .unwrap()
                    .text()
                    .to_string()
            })
            .collect()
    }

    fn from_strs(items: &[&str]) -> List {
        let mut l = List::new();
        for s in items {
            l = l.append_last(lit(s), &NullSource).unwrap();
        }
        l
    }

    #[test]
    fn test_appends_preserve_order() {
        let l = from_strs(&["b", "c"])
            .append_first(lit("a"), &NullSource)
            .unwrap()
            .append_last(lit("d"), &NullSource)
            .unwrap();
        assert_eq!(texts(&l), vec!["a", "b", "c", "d"]);
        l.verify_invariants(&NullSource).unwrap();
    }

    #[test]
    fn test_insert_middle() {
        let l = from_strs(&["a", "c"])
            .insert_at(1, lit("b"), &NullSource)
            .unwrap();
        assert_eq!(texts(&l), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_get_and_set() {
        let l = from_strs(&["x", "y", "z"]);
        assert!(l.get_at(3, &NullSource).unwrap().is_none());
        let l2 = l.set_at(1, lit("Y"), &NullSource).unwrap();
        assert_eq!(texts(&l2), vec!["x", "Y", "z"]);
        // Old version untouched.
        assert_eq!(texts(&l), vec!["x", "y", "z"]);
        assert!(l.set_at(3, lit("w"), &NullSource).unwrap_err().is_validation());
    }

    #[test]
    fn test_remove_only_element() {
        let l = from_strs(&["solo"]).remove_at(0, &NullSource).unwrap();
        assert!(l.is_empty());
        assert_eq!(l.count(), 0);
        assert_eq!(l.height(), 0);
    }

    #[test]
    fn test_remove_out_of_range() {
        let err = from_strs(&["a"]).remove_at(1, &NullSource).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_slice_bounds() {
        let l = from_strs(&["a", "b", "c", "d", "e"]);
        assert_eq!(texts(&l.slice(1, 4, &NullSource).unwrap()), vec!["b", "c", "d"]);
        assert_eq!(texts(&l.slice(0, 99, &NullSource).unwrap()), texts(&l));
        assert!(l.slice(3, 3, &NullSource).unwrap().is_empty());
        assert!(l.slice(4, 2, &NullSource).unwrap().is_empty());
        l.slice(1, 4, &NullSource)
            .unwrap()
            .verify_invariants(&NullSource)
            .unwrap();
    }

    #[test]
    fn test_long_appends_stay_balanced() {
        let mut l = List::new();
        for i in 0..200 {
            l = l.append_last(lit(&i.to_string()), &NullSource).unwrap();
        }
        l.verify_invariants(&NullSource).unwrap();
        assert!(l.height() <= 11, "height {} too large", l.height());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_matches_vec_model(ops in proptest::collection::vec((0u64..64, any::<bool>()), 1..80)) {
            let mut model: Vec<String> = Vec::new();
            let mut list = List::new();
            for (i, (pos, insert)) in ops.into_iter().enumerate() {
                if insert {
                    let pos = (pos as usize).min(model.len());
                    model.insert(pos, i.to_string());
                    list = list.insert_at(pos as u64, lit(&i.to_string()), &NullSource).unwrap();
                } else if !model.is_empty() {
                    let pos = (pos as usize) % model.len();
                    model.remove(pos);
                    list = list.remove_at(pos as u64, &NullSource).unwrap();
                }
                list.verify_invariants(&NullSource).unwrap();
            }
            prop_assert_eq!(texts(&list), model);
        }

        #[test]
        fn prop_slice_matches_vec(len in 0u64..40, lo in 0u64..50, hi in 0u64..50) {
            let items: Vec<String> = (0..len).map(|i| i.to_string()).collect();
            let refs: Vec<&str> = items.iter().map(|s| s.as_str()).collect();
            let list = from_strs(&refs);
            let sliced = list.slice(lo, hi, &NullSource).unwrap();
            let lo_c = (lo as usize).min(items.len());
            let hi_c = (hi as usize).min(items.len());
            let expected: Vec<String> = if lo_c < hi_c { items[lo_c..hi_c].to_vec() } else { Vec::new() };
            prop_assert_eq!(texts(&sliced), expected);
            sliced.verify_invariants(&NullSource).unwrap();
        }
    }
}
