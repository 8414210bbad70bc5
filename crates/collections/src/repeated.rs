//! Ordered multi-map from field value to a set of records.
//!
//! This is the backing structure for secondary indexes: one slot per
//! distinct field value, each slot holding the set of records carrying that
//! value. The tree is keyed directly by [`Value`] using its cross-type
//! total order, which is what makes bounded range scans possible for the
//! range search plan.

use crate::atom::{Atom, AtomSource, SourceHandle};
use crate::atom_ref::AtomRef;
use crate::set::Set;
use atomdb_core::{Error, Result, Value};
use serde::{Deserialize, Serialize};

/// AVL node of an ordered multi-map.
///
/// The empty map is a node without a key; child subtrees are never empty,
/// and slots are never empty sets (a slot emptied by removal disappears).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepeatedKeysDictionary {
    key: Option<Value>,
    slot: Option<AtomRef>,
    left: Option<AtomRef>,
    right: Option<AtomRef>,
    height: u32,
    keys: u64,
    records: u64,
}

fn child_node(
    r: &Option<AtomRef>,
    src: &dyn AtomSource,
) -> Result<Option<RepeatedKeysDictionary>> {
    match r {
        None => Ok(None),
        Some(r) => {
            let atom = r.resolve(src)?;
            Ok(Some(atom.expect_repeated()?.clone()))
        }
    }
}

fn ref_stats(r: &Option<AtomRef>, src: &dyn AtomSource) -> Result<(u32, u64, u64)> {
    match child_node(r, src)? {
        None => Ok((0, 0, 0)),
        Some(n) => Ok((n.height, n.keys, n.records)),
    }
}

fn wrap(node: RepeatedKeysDictionary) -> AtomRef {
    AtomRef::new(Atom::RepeatedKeysDictionary(node))
}

fn wrap_slot(set: Set) -> AtomRef {
    AtomRef::new(Atom::Set(set))
}

fn slot_set(slot: &Option<AtomRef>, src: &dyn AtomSource) -> Result<Set> {
    match slot {
        None => Err(Error::corruption("index node without a slot set")),
        Some(s) => Ok(s.resolve(src)?.expect_set()?.clone()),
    }
}

impl RepeatedKeysDictionary {
    /// The empty map.
    pub fn new() -> Self {
        RepeatedKeysDictionary {
            key: None,
            slot: None,
            left: None,
            right: None,
            height: 0,
            keys: 0,
            records: 0,
        }
    }

    fn leaf(key: Value, slot: Set) -> Self {
        let records = slot.count();
        RepeatedKeysDictionary {
            key: Some(key),
            slot: Some(wrap_slot(slot)),
            left: None,
            right: None,
            height: 1,
            keys: 1,
            records,
        }
    }

    fn build(
        key: Value,
        slot: AtomRef,
        slot_records: u64,
        left: Option<AtomRef>,
        right: Option<AtomRef>,
        src: &dyn AtomSource,
    ) -> Result<Self> {
        let (lh, lk, lr) = ref_stats(&left, src)?;
        let (rh, rk, rr) = ref_stats(&right, src)?;
        Ok(RepeatedKeysDictionary {
            key: Some(key),
            slot: Some(slot),
            left,
            right,
            height: 1 + lh.max(rh),
            keys: 1 + lk + rk,
            records: slot_records + lr + rr,
        })
    }

    fn child_from(node: RepeatedKeysDictionary) -> Option<AtomRef> {
        if node.is_empty() {
            None
        } else {
            Some(wrap(node))
        }
    }

    fn slot_records(&self, src: &dyn AtomSource) -> Result<u64> {
        Ok(slot_set(&self.slot, src)?.count())
    }

    /// Number of distinct keys.
    pub fn key_count(&self) -> u64 {
        self.keys
    }

    /// Total number of records across all slots.
    ///
    /// The optimizer uses this as the cardinality estimate of an index.
    pub fn record_count(&self) -> u64 {
        self.records
    }

    /// Height of the tree (0 when empty).
    pub fn height(&self) -> u32 {
        self.height
    }

    /// True when no key is present.
    pub fn is_empty(&self) -> bool {
        self.key.is_none()
    }

    /// The set of records stored under `key`, if any.
    pub fn get_at(&self, key: &Value, src: &dyn AtomSource) -> Result<Option<Set>> {
        let mut current = self.clone();
        loop {
            let k = match &current.key {
                None => return Ok(None),
                Some(k) => k.clone(),
            };
            if *key == k {
                return Ok(Some(slot_set(&current.slot, src)?));
            }
            let next = if *key > k {
                &current.right
            } else {
                &current.left
            };
            match child_node(next, src)? {
                Some(n) => current = n,
                None => return Ok(None),
            }
        }
    }

    /// Add `record` under `key`, returning the new map.
    ///
    /// The slot for `key` becomes the union of the old slot and the record.
    pub fn set_at(&self, key: Value, record: AtomRef, src: &dyn AtomSource) -> Result<Self> {
        let k = match &self.key {
            None => return Ok(Self::leaf(key, Set::new().add(record, src)?)),
            Some(k) => k.clone(),
        };
        let node = if key > k {
            let new_right = match child_node(&self.right, src)? {
                Some(r) => r.set_at(key, record, src)?,
                None => Self::leaf(key, Set::new().add(record, src)?),
            };
            Self::build(
                k,
                self.slot.clone().expect("non-empty node has a slot"),
                self.slot_records(src)?,
                self.left.clone(),
                Some(wrap(new_right)),
                src,
            )?
        } else if key < k {
            let new_left = match child_node(&self.left, src)? {
                Some(l) => l.set_at(key, record, src)?,
                None => Self::leaf(key, Set::new().add(record, src)?),
            };
            Self::build(
                k,
                self.slot.clone().expect("non-empty node has a slot"),
                self.slot_records(src)?,
                Some(wrap(new_left)),
                self.right.clone(),
                src,
            )?
        } else {
            let slot = slot_set(&self.slot, src)?.add(record, src)?;
            let records = slot.count();
            Self::build(
                k,
                wrap_slot(slot),
                records,
                self.left.clone(),
                self.right.clone(),
                src,
            )?
        };
        node.rebalance(src)
    }

    /// Remove `record` from the slot of `key`, returning the new map.
    ///
    /// The slot disappears entirely once its last record is removed.
    pub fn remove_record(
        &self,
        key: &Value,
        record: &AtomRef,
        src: &dyn AtomSource,
    ) -> Result<Self> {
        let k = match &self.key {
            None => return Ok(self.clone()),
            Some(k) => k.clone(),
        };
        if *key == k {
            let slot = slot_set(&self.slot, src)?.remove_member(record, src)?;
            if slot.is_empty() {
                return self.remove_key(key, src);
            }
            let records = slot.count();
            let node = Self::build(
                k,
                wrap_slot(slot),
                records,
                self.left.clone(),
                self.right.clone(),
                src,
            )?;
            return Ok(node);
        }
        let node = if *key > k {
            match child_node(&self.right, src)? {
                None => return Ok(self.clone()),
                Some(r) => {
                    let new_right = r.remove_record(key, record, src)?;
                    Self::build(
                        k,
                        self.slot.clone().expect("non-empty node has a slot"),
                        self.slot_records(src)?,
                        self.left.clone(),
                        Self::child_from(new_right),
                        src,
                    )?
                }
            }
        } else {
            match child_node(&self.left, src)? {
                None => return Ok(self.clone()),
                Some(l) => {
                    let new_left = l.remove_record(key, record, src)?;
                    Self::build(
                        k,
                        self.slot.clone().expect("non-empty node has a slot"),
                        self.slot_records(src)?,
                        Self::child_from(new_left),
                        self.right.clone(),
                        src,
                    )?
                }
            }
        };
        node.rebalance(src)
    }

    /// Drop the whole slot of `key`, returning the new map.
    pub fn remove_key(&self, key: &Value, src: &dyn AtomSource) -> Result<Self> {
        let k = match &self.key {
            None => return Ok(self.clone()),
            Some(k) => k.clone(),
        };
        if *key < k {
            return match child_node(&self.left, src)? {
                None => Ok(self.clone()),
                Some(l) => {
                    let new_left = l.remove_key(key, src)?;
                    let node = Self::build(
                        k,
                        self.slot.clone().expect("non-empty node has a slot"),
                        self.slot_records(src)?,
                        Self::child_from(new_left),
                        self.right.clone(),
                        src,
                    )?;
                    node.rebalance(src)
                }
            };
        }
        if *key > k {
            return match child_node(&self.right, src)? {
                None => Ok(self.clone()),
                Some(r) => {
                    let new_right = r.remove_key(key, src)?;
                    let node = Self::build(
                        k,
                        self.slot.clone().expect("non-empty node has a slot"),
                        self.slot_records(src)?,
                        self.left.clone(),
                        Self::child_from(new_right),
                        src,
                    )?;
                    node.rebalance(src)
                }
            };
        }
        let left = child_node(&self.left, src)?;
        let right = child_node(&self.right, src)?;
        match (left, right) {
            (None, None) => Ok(Self::new()),
            (Some(l), None) => Ok(l),
            (None, Some(r)) => Ok(r),
            (Some(_), Some(r)) => {
                let (succ_key, succ_slot) = r
                    .first(src)?
                    .expect("right subtree of a removed node is non-empty");
                let new_right = r.remove_key(&succ_key, src)?;
                let records = succ_slot.count();
                let node = Self::build(
                    succ_key,
                    wrap_slot(succ_slot),
                    records,
                    self.left.clone(),
                    Self::child_from(new_right),
                    src,
                )?;
                node.rebalance(src)
            }
        }
    }

    /// Smallest key and its slot, or `None` when empty.
    pub fn first(&self, src: &dyn AtomSource) -> Result<Option<(Value, Set)>> {
        let mut current = self.clone();
        if current.key.is_none() {
            return Ok(None);
        }
        while let Some(l) = child_node(&current.left, src)? {
            current = l;
        }
        Ok(Some((
            current.key.clone().expect("non-empty node"),
            slot_set(&current.slot, src)?,
        )))
    }

    /// Slots whose key falls within the given bounds, in key order.
    ///
    /// `None` bounds are open; `inclusive` controls whether each present
    /// bound admits an exactly-equal key. An inverted range is empty.
    pub fn range(
        &self,
        lo: Option<Value>,
        hi: Option<Value>,
        inclusive: (bool, bool),
        src: SourceHandle,
    ) -> RangeIter {
        let empty = match (&lo, &hi) {
            (Some(lo_v), Some(hi_v)) => {
                lo_v > hi_v || (lo_v == hi_v && !(inclusive.0 && inclusive.1))
            }
            _ => false,
        };
        let mut stack = Vec::new();
        if !empty && !self.is_empty() {
            stack.push(Walk::Explore(self.clone()));
        }
        RangeIter {
            src,
            lo,
            hi,
            inclusive,
            stack,
        }
    }

    /// Iterator over every `(key, slot)` pair in key order.
    pub fn iter(&self, src: SourceHandle) -> RangeIter {
        self.range(None, None, (true, true), src)
    }

    fn balance(&self, src: &dyn AtomSource) -> Result<i64> {
        let (lh, _, _) = ref_stats(&self.left, src)?;
        let (rh, _, _) = ref_stats(&self.right, src)?;
        Ok(rh as i64 - lh as i64)
    }

    fn right_rotation(&self, src: &dyn AtomSource) -> Result<Self> {
        let left = match child_node(&self.left, src)? {
            Some(l) => l,
            None => return Ok(self.clone()),
        };
        let new_right = Self::build(
            self.key.clone().expect("rotation on non-empty node"),
            self.slot.clone().expect("non-empty node has a slot"),
            self.slot_records(src)?,
            left.right.clone(),
            self.right.clone(),
            src,
        )?;
        Self::build(
            left.key.clone().expect("non-empty child"),
            left.slot.clone().expect("non-empty node has a slot"),
            left.slot_records(src)?,
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
            self.key.clone().expect("rotation on non-empty node"),
            self.slot.clone().expect("non-empty node has a slot"),
            self.slot_records(src)?,
            self.left.clone(),
            right.left.clone(),
            src,
        )?;
        Self::build(
            right.key.clone().expect("non-empty child"),
            right.slot.clone().expect("non-empty node has a slot"),
            right.slot_records(src)?,
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
                    self.key.clone().expect("non-empty node"),
                    self.slot.clone().expect("non-empty node has a slot"),
                    self.slot_records(src)?,
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
                    self.key.clone().expect("non-empty node"),
                    self.slot.clone().expect("non-empty node has a slot"),
                    self.slot_records(src)?,
                    self.left.clone(),
                    Some(wrap(rotated)),
                    src,
                )?;
                node.left_rotation(src)
            }
        }
    }

    /// All outgoing references of this node.
    pub fn children(&self) -> Vec<AtomRef> {
        let mut out = Vec::with_capacity(3);
        if let Some(s) = &self.slot {
            out.push(s.clone());
        }
        if let Some(l) = &self.left {
            out.push(l.clone());
        }
        if let Some(r) = &self.right {
            out.push(r.clone());
        }
        out
    }
}

impl Default for RepeatedKeysDictionary {
    fn default() -> Self {
        RepeatedKeysDictionary::new()
    }
}

enum Walk {
    Explore(RepeatedKeysDictionary),
    Emit(Value, AtomRef),
}

/// Ordered cursor over `(key, slot)` pairs within bounds.
pub struct RangeIter {
    src: SourceHandle,
    lo: Option<Value>,
    hi: Option<Value>,
    inclusive: (bool, bool),
    stack: Vec<Walk>,
}

impl RangeIter {
    fn above_lo(&self, key: &Value) -> bool {
        match &self.lo {
            None => true,
            Some(lo) => key > lo || (self.inclusive.0 && key == lo),
        }
    }

    fn below_hi(&self, key: &Value) -> bool {
        match &self.hi {
            None => true,
            Some(hi) => key < hi || (self.inclusive.1 && key == hi),
        }
    }
}

impl Iterator for RangeIter {
    type Item = Result<(Value, Set)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.stack.pop()? {
                Walk::Emit(key, slot) => {
                    let set = match slot.resolve(&*self.src) {
                        Ok(atom) => match atom.expect_set() {
                            Ok(s) => s.clone(),
                            Err(e) => {
                                self.stack.clear();
                                return Some(Err(e));
                            }
                        },
                        Err(e) => {
                            self.stack.clear();
                            return Some(Err(e));
                        }
                    };
                    return Some(Ok((key, set)));
                }
                Walk::Explore(node) => {
                    let key = match &node.key {
                        None => continue,
                        Some(k) => k.clone(),
                    };
                    // Push right first so the left side is emitted first.
                    let explore_left = self.lo.as_ref().map_or(true, |lo| key > *lo);
                    let explore_right = self.hi.as_ref().map_or(true, |hi| key < *hi);
                    if explore_right {
                        match child_node(&node.right, &*self.src) {
                            Err(e) => {
                                self.stack.clear();
                                return Some(Err(e));
                            }
                            Ok(Some(r)) => self.stack.push(Walk::Explore(r)),
                            Ok(None) => {}
                        }
                    }
                    if self.above_lo(&key) && self.below_hi(&key) {
                        let slot = node.slot.clone().expect("non-empty node has a slot");
                        self.stack.push(Walk::Emit(key.clone(), slot));
                    }
                    if explore_left {
                        match child_node(&node.left, &*self.src) {
                            Err(e) => {
                                self.stack.clear();
                                return Some(Err(e));
                            }
                            Ok(Some(l)) => self.stack.push(Walk::Explore(l)),
                            Ok(None) => {}
                        }
                    }
                }
            }
        }
    }
}
