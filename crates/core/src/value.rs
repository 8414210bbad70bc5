//! Scalar values stored inline in records and used as index keys.
//!
//! `Value` carries a total order so that ordered index trees can hold keys
//! of mixed kinds: values rank by type first (`Null < Bool < numbers <
//! String < Bytes`), numbers compare across `Int`/`Float` by magnitude, and
//! floats use IEEE total ordering so the order is antisymmetric even for
//! NaN payloads.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use xxhash_rust::xxh3::xxh3_64;

/// Scalar payload for record fields and index keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Double-precision float.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl Value {
    /// Rank of the variant in the cross-type total order.
    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) | Value::Float(_) => 2,
            Value::String(_) => 3,
            Value::Bytes(_) => 4,
        }
    }

    /// True for `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Stable content-derived 64-bit hash.
    ///
    /// The same value always produces the same hash, across processes and
    /// restarts; it is the basis for set membership keys.
    pub fn stable_hash(&self) -> i64 {
        let mut buf: Vec<u8> = Vec::with_capacity(16);
        match self {
            Value::Null => buf.push(0),
            Value::Bool(b) => {
                buf.push(1);
                buf.push(*b as u8);
            }
            Value::Int(i) => {
                buf.push(2);
                buf.extend_from_slice(&i.to_be_bytes());
            }
            Value::Float(f) => {
                buf.push(3);
                buf.extend_from_slice(&f.to_bits().to_be_bytes());
            }
            Value::String(s) => {
                buf.push(4);
                buf.extend_from_slice(s.as_bytes());
            }
            Value::Bytes(b) => {
                buf.push(5);
                buf.extend_from_slice(b);
            }
        }
        xxh3_64(&buf) as i64
    }

    /// Substring / membership test used by the `contains` operator.
    ///
    /// Strings test for a substring; bytes test for a contained byte slice.
    /// Other kinds never contain anything.
    pub fn contains_value(&self, needle: &Value) -> bool {
        match (self, needle) {
            (Value::String(haystack), Value::String(sub)) => haystack.contains(sub.as_str()),
            (Value::Bytes(haystack), Value::Bytes(sub)) => haystack
                .windows(sub.len().max(1))
                .any(|w| w == sub.as_slice()),
            _ => false,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        let rank = self.type_rank().cmp(&other.type_rank());
        if rank != Ordering::Equal {
            return rank;
        }
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            // Cross-kind numeric comparison by magnitude; ties break by
            // variant so the order stays consistent with equality.
            (Value::Int(a), Value::Float(b)) => (*a as f64)
                .total_cmp(b)
                .then(Ordering::Less),
            (Value::Float(a), Value::Int(b)) => a
                .total_cmp(&(*b as f64))
                .then(Ordering::Greater),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            _ => unreachable!("equal type ranks cover all pairs"),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_i64(self.stable_hash());
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_type_order() {
        assert!(Value::Null < Value::Bool(false));
        assert!(Value::Bool(true) < Value::Int(i64::MIN));
        assert!(Value::Int(i64::MAX) < Value::String(String::new()));
        assert!(Value::String("zzz".into()) < Value::Bytes(vec![]));
    }

    #[test]
    fn test_numeric_cross_kind_order() {
        assert!(Value::Int(1) < Value::Float(1.5));
        assert!(Value::Float(0.5) < Value::Int(1));
        // Same magnitude: Int sorts before Float, and the two are unequal.
        assert!(Value::Int(2) < Value::Float(2.0));
        assert_ne!(Value::Int(2), Value::Float(2.0));
    }

    #[test]
    fn test_stable_hash_is_content_derived() {
        assert_eq!(
            Value::String("alpha".into()).stable_hash(),
            Value::String("alpha".into()).stable_hash()
        );
        assert_ne!(
            Value::String("alpha".into()).stable_hash(),
            Value::String("beta".into()).stable_hash()
        );
        // Kinds are disambiguated in the hashed bytes.
        assert_ne!(Value::Int(0).stable_hash(), Value::Bool(false).stable_hash());
    }

    #[test]
    fn test_contains() {
        let s = Value::String("hello world".into());
        assert!(s.contains_value(&Value::String("lo wo".into())));
        assert!(!s.contains_value(&Value::String("xyz".into())));
        assert!(!Value::Int(5).contains_value(&Value::Int(5)));
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            any::<f64>().prop_map(Value::Float),
            ".{0,12}".prop_map(Value::String),
            proptest::collection::vec(any::<u8>(), 0..12).prop_map(Value::Bytes),
        ]
    }

    proptest! {
        #[test]
        fn prop_order_is_total_and_consistent(a in arb_value(), b in arb_value()) {
            let ab = a.cmp(&b);
            let ba = b.cmp(&a);
            prop_assert_eq!(ab, ba.reverse());
            prop_assert_eq!(ab == Ordering::Equal, a == b);
        }

        #[test]
        fn prop_equal_values_hash_equal(a in arb_value()) {
            let b = a.clone();
            prop_assert_eq!(a.stable_hash(), b.stable_hash());
        }
    }
}
