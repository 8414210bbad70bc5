//! Durable identifiers: WAL ids, transaction ids and atom pointers.
//!
//! An [`AtomPointer`] is the durable address of a serialized atom: the id of
//! the WAL that holds it plus the byte offset of its record. The pair is
//! globally unique across the storage lifetime and never reassigned.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Wire size of an encoded pointer: 16-byte WAL id followed by an 8-byte
/// big-endian offset.
pub const POINTER_ENCODED_LEN: usize = 24;

/// Identifier of a WAL file (128-bit).
///
/// Atom pointers carry the id of the WAL their record was flushed into, so
/// resolution is a direct lookup of the WAL by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WalId(Uuid);

impl WalId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        WalId(Uuid::new_v4())
    }

    /// View the id as raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }

    /// Reconstruct an id from raw bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        WalId(Uuid::from_bytes(bytes))
    }
}

impl Default for WalId {
    fn default() -> Self {
        WalId::new()
    }
}

impl fmt::Display for WalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a write transaction (128-bit).
///
/// Every write transaction assigns itself a fresh id at start; the id is
/// used for commit bookkeeping and durability barriers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnId(Uuid);

impl TxnId {
    /// Generate a fresh random id.
    pub fn new() -> Self {
        TxnId(Uuid::new_v4())
    }
}

impl Default for TxnId {
    fn default() -> Self {
        TxnId::new()
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Durable reference to a serialized atom.
///
/// Immutable once assigned. `(transaction_id, offset)` uniquely identifies
/// the record across the whole storage lifetime; `transaction_id` names the
/// WAL the record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AtomPointer {
    /// Id of the WAL holding the record.
    pub transaction_id: WalId,
    /// Byte offset of the record within the WAL.
    pub offset: u64,
}

impl AtomPointer {
    /// Build a pointer from its parts.
    pub fn new(transaction_id: WalId, offset: u64) -> Self {
        AtomPointer {
            transaction_id,
            offset,
        }
    }

    /// Encode as the fixed 24-byte wire form.
    pub fn to_bytes(&self) -> [u8; POINTER_ENCODED_LEN] {
        let mut out = [0u8; POINTER_ENCODED_LEN];
        out[..16].copy_from_slice(self.transaction_id.as_bytes());
        out[16..].copy_from_slice(&self.offset.to_be_bytes());
        out
    }

    /// Decode from the fixed 24-byte wire form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != POINTER_ENCODED_LEN {
            return Err(Error::corruption(format!(
                "atom pointer must be {} bytes, got {}",
                POINTER_ENCODED_LEN,
                bytes.len()
            )));
        }
        let mut wal = [0u8; 16];
        wal.copy_from_slice(&bytes[..16]);
        let mut off = [0u8; 8];
        off.copy_from_slice(&bytes[16..]);
        Ok(AtomPointer {
            transaction_id: WalId::from_bytes(wal),
            offset: u64::from_be_bytes(off),
        })
    }
}

impl fmt::Display for AtomPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.transaction_id, self.offset)
    }
}
