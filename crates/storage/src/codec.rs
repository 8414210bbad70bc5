//! On-disk atom records.
//!
//! Record layout: `length (4 B, unsigned, big-endian) || tag (1 B) ||
//! payload (length - 1 B)`. The payload is version-tagged and checksummed:
//! `format version (1 B) || crc32 of body (4 B, big-endian) || MessagePack
//! body`. A checksum mismatch, an unknown tag or an unknown format version
//! all surface as corruption.

use atomdb_collections::{Atom, AtomTag};
use atomdb_core::{Error, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::Read;

/// Current payload format version.
pub const FORMAT_VERSION: u8 = 1;

/// Bytes of payload overhead ahead of the MessagePack body.
const PAYLOAD_HEADER: usize = 1 + 4;

fn encode_body(atom: &Atom) -> Result<Vec<u8>> {
    let encoded = match atom {
        Atom::RootObject(v) => rmp_serde::to_vec(v),
        Atom::Literal(v) => rmp_serde::to_vec(v),
        Atom::HashDictionary(v) => rmp_serde::to_vec(v),
        Atom::DictionaryItem(v) => rmp_serde::to_vec(v),
        Atom::Dictionary(v) => rmp_serde::to_vec(v),
        Atom::List(v) => rmp_serde::to_vec(v),
        Atom::Set(v) => rmp_serde::to_vec(v),
        Atom::RepeatedKeysDictionary(v) => rmp_serde::to_vec(v),
        Atom::Record(v) => rmp_serde::to_vec(v),
        Atom::ParentLink(v) => rmp_serde::to_vec(v),
    };
    encoded.map_err(|e| Error::unexpected("encode", e.to_string()))
}

fn decode_body(tag: AtomTag, body: &[u8]) -> Result<Atom> {
    fn de<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T> {
        rmp_serde::from_slice(body)
            .map_err(|e| Error::corruption(format!("atom payload decode failed: {}", e)))
    }
    Ok(match tag {
        AtomTag::RootObject => Atom::RootObject(de(body)?),
        AtomTag::Literal => Atom::Literal(de(body)?),
        AtomTag::HashDictionary => Atom::HashDictionary(de(body)?),
        AtomTag::DictionaryItem => Atom::DictionaryItem(de(body)?),
        AtomTag::Dictionary => Atom::Dictionary(de(body)?),
        AtomTag::List => Atom::List(de(body)?),
        AtomTag::Set => Atom::Set(de(body)?),
        AtomTag::RepeatedKeysDictionary => Atom::RepeatedKeysDictionary(de(body)?),
        AtomTag::Record => Atom::Record(de(body)?),
        AtomTag::ParentLink => Atom::ParentLink(de(body)?),
    })
}

/// Serialize an atom into a complete on-disk record.
///
/// Children of the atom must already hold pointers; serialization encodes
/// references as pointers only.
pub fn encode_record(atom: &Atom) -> Result<Vec<u8>> {
    let body = encode_body(atom)?;
    let crc = crc32fast::hash(&body);
    let length = (1 + PAYLOAD_HEADER + body.len()) as u32;
    let mut out = Vec::with_capacity(4 + length as usize);
    out.write_u32::<BigEndian>(length)
        .map_err(|e| Error::unexpected("encode", e.to_string()))?;
    out.push(atom.tag() as u8);
    out.push(FORMAT_VERSION);
    out.write_u32::<BigEndian>(crc)
        .map_err(|e| Error::unexpected("encode", e.to_string()))?;
    out.extend_from_slice(&body);
    Ok(out)
}

/// Read one record from a stream positioned at its length prefix.
pub fn read_record(reader: &mut dyn Read) -> Result<Atom> {
    let length = reader
        .read_u32::<BigEndian>()
        .map_err(|e| Error::corruption(format!("atom record truncated: {}", e)))?;
    if (length as usize) < 1 + PAYLOAD_HEADER {
        return Err(Error::corruption(format!(
            "atom record too short ({} bytes)",
            length
        )));
    }
    let mut record = vec![0u8; length as usize];
    reader
        .read_exact(&mut record)
        .map_err(|e| Error::corruption(format!("atom record truncated: {}", e)))?;

    let tag = AtomTag::from_byte(record[0])?;
    let version = record[1];
    if version != FORMAT_VERSION {
        return Err(Error::corruption(format!(
            "unknown atom format version {}",
            version
        )));
    }
    let stored_crc = (&record[2..6])
        .read_u32::<BigEndian>()
        .map_err(|e| Error::corruption(e.to_string()))?;
    let body = &record[6..];
    let actual_crc = crc32fast::hash(body);
    if stored_crc != actual_crc {
        return Err(Error::corruption(format!(
            "atom checksum mismatch (stored {:#010x}, computed {:#010x})",
            stored_crc, actual_crc
        )));
    }
    decode_body(tag, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use atomdb_collections::{
        AtomRef, Dictionary, HashDictionary, List, Literal, Record, RepeatedKeysDictionary,
        RootObject, Set,
    };
    use atomdb_core::{AtomPointer, Value, WalId};
    use std::io::Cursor;

    fn round_trip(atom: Atom) -> Atom {
        let record = encode_record(&atom).unwrap();
        read_record(&mut Cursor::new(record)).unwrap()
    }

    #[test]
    fn test_literal_round_trip() {
        let atom = round_trip(Atom::Literal(Literal::new("alpha")));
        assert_eq!(atom.expect_literal().unwrap().text(), "alpha");
    }

    #[test]
    fn test_empty_collections_round_trip() {
        assert!(round_trip(Atom::HashDictionary(HashDictionary::new()))
            .expect_hash_dictionary()
            .unwrap()
            .is_empty());
        assert!(round_trip(Atom::Dictionary(Dictionary::new()))
            .expect_dictionary()
            .unwrap()
            .is_empty());
        assert!(round_trip(Atom::List(List::new()))
            .expect_list()
            .unwrap()
            .is_empty());
        assert!(round_trip(Atom::Set(Set::new()))
            .expect_set()
            .unwrap()
            .is_empty());
        assert!(round_trip(Atom::RepeatedKeysDictionary(
            RepeatedKeysDictionary::new()
        ))
        .expect_repeated()
        .unwrap()
        .is_empty());
    }

    #[test]
    fn test_record_round_trip_preserves_fields() {
        let record = Record::new()
            .set("age", Value::Int(30))
            .unwrap()
            .set("country", Value::from("ES"))
            .unwrap();
        let id = *record.object_id();
        let back = round_trip(Atom::Record(record));
        let back = back.expect_record().unwrap();
        assert_eq!(back.object_id(), &id);
        assert_eq!(
            back.get("age", &atomdb_collections::NullSource)
                .unwrap()
                .unwrap()
                .as_value(),
            Some(&Value::Int(30))
        );
    }

    #[test]
    fn test_references_serialize_as_pointers() {
        let child = AtomRef::new(Atom::Literal(Literal::new("child")));
        child
            .set_pointer(AtomPointer::new(WalId::new(), 99))
            .unwrap();
        let root = RootObject::new(child.clone(), child.clone());
        let back = round_trip(Atom::RootObject(root));
        let back = back.expect_root_object().unwrap();
        assert_eq!(back.object_root().pointer(), child.pointer());
        assert!(back.object_root().loaded().is_none(), "deserialized lazily");
    }

    #[test]
    fn test_unsaved_reference_fails_to_encode() {
        let child = AtomRef::new(Atom::Literal(Literal::new("unsaved")));
        let root = RootObject::new(child.clone(), child);
        let err = encode_record(&Atom::RootObject(root)).unwrap_err();
        assert!(matches!(err, Error::Unexpected { .. }));
    }

    #[test]
    fn test_corrupted_body_is_detected() {
        let mut record = encode_record(&Atom::Literal(Literal::new("payload"))).unwrap();
        let last = record.len() - 1;
        record[last] ^= 0xFF;
        let err = read_record(&mut Cursor::new(record)).unwrap_err();
        assert!(err.is_corruption());
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn test_unknown_tag_is_detected() {
        let mut record = encode_record(&Atom::Literal(Literal::new("x"))).unwrap();
        record[4] = 0xEE; // tag byte follows the 4-byte length
        assert!(read_record(&mut Cursor::new(record)).unwrap_err().is_corruption());
    }

    #[test]
    fn test_unknown_version_is_detected() {
        let mut record = encode_record(&Atom::Literal(Literal::new("x"))).unwrap();
        record[5] = 9; // version byte follows the tag
        let err = read_record(&mut Cursor::new(record)).unwrap_err();
        assert!(err.to_string().contains("version"));
    }

    #[test]
    fn test_truncated_record_is_detected() {
        let record = encode_record(&Atom::Literal(Literal::new("truncate-me"))).unwrap();
        let err = read_record(&mut Cursor::new(&record[..record.len() - 3])).unwrap_err();
        assert!(err.is_corruption());
    }
}
