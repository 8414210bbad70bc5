//! User records: attribute maps with a parent chain for shared attributes.

use crate::atom::AtomSource;
use crate::atom_ref::AtomRef;
use atomdb_core::{Error, Result, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// One attribute of a record: an inline scalar or a reference to another
/// atom (a linked record, a collection, a literal).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FieldValue {
    /// Inline scalar.
    Value(Value),
    /// Reference to another atom.
    Ref(AtomRef),
}

impl FieldValue {
    /// The scalar payload, if this field is inline.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            FieldValue::Value(v) => Some(v),
            FieldValue::Ref(_) => None,
        }
    }

    /// The reference, if this field links to another atom.
    pub fn atom_ref(&self) -> Option<&AtomRef> {
        match self {
            FieldValue::Ref(r) => Some(r),
            FieldValue::Value(_) => None,
        }
    }
}

impl From<Value> for FieldValue {
    fn from(v: Value) -> Self {
        FieldValue::Value(v)
    }
}

impl From<AtomRef> for FieldValue {
    fn from(r: AtomRef) -> Self {
        FieldValue::Ref(r)
    }
}

/// One link of a record's parent chain.
///
/// A record may inherit attributes from a chain of class records; lookup
/// walks the chain with first-match-wins semantics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParentLink {
    class: AtomRef,
    parent_link: Option<AtomRef>,
}

impl ParentLink {
    /// Build a link to `class`, chaining to the previous link if any.
    pub fn new(class: AtomRef, parent_link: Option<AtomRef>) -> Self {
        ParentLink { class, parent_link }
    }

    /// The class record supplying attributes at this level.
    pub fn class_ref(&self) -> &AtomRef {
        &self.class
    }

    /// The next link up the chain.
    pub fn parent_ref(&self) -> Option<&AtomRef> {
        self.parent_link.as_ref()
    }

    /// All outgoing references of this link.
    pub fn children(&self) -> Vec<AtomRef> {
        let mut out = vec![self.class.clone()];
        if let Some(p) = &self.parent_link {
            out.push(p.clone());
        }
        out
    }
}

/// A user object: immutable attribute map plus an optional parent chain.
///
/// Setting an attribute returns a new record that shares the object id of
/// the original, so both versions denote the same logical entity in sets
/// and indexes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    object_id: Uuid,
    attributes: BTreeMap<String, FieldValue>,
    parent_link: Option<AtomRef>,
}

impl Record {
    /// A fresh record with no attributes.
    pub fn new() -> Self {
        Record {
            object_id: Uuid::new_v4(),
            attributes: BTreeMap::new(),
            parent_link: None,
        }
    }

    /// The stable identity of this logical record.
    pub fn object_id(&self) -> &Uuid {
        &self.object_id
    }

    fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::validation("attribute name must not be empty"));
        }
        if name.starts_with('_') {
            return Err(Error::validation(format!(
                "attribute name must not start with '_' ({})",
                name
            )));
        }
        Ok(())
    }

    /// Set an attribute, returning the new record version.
    pub fn set(&self, name: &str, value: impl Into<FieldValue>) -> Result<Record> {
        Self::validate_name(name)?;
        let mut attributes = self.attributes.clone();
        attributes.insert(name.to_string(), value.into());
        Ok(Record {
            object_id: self.object_id,
            attributes,
            parent_link: self.parent_link.clone(),
        })
    }

    /// Attribute lookup: own attributes first, then the parent chain.
    pub fn get(&self, name: &str, src: &dyn AtomSource) -> Result<Option<FieldValue>> {
        if let Some(v) = self.attributes.get(name) {
            return Ok(Some(v.clone()));
        }
        let mut link = self.parent_link.clone();
        while let Some(link_ref) = link {
            let atom = link_ref.resolve(src)?;
            let pl = atom.expect_parent_link()?;
            let class_atom = pl.class_ref().resolve(src)?;
            let class = class_atom.expect_record()?;
            if let Some(v) = class.attributes.get(name) {
                return Ok(Some(v.clone()));
            }
            link = pl.parent_ref().cloned();
        }
        Ok(None)
    }

    /// Presence test over own attributes and the parent chain.
    pub fn has(&self, name: &str, src: &dyn AtomSource) -> Result<bool> {
        Ok(self.get(name, src)?.is_some())
    }

    /// Own attributes, in name order.
    pub fn attributes(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.attributes.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Prepend a parent class to the chain, returning the new record.
    pub fn add_parent(&self, class: AtomRef) -> Record {
        let link = ParentLink::new(class, self.parent_link.clone());
        Record {
            object_id: self.object_id,
            attributes: self.attributes.clone(),
            parent_link: Some(AtomRef::new(crate::atom::Atom::ParentLink(link))),
        }
    }

    /// Navigate a dotted attribute path.
    ///
    /// Intermediate segments must resolve to linked records; a missing
    /// segment anywhere yields `None` rather than an error.
    pub fn get_path(&self, path: &[&str], src: &dyn AtomSource) -> Result<Option<FieldValue>> {
        let (first, rest) = match path.split_first() {
            None => return Err(Error::validation("attribute path must not be empty")),
            Some(split) => split,
        };
        let field = match self.get(first, src)? {
            None => return Ok(None),
            Some(f) => f,
        };
        if rest.is_empty() {
            return Ok(Some(field));
        }
        match field {
            FieldValue::Value(_) => Ok(None),
            FieldValue::Ref(r) => {
                let atom = r.resolve(src)?;
                match atom.expect_record() {
                    Ok(record) => record.get_path(rest, src),
                    // A non-record in the middle of a path is simply a miss.
                    Err(_) => Ok(None),
                }
            }
        }
    }

    /// The scalar at a dotted path, treating references and misses as null.
    pub fn value_at_path(&self, path: &[&str], src: &dyn AtomSource) -> Result<Value> {
        Ok(match self.get_path(path, src)? {
            Some(FieldValue::Value(v)) => v,
            _ => Value::Null,
        })
    }

    /// All outgoing references of this record.
    pub fn children(&self) -> Vec<AtomRef> {
        let mut out = Vec::new();
        for v in self.attributes.values() {
            if let FieldValue::Ref(r) = v {
                out.push(r.clone());
            }
        }
        if let Some(p) = &self.parent_link {
            out.push(p.clone());
        }
        out
    }
}

impl Default for Record {
    fn default() -> Self {
        Record::new()
    }
}
