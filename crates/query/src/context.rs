//! Execution context and the row type flowing through plans.

use crate::expr::FieldPath;
use atomdb_collections::atom_ref::RefIdentity;
use atomdb_collections::{Atom, AtomRef, AtomSource, FieldValue, SourceHandle};
use atomdb_core::{CancellationToken, Result, Value};
use atomdb_executor::ParallelConfig;

/// Everything a plan needs to execute: an atom source for resolution, a
/// cancellation token with optional deadline, and the parallel scan
/// configuration when full scans may fan out.
#[derive(Clone)]
pub struct QueryContext {
    source: SourceHandle,
    token: CancellationToken,
    parallel: Option<ParallelConfig>,
}

impl QueryContext {
    /// Context over a source with no deadline and sequential scans.
    pub fn new(source: SourceHandle) -> Self {
        QueryContext {
            source,
            token: CancellationToken::new(),
            parallel: None,
        }
    }

    /// Replace the cancellation token.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    /// Allow full scans to use the parallel pool.
    pub fn with_parallel(mut self, config: ParallelConfig) -> Self {
        self.parallel = Some(config);
        self
    }

    /// The atom source.
    pub fn source(&self) -> &SourceHandle {
        &self.source
    }

    /// The cancellation token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Parallel scan configuration, if enabled.
    pub fn parallel(&self) -> Option<&ParallelConfig> {
        self.parallel.as_ref()
    }
}

/// One record flowing through a plan: a reference to an atom, normally a
/// [`atomdb_collections::Record`].
#[derive(Debug, Clone)]
pub struct Row {
    inner: AtomRef,
}

impl Row {
    /// Wrap an atom reference.
    pub fn new(inner: AtomRef) -> Self {
        Row { inner }
    }

    /// Wrap a fresh record.
    pub fn from_record(record: atomdb_collections::Record) -> Self {
        Row {
            inner: AtomRef::new(Atom::Record(record)),
        }
    }

    /// The underlying reference.
    pub fn atom_ref(&self) -> &AtomRef {
        &self.inner
    }

    /// Identity for deduplication and visited sets: the atom pointer when
    /// persisted, the reference address otherwise.
    pub fn identity(&self) -> RefIdentity {
        self.inner.identity()
    }

    /// The attribute at `path` (alias stripped), or `None`.
    ///
    /// Rows that are not records have no attributes.
    pub fn field(&self, path: &FieldPath, src: &dyn AtomSource) -> Result<Option<FieldValue>> {
        let atom = self.inner.resolve(src)?;
        let record = match &*atom {
            Atom::Record(r) => r,
            _ => return Ok(None),
        };
        let segments: Vec<&str> = path.segments().iter().map(|s| s.as_str()).collect();
        record.get_path(&segments, src)
    }

    /// The scalar at `path`, treating references and misses as null.
    pub fn value(&self, path: &FieldPath, src: &dyn AtomSource) -> Result<Value> {
        Ok(match self.field(path, src)? {
            Some(FieldValue::Value(v)) => v,
            _ => Value::Null,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use atomdb_collections::{NullSource, Record};
    use std::sync::Arc;

    #[test]
    fn test_row_field_access() {
        let rec = Record::new().set("age", Value::Int(21)).unwrap();
        let row = Row::from_record(rec);
        let path = FieldPath::parse("r.age").unwrap();
        assert_eq!(row.value(&path, &NullSource).unwrap(), Value::Int(21));
        let missing = FieldPath::parse("r.name").unwrap();
        assert_eq!(row.value(&missing, &NullSource).unwrap(), Value::Null);
    }

    #[test]
    fn test_non_record_row_is_null() {
        let row = Row::new(AtomRef::new(Atom::Literal(
            atomdb_collections::Literal::new("x"),
        )));
        let path = FieldPath::parse("r.any").unwrap();
        assert_eq!(row.value(&path, &NullSource).unwrap(), Value::Null);
    }

    #[test]
    fn test_context_builders() {
        let ctx = QueryContext::new(Arc::new(NullSource))
            .with_parallel(ParallelConfig::for_testing(2));
        assert!(ctx.parallel().is_some());
        assert!(!ctx.token().is_cancelled());
    }
}
