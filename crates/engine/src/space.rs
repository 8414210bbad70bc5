//! Object spaces and named databases.

use crate::transaction::ObjectTransaction;
use atomdb_core::{Error, Result};
use atomdb_storage::{FileBlockProvider, MemoryBlockProvider, SharedStorage};
use std::path::Path;
use std::sync::Arc;

/// The current use instance of a storage: a namespace of databases.
///
/// Database names are keys of the storage root catalog; each maps to the
/// database's own catalog of named collection roots.
#[derive(Clone, Debug)]
pub struct ObjectSpace {
    storage: Arc<SharedStorage>,
}

impl ObjectSpace {
    /// Wrap an already opened storage.
    pub fn new(storage: Arc<SharedStorage>) -> Self {
        ObjectSpace { storage }
    }

    /// Open a file-backed space at `path`.
    ///
    /// With `create_if_missing` unset, a directory that was never published
    /// to (no root) is rejected instead of silently initialized.
    pub fn open_path(path: impl AsRef<Path>, create_if_missing: bool) -> Result<Self> {
        let path = path.as_ref();
        if !create_if_missing {
            let initialized = path.join("root").exists();
            if !initialized {
                return Err(Error::validation(format!(
                    "no database at {} and create_if_missing is false",
                    path.display()
                )));
            }
        }
        let provider = Arc::new(FileBlockProvider::open(path)?);
        Ok(ObjectSpace {
            storage: SharedStorage::open(provider)?,
        })
    }

    /// Open an ephemeral in-memory space.
    pub fn in_memory() -> Result<Self> {
        let provider = Arc::new(MemoryBlockProvider::new());
        Ok(ObjectSpace {
            storage: SharedStorage::open(provider)?,
        })
    }

    /// The underlying storage.
    pub fn storage(&self) -> &Arc<SharedStorage> {
        &self.storage
    }

    /// Handle to a database, creating nothing until a commit references it.
    pub fn new_database(&self, name: impl Into<String>) -> Result<Database> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::validation("database name must not be empty"));
        }
        Ok(Database {
            storage: self.storage.clone(),
            name,
        })
    }

    /// Open an existing database by name.
    ///
    /// Currently equivalent to [`ObjectSpace::new_database`]; the database
    /// materializes in the root catalog on its first committed write.
    pub fn open_database(&self, name: impl Into<String>) -> Result<Database> {
        self.new_database(name)
    }

    /// Names of databases present in the current root catalog.
    pub fn databases(&self) -> Result<Vec<String>> {
        let root = match self.storage.read_current_root()? {
            None => return Ok(Vec::new()),
            Some((_, root)) => root,
        };
        let src = self.storage.as_ref();
        let catalog_atom = root.object_root().resolve(src)?;
        let catalog = catalog_atom.expect_dictionary()?;
        let mut names = Vec::new();
        for (key, _) in catalog.entries(src)? {
            names.push(key);
        }
        names.sort();
        Ok(names)
    }

    /// Flush buffered WAL data; called periodically by long-lived hosts.
    pub fn flush(&self) -> Result<()> {
        self.storage.flush_wal()
    }

    /// Close the space, flushing everything.
    pub fn close(&self) -> Result<()> {
        self.storage.close()
    }
}

/// A named database inside an object space.
#[derive(Clone, Debug)]
pub struct Database {
    storage: Arc<SharedStorage>,
    name: String,
}

impl Database {
    /// The database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying storage.
    pub fn storage(&self) -> &Arc<SharedStorage> {
        &self.storage
    }

    /// Start a transaction over the current root snapshot.
    pub fn new_transaction(&self) -> Result<ObjectTransaction> {
        ObjectTransaction::begin(self.storage.clone(), self.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_space_lists_no_databases() {
        let space = ObjectSpace::in_memory().unwrap();
        assert!(space.databases().unwrap().is_empty());
    }

    #[test]
    fn test_database_name_validation() {
        let space = ObjectSpace::in_memory().unwrap();
        assert!(space.new_database("").unwrap_err().is_validation());
        assert_eq!(space.new_database("orders").unwrap().name(), "orders");
    }

    #[test]
    fn test_open_path_requires_existing_root() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        assert!(ObjectSpace::open_path(&missing, false).unwrap_err().is_validation());
        let space = ObjectSpace::open_path(&missing, true).unwrap();
        space.close().unwrap();
    }
}
