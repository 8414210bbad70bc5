//! File-backed block provider.
//!
//! Layout: one append-only `<wal-id>.wal` per writer session inside the
//! storage directory, plus a small fixed `root` file holding the current
//! root pointer. The root is updated write-then-rename so a crash leaves
//! either the old or the new pointer, never a torn one.

use crate::provider::{BlockProvider, ReadStream, WalWriteStream};
use atomdb_core::{AtomPointer, Error, Result, TxnId, WalId, POINTER_ENCODED_LEN};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use uuid::Uuid;

const ROOT_FILE: &str = "root";
const ROOT_TMP_FILE: &str = "root.tmp";
const WAL_EXT: &str = "wal";
const LOCK_EXT: &str = "lock";

/// Block provider over a directory of WAL files.
pub struct FileBlockProvider {
    dir: PathBuf,
    writer: WalId,
    writer_file: Mutex<File>,
    closed: Mutex<bool>,
}

impl FileBlockProvider {
    /// Open (or create) a storage directory and claim a writer WAL.
    ///
    /// Existing WALs are tried first, three attempts each; a WAL whose lock
    /// marker cannot be taken is assumed to belong to another writer. When
    /// nothing can be claimed a fresh WAL is created, one attempt only.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        for wal_id in Self::scan_wals(&dir)? {
            for attempt in 0..3 {
                match Self::try_claim(&dir, wal_id) {
                    Ok(Some(file)) => {
                        return Ok(FileBlockProvider {
                            dir,
                            writer: wal_id,
                            writer_file: Mutex::new(file),
                            closed: Mutex::new(false),
                        });
                    }
                    Ok(None) => break, // held by another writer
                    Err(e) => {
                        tracing::warn!(
                            wal = %wal_id,
                            attempt,
                            error = %e,
                            "retrying writer WAL acquisition"
                        );
                    }
                }
            }
        }

        // Nothing claimable: create a fresh WAL. One attempt; an id clash
        // here means something is badly wrong with the directory.
        let wal_id = WalId::new();
        let path = Self::wal_path(&dir, wal_id);
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(&path)?;
        File::create(Self::lock_path(&dir, wal_id))?;
        tracing::debug!(wal = %wal_id, dir = %dir.display(), "created writer WAL");
        Ok(FileBlockProvider {
            dir,
            writer: wal_id,
            writer_file: Mutex::new(file),
            closed: Mutex::new(false),
        })
    }

    fn wal_path(dir: &Path, wal_id: WalId) -> PathBuf {
        dir.join(format!("{}.{}", wal_id, WAL_EXT))
    }

    fn lock_path(dir: &Path, wal_id: WalId) -> PathBuf {
        dir.join(format!("{}.{}", wal_id, LOCK_EXT))
    }

    fn scan_wals(dir: &Path) -> Result<Vec<WalId>> {
        let mut out = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(WAL_EXT) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                if let Ok(uuid) = Uuid::from_str(stem) {
                    out.push(WalId::from_bytes(*uuid.as_bytes()));
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Try to take the lock marker of an existing WAL.
    fn try_claim(dir: &Path, wal_id: WalId) -> Result<Option<File>> {
        match OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(Self::lock_path(dir, wal_id))
        {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(Self::wal_path(dir, wal_id))?;
        Ok(Some(file))
    }

    fn check_open(&self) -> Result<()> {
        if *self.closed.lock() {
            return Err(Error::validation("block provider is closed"));
        }
        Ok(())
    }

    /// Fsync the directory so renames and creations are durable.
    fn sync_dir(&self) -> Result<()> {
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }
}

struct FileWriteStream {
    file: File,
}

impl WalWriteStream for FileWriteStream {
    fn seek_to(&mut self, position: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(position))?;
        Ok(())
    }

    fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

impl BlockProvider for FileBlockProvider {
    fn get_writer_wal(&self) -> Result<(WalId, u64)> {
        self.check_open()?;
        let len = self.writer_file.lock().metadata()?.len();
        Ok((self.writer, len))
    }

    fn write_streamer(&self) -> Result<Box<dyn WalWriteStream>> {
        self.check_open()?;
        let file = self.writer_file.lock().try_clone()?;
        Ok(Box::new(FileWriteStream { file }))
    }

    fn get_reader(&self, wal_id: WalId, position: u64) -> Result<Box<dyn ReadStream>> {
        self.check_open()?;
        let path = Self::wal_path(&self.dir, wal_id);
        let mut file = File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::corruption(format!("unknown WAL {}", wal_id))
            } else {
                e.into()
            }
        })?;
        file.seek(SeekFrom::Start(position))?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn get_current_root(&self) -> Result<Option<AtomPointer>> {
        self.check_open()?;
        let path = self.dir.join(ROOT_FILE);
        let mut buf = [0u8; POINTER_ENCODED_LEN];
        match File::open(&path) {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
            Ok(mut f) => f.read_exact(&mut buf).map_err(|_| {
                Error::corruption("root file is shorter than an encoded pointer")
            })?,
        }
        Ok(Some(AtomPointer::from_bytes(&buf)?))
    }

    fn update_root(&self, pointer: AtomPointer) -> Result<()> {
        self.check_open()?;
        let tmp = self.dir.join(ROOT_TMP_FILE);
        {
            let mut f = File::create(&tmp)?;
            f.write_all(&pointer.to_bytes())?;
            f.sync_all()?;
        }
        fs::rename(&tmp, self.dir.join(ROOT_FILE))?;
        self.sync_dir()?;
        Ok(())
    }

    fn close_wal(&self, transaction_id: TxnId) -> Result<()> {
        self.check_open()?;
        tracing::debug!(txn = %transaction_id, wal = %self.writer, "WAL durability barrier");
        self.writer_file.lock().sync_all()?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        {
            let mut closed = self.closed.lock();
            if *closed {
                return Ok(());
            }
            *closed = true;
        }
        self.writer_file.lock().sync_all()?;
        let _ = fs::remove_file(Self::lock_path(&self.dir, self.writer));
        Ok(())
    }
}

impl Drop for FileBlockProvider {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use tempfile::tempdir;

    #[test]
    fn test_write_read_round_trip() {
        let dir = tempdir().unwrap();
        let provider = FileBlockProvider::open(dir.path()).unwrap();
        let (wal, base) = provider.get_writer_wal().unwrap();
        assert_eq!(base, 0);

        let mut w = provider.write_streamer().unwrap();
        w.seek_to(0).unwrap();
        w.write_all(b"0123456789").unwrap();
        w.flush().unwrap();

        let mut r = provider.get_reader(wal, 4).unwrap();
        let mut out = String::new();
        r.read_to_string(&mut out).unwrap();
        assert_eq!(out, "456789");
    }

    #[test]
    fn test_root_survives_reopen() {
        let dir = tempdir().unwrap();
        let ptr = {
            let provider = FileBlockProvider::open(dir.path()).unwrap();
            let (wal, _) = provider.get_writer_wal().unwrap();
            let ptr = AtomPointer::new(wal, 7);
            provider.update_root(ptr).unwrap();
            provider.close().unwrap();
            ptr
        };
        let provider = FileBlockProvider::open(dir.path()).unwrap();
        assert_eq!(provider.get_current_root().unwrap(), Some(ptr));
    }

    #[test]
    fn test_reopen_reads_old_wal() {
        let dir = tempdir().unwrap();
        let wal = {
            let provider = FileBlockProvider::open(dir.path()).unwrap();
            let (wal, _) = provider.get_writer_wal().unwrap();
            let mut w = provider.write_streamer().unwrap();
            w.seek_to(0).unwrap();
            w.write_all(b"persisted").unwrap();
            w.flush().unwrap();
            provider.close().unwrap();
            wal
        };
        let provider = FileBlockProvider::open(dir.path()).unwrap();
        let mut r = provider.get_reader(wal, 0).unwrap();
        let mut out = String::new();
        r.read_to_string(&mut out).unwrap();
        assert_eq!(out, "persisted");
    }

    #[test]
    fn test_concurrent_open_claims_distinct_wals() {
        let dir = tempdir().unwrap();
        let first = FileBlockProvider::open(dir.path()).unwrap();
        let second = FileBlockProvider::open(dir.path()).unwrap();
        let (w1, _) = first.get_writer_wal().unwrap();
        let (w2, _) = second.get_writer_wal().unwrap();
        assert_ne!(w1, w2, "two live writers must not share a WAL");
    }

    #[test]
    fn test_unknown_wal_is_corruption() {
        let dir = tempdir().unwrap();
        let provider = FileBlockProvider::open(dir.path()).unwrap();
        assert!(provider.get_reader(WalId::new(), 0).unwrap_err().is_corruption());
    }
}
