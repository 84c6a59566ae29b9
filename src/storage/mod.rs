//! # Storage Layer
//!
//! The file beneath the tree. One file holds everything:
//!
//! ```text
//! +---------------------+  offset 0
//! | Header slot A       |  HEADER_SLOT_SIZE bytes
//! +---------------------+
//! | Header slot B       |  HEADER_SLOT_SIZE bytes
//! +---------------------+  DATA_START
//! | Blocks              |  node images and translation tables,
//! | ...                 |  allocated copy-on-write
//! +---------------------+
//! ```
//!
//! The two header slots alternate by checkpoint parity; opening the file
//! loads whichever valid slot carries the higher checkpoint count, so a
//! torn header write falls back to the previous checkpoint.
//!
//! Blocks are never overwritten in place: every node write allocates a new
//! location and the old one is released (deferred while a checkpoint still
//! references it). The [`block_table`] owns that translation.

pub mod block_table;
pub mod header;

pub use block_table::{BlockLoc, BlockTable};
pub use header::{load_newest_header, write_header_slot, Header};

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};

use crate::config::HEADER_SLOT_SIZE;

/// First byte available to the block allocator.
pub const DATA_START: u64 = 2 * HEADER_SLOT_SIZE;

/// Positioned file I/O for one dictionary file.
pub struct FileStore {
    file: File,
    path: PathBuf,
}

impl FileStore {
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .wrap_err_with(|| format!("creating {}", path.display()))?;
        file.set_len(DATA_START)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("opening {}", path.display()))?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.file
            .read_exact_at(&mut buf, offset)
            .wrap_err_with(|| {
                format!("reading {len} bytes at offset {offset} of {}", self.path.display())
            })?;
        Ok(buf)
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.write_all_at(data, offset).wrap_err_with(|| {
            format!(
                "writing {} bytes at offset {offset} of {}",
                data.len(),
                self.path.display()
            )
        })
    }

    pub fn sync(&self) -> Result<()> {
        self.file
            .sync_all()
            .wrap_err_with(|| format!("fsync of {}", self.path.display()))
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_back_what_was_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.brw");
        let store = FileStore::create(&path).unwrap();

        store.write_at(DATA_START, b"hello blocks").unwrap();
        let data = store.read_at(DATA_START, 12).unwrap();
        assert_eq!(&data, b"hello blocks");

        drop(store);
        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.read_at(DATA_START, 5).unwrap(), b"hello");
        assert!(store.len().unwrap() >= DATA_START + 12);
    }

    #[test]
    fn create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.brw");
        FileStore::create(&path).unwrap();
        assert!(FileStore::create(&path).is_err());
    }
}
