//! The container file.
//!
//! Layout: `[u32 LE index length][index bytes][file byte ranges...]`.
//! This type only moves bytes; where they go is decided by the index and
//! the compactor.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use strata_types::{VfsError, VfsResult};

/// Size of the length prefix in front of the index.
pub const HEADER_LEN: u64 = 4;

/// Byte-level access to the single persistent container file.
#[derive(Debug)]
pub struct BinaryStore {
    file: File,
    path: PathBuf,
    len: u64,
}

impl BinaryStore {
    /// Open the container, creating it (and its parent directory) if absent.
    pub fn open(path: &Path) -> VfsResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            len,
        })
    }

    /// Path of the container on the host.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current end of the container.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True if nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read the serialized index.
    ///
    /// Returns `None` when the header is missing or claims more bytes than
    /// the container holds; the caller treats that as a cold start.
    pub fn read_index(&mut self) -> VfsResult<Option<Vec<u8>>> {
        if self.len < HEADER_LEN {
            return Ok(None);
        }
        let mut prefix = [0u8; 4];
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_exact(&mut prefix)?;
        let index_len = u64::from(u32::from_le_bytes(prefix));
        if HEADER_LEN + index_len > self.len {
            return Ok(None);
        }
        let mut bytes = vec![0u8; index_len as usize];
        self.file.read_exact(&mut bytes)?;
        Ok(Some(bytes))
    }

    /// Write the length prefix and index at the start of the container.
    pub fn write_index(&mut self, index: &[u8]) -> VfsResult<()> {
        let index_len = u32::try_from(index.len())
            .map_err(|_| VfsError::invalid_argument("index exceeds 4 GiB"))?;
        let mut buf = Vec::with_capacity(index.len() + HEADER_LEN as usize);
        buf.extend_from_slice(&index_len.to_le_bytes());
        buf.extend_from_slice(index);
        self.write_at(0, &buf)
    }

    /// Read `len` bytes at `offset`.
    pub fn read_at(&mut self, offset: u64, len: u64) -> VfsResult<Vec<u8>> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| VfsError::corruption(format!("range {offset}+{len} overflows")))?;
        if end > self.len {
            return Err(VfsError::corruption(format!(
                "range {offset}..{end} past container end {}",
                self.len
            )));
        }
        let mut buf = vec![0u8; len as usize];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Overwrite bytes at `offset`, growing the container if needed.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> VfsResult<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.len = self.len.max(offset + data.len() as u64);
        Ok(())
    }

    /// Append bytes at the current end, returning their offset.
    pub fn append(&mut self, data: &[u8]) -> VfsResult<u64> {
        let offset = self.len;
        self.write_at(offset, data)?;
        Ok(offset)
    }

    /// Truncate or extend the container.
    pub fn set_len(&mut self, len: u64) -> VfsResult<()> {
        self.file.set_len(len)?;
        self.len = len;
        Ok(())
    }

    /// Flush file data to the host.
    pub fn sync(&mut self) -> VfsResult<()> {
        self.file.sync_data()?;
        Ok(())
    }
}
