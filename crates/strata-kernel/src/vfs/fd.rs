//! Descriptor table.

use std::collections::HashMap;

use strata_types::{OpenFlags, VfsError, VfsResult};

use super::path;

/// First descriptor handed out; 0-2 are left to stdio.
pub const FIRST_FD: u32 = 3;

/// An open descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenFile {
    pub path: String,
    pub flags: OpenFlags,
    pub cursor: u64,
}

/// Maps descriptor numbers to open files.
#[derive(Debug)]
pub struct FdTable {
    next: u32,
    open: HashMap<u32, OpenFile>,
}

impl Default for FdTable {
    fn default() -> Self {
        Self {
            next: FIRST_FD,
            open: HashMap::new(),
        }
    }
}

impl FdTable {
    pub fn insert(&mut self, path: String, flags: OpenFlags) -> u32 {
        let fd = self.next;
        self.next += 1;
        self.open.insert(
            fd,
            OpenFile {
                path,
                flags,
                cursor: 0,
            },
        );
        fd
    }

    pub fn get(&self, fd: u32) -> VfsResult<&OpenFile> {
        self.open.get(&fd).ok_or_else(|| VfsError::bad_descriptor(fd))
    }

    pub fn get_mut(&mut self, fd: u32) -> VfsResult<&mut OpenFile> {
        self.open.get_mut(&fd).ok_or_else(|| VfsError::bad_descriptor(fd))
    }

    pub fn remove(&mut self, fd: u32) -> VfsResult<OpenFile> {
        self.open.remove(&fd).ok_or_else(|| VfsError::bad_descriptor(fd))
    }

    /// Point descriptors on `from` (or below it) at the renamed location.
    pub fn retarget(&mut self, from: &str, to: &str) {
        for file in self.open.values_mut() {
            if path::is_within(&file.path, from) {
                file.path = path::rebase(&file.path, from, to);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    pub fn clear(&mut self) {
        self.open.clear();
    }
}
