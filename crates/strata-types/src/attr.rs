//! File attribute types.
//!
//! Times are milliseconds since the Unix epoch, matching what the container
//! index persists.

use serde::{Deserialize, Serialize};

/// Default mode for regular files.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Default mode for directories.
pub const DEFAULT_DIR_MODE: u32 = 0o755;

/// File type enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link.
    Symlink,
}

impl FileType {
    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, FileType::File)
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }

    /// Returns true if this is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        matches!(self, FileType::Symlink)
    }

    /// Type bits OR-ed into `mode` by `stat`.
    pub fn mode_bits(&self) -> u32 {
        match self {
            FileType::File => 0o100000,
            FileType::Directory => 0o040000,
            FileType::Symlink => 0o120000,
        }
    }
}

/// File attributes (metadata).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttr {
    /// Size in bytes.
    pub size: u64,
    /// File type.
    pub kind: FileType,
    /// Permission bits (e.g., 0o644). Stored, never enforced.
    pub mode: u32,
    /// Owner user ID.
    pub uid: u32,
    /// Owner group ID.
    pub gid: u32,
    /// Last modification time (ms since epoch).
    pub mtime: u64,
    /// Last access time (ms since epoch).
    pub atime: u64,
    /// Number of hard links.
    pub nlink: u32,
}

impl FileAttr {
    /// Returns true if this is a regular file.
    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    /// Returns true if this is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// Returns true if this is a symbolic link.
    pub fn is_symlink(&self) -> bool {
        self.kind.is_symlink()
    }

    /// `mode` with the file type bits set, as `stat(2)` reports it.
    pub fn st_mode(&self) -> u32 {
        self.kind.mode_bits() | (self.mode & 0o7777)
    }
}

/// Directory entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name (not full path).
    pub name: String,
    /// Entry type.
    pub kind: FileType,
}

impl DirEntry {
    /// Create a new directory entry.
    pub fn new(name: impl Into<String>, kind: FileType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Open file flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenFlags {
    /// Read access requested.
    pub read: bool,
    /// Write access requested.
    pub write: bool,
    /// Append mode.
    pub append: bool,
    /// Create if not exists.
    pub create: bool,
    /// Truncate on open.
    pub truncate: bool,
    /// Exclusive create (fail if exists).
    pub exclusive: bool,
}

impl Default for OpenFlags {
    fn default() -> Self {
        Self {
            read: true,
            write: false,
            append: false,
            create: false,
            truncate: false,
            exclusive: false,
        }
    }
}

impl OpenFlags {
    /// Read-only access.
    pub fn read() -> Self {
        Self::default()
    }

    /// Write access (also enables read).
    pub fn write() -> Self {
        Self {
            write: true,
            ..Default::default()
        }
    }

    /// Create and truncate (`"w"`).
    pub fn create_truncate() -> Self {
        Self {
            write: true,
            create: true,
            truncate: true,
            ..Default::default()
        }
    }

    /// Create and append (`"a"`).
    pub fn append() -> Self {
        Self {
            write: true,
            create: true,
            append: true,
            ..Default::default()
        }
    }

    /// Create exclusively (`"wx"`).
    pub fn create_exclusive() -> Self {
        Self {
            write: true,
            create: true,
            exclusive: true,
            ..Default::default()
        }
    }

    /// Parse a Node-style flag string (`r`, `r+`, `w`, `w+`, `wx`, `a`, `a+`, `ax`).
    pub fn parse(flags: &str) -> Option<Self> {
        let base: String = flags.chars().filter(|c| *c != 'x' && *c != 's').collect();
        let mut parsed = match base.as_str() {
            "r" => Self::read(),
            "r+" => Self::write(),
            "w" | "w+" => Self::create_truncate(),
            "a" | "a+" => Self::append(),
            _ => return None,
        };
        if flags.contains('x') {
            if !parsed.create {
                return None;
            }
            parsed.exclusive = true;
        }
        Some(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_st_mode_includes_type_bits() {
        let attr = FileAttr {
            size: 0,
            kind: FileType::Directory,
            mode: 0o755,
            uid: 0,
            gid: 0,
            mtime: 0,
            atime: 0,
            nlink: 2,
        };
        assert_eq!(attr.st_mode(), 0o040755);
        assert!(attr.is_dir());
    }

    #[test]
    fn test_open_flag_strings() {
        assert_eq!(OpenFlags::parse("r"), Some(OpenFlags::read()));
        assert!(OpenFlags::parse("w").unwrap().truncate);
        assert!(OpenFlags::parse("a+").unwrap().append);
        let wx = OpenFlags::parse("wx").unwrap();
        assert!(wx.exclusive && wx.create);
        assert!(OpenFlags::parse("ax+").unwrap().exclusive);
        assert_eq!(OpenFlags::parse("rx"), None);
        assert_eq!(OpenFlags::parse("q"), None);
    }
}
