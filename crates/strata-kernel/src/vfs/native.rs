//! Native filesystem backend.
//!
//! Runs every operation straight against a host directory, for stores
//! configured without a container. Paths are jailed under `root`: `..`
//! cannot climb out, and a symlinked parent that resolves elsewhere is
//! refused.

use std::collections::HashMap;
use std::fs::{self, File, FileTimes, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{DirBuilderExt, FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use strata_types::attr::{DEFAULT_DIR_MODE, DEFAULT_FILE_MODE};
use strata_types::{DirEntry, FileAttr, FileType, Op, OpenFlags, Reply, VfsError, VfsResult};

use super::fd::FIRST_FD;
use super::path::{self, ROOT};
use crate::backend::Backend;

#[derive(Debug)]
struct NativeFile {
    path: String,
    file: File,
}

#[derive(Debug)]
struct NativeFds {
    next: u32,
    open: HashMap<u32, NativeFile>,
}

/// Host directory backend.
#[derive(Debug)]
pub struct NativeBackend {
    root: PathBuf,
    fds: Mutex<NativeFds>,
}

impl NativeBackend {
    /// Serve `root`, creating it if needed.
    pub fn new(root: impl Into<PathBuf>) -> VfsResult<Self> {
        let root: PathBuf = root.into();
        fs::create_dir_all(&root)?;
        let root = root.canonicalize()?;
        Ok(Self {
            root,
            fds: Mutex::new(NativeFds {
                next: FIRST_FD,
                open: HashMap::new(),
            }),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Host location of `path`, without following its final component.
    fn host(&self, path: &str) -> VfsResult<(String, PathBuf)> {
        let normalized = path::normalize(path)?;
        let host = self.root.join(normalized.trim_start_matches('/'));
        if let Some(parent) = host.parent().filter(|p| p.exists()) {
            let canonical = parent.canonicalize()?;
            if !canonical.starts_with(&self.root) {
                return Err(VfsError::permission_denied(format!(
                    "{normalized} escapes {}",
                    self.root.display()
                )));
            }
        }
        Ok((normalized, host))
    }

    pub fn read(&self, path: &str) -> VfsResult<Vec<u8>> {
        let (path, host) = self.host(path)?;
        refuse_dir(&path, &host)?;
        fs::read(&host).map_err(|e| io_error(e, &path))
    }

    pub fn read_range(&self, path: &str, start: u64, len: u64) -> VfsResult<Vec<u8>> {
        let (path, host) = self.host(path)?;
        refuse_dir(&path, &host)?;
        let mut file = File::open(&host).map_err(|e| io_error(e, &path))?;
        file.seek(SeekFrom::Start(start))?;
        let mut out = Vec::new();
        file.take(len).read_to_end(&mut out)?;
        Ok(out)
    }

    pub fn write(&self, path: &str, data: &[u8]) -> VfsResult<()> {
        let (path, host) = self.host(path)?;
        refuse_dir(&path, &host)?;
        fs::write(&host, data).map_err(|e| io_error(e, &path))
    }

    pub fn append(&self, path: &str, data: &[u8]) -> VfsResult<()> {
        let (path, host) = self.host(path)?;
        refuse_dir(&path, &host)?;
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .mode(DEFAULT_FILE_MODE)
            .open(&host)
            .map_err(|e| io_error(e, &path))?;
        file.write_all(data)?;
        Ok(())
    }

    pub fn truncate(&self, path: &str, len: u64) -> VfsResult<()> {
        let (path, host) = self.host(path)?;
        refuse_dir(&path, &host)?;
        let file = OpenOptions::new()
            .write(true)
            .open(&host)
            .map_err(|e| io_error(e, &path))?;
        file.set_len(len)?;
        Ok(())
    }

    pub fn unlink(&self, path: &str) -> VfsResult<()> {
        let (path, host) = self.host(path)?;
        let meta = fs::symlink_metadata(&host).map_err(|e| io_error(e, &path))?;
        if meta.is_dir() {
            return Err(VfsError::is_a_directory(path));
        }
        fs::remove_file(&host).map_err(|e| io_error(e, &path))
    }

    pub fn mkdir(&self, path: &str, recursive: bool, mode: Option<u32>) -> VfsResult<()> {
        let (path, host) = self.host(path)?;
        if path == ROOT {
            return if recursive {
                Ok(())
            } else {
                Err(VfsError::already_exists(path))
            };
        }
        fs::DirBuilder::new()
            .recursive(recursive)
            .mode(mode.unwrap_or(DEFAULT_DIR_MODE))
            .create(&host)
            .map_err(|e| io_error(e, &path))
    }

    pub fn rmdir(&self, path: &str, recursive: bool) -> VfsResult<()> {
        let (path, host) = self.host(path)?;
        if path == ROOT {
            return Err(VfsError::permission_denied("cannot remove /"));
        }
        let meta = fs::symlink_metadata(&host).map_err(|e| io_error(e, &path))?;
        if !meta.is_dir() {
            return Err(VfsError::not_a_directory(path));
        }
        let result = if recursive {
            fs::remove_dir_all(&host)
        } else {
            fs::remove_dir(&host)
        };
        result.map_err(|e| io_error(e, &path))
    }

    pub fn readdir(&self, path: &str) -> VfsResult<Vec<DirEntry>> {
        let (path, host) = self.host(path)?;
        let mut entries = Vec::new();
        for entry in fs::read_dir(&host).map_err(|e| io_error(e, &path))? {
            let entry = entry?;
            let kind = kind_of(&entry.file_type()?);
            entries.push(DirEntry::new(entry.file_name().to_string_lossy(), kind));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub fn rename(&self, from: &str, to: &str) -> VfsResult<()> {
        let (from, from_host) = self.host(from)?;
        let (_, to_host) = self.host(to)?;
        fs::rename(&from_host, &to_host).map_err(|e| io_error(e, &from))
    }

    pub fn copy(&self, from: &str, to: &str) -> VfsResult<()> {
        let (from, from_host) = self.host(from)?;
        let (_, to_host) = self.host(to)?;
        refuse_dir(&from, &from_host)?;
        fs::copy(&from_host, &to_host).map_err(|e| io_error(e, &from))?;
        Ok(())
    }

    pub fn link(&self, existing: &str, new: &str) -> VfsResult<()> {
        let (existing, existing_host) = self.host(existing)?;
        let (_, new_host) = self.host(new)?;
        fs::hard_link(&existing_host, &new_host).map_err(|e| io_error(e, &existing))
    }

    pub fn stat(&self, path: &str) -> VfsResult<FileAttr> {
        let (path, host) = self.host(path)?;
        let meta = fs::metadata(&host).map_err(|e| io_error(e, &path))?;
        Ok(attr_of(&meta))
    }

    pub fn lstat(&self, path: &str) -> VfsResult<FileAttr> {
        let (path, host) = self.host(path)?;
        let meta = fs::symlink_metadata(&host).map_err(|e| io_error(e, &path))?;
        Ok(attr_of(&meta))
    }

    pub fn exists(&self, path: &str) -> VfsResult<bool> {
        let (_, host) = self.host(path)?;
        Ok(host.try_exists()?)
    }

    pub fn chmod(&self, path: &str, mode: u32) -> VfsResult<()> {
        let (path, host) = self.host(path)?;
        fs::set_permissions(&host, fs::Permissions::from_mode(mode & 0o7777))
            .map_err(|e| io_error(e, &path))
    }

    pub fn chown(&self, path: &str, uid: u32, gid: u32) -> VfsResult<()> {
        let (path, host) = self.host(path)?;
        std::os::unix::fs::chown(&host, Some(uid), Some(gid)).map_err(|e| io_error(e, &path))
    }

    pub fn utimes(&self, path: &str, atime: u64, mtime: u64) -> VfsResult<()> {
        let (path, host) = self.host(path)?;
        let file = File::open(&host).map_err(|e| io_error(e, &path))?;
        let times = FileTimes::new()
            .set_accessed(system_time(atime))
            .set_modified(system_time(mtime));
        file.set_times(times)?;
        Ok(())
    }

    pub fn symlink(&self, target: &str, path: &str) -> VfsResult<()> {
        let (path, host) = self.host(path)?;
        // Absolute targets are store paths; keep them inside the jail.
        let host_target = if target.starts_with('/') {
            self.root.join(path::normalize(target)?.trim_start_matches('/'))
        } else {
            PathBuf::from(target)
        };
        std::os::unix::fs::symlink(&host_target, &host).map_err(|e| io_error(e, &path))
    }

    pub fn readlink(&self, path: &str) -> VfsResult<String> {
        let (path, host) = self.host(path)?;
        let meta = fs::symlink_metadata(&host).map_err(|e| io_error(e, &path))?;
        if !meta.file_type().is_symlink() {
            return Err(VfsError::NotASymlink(path));
        }
        let target = fs::read_link(&host)?;
        let target = match target.strip_prefix(&self.root) {
            Ok(rel) => format!("/{}", rel.to_string_lossy()),
            Err(_) => target.to_string_lossy().into_owned(),
        };
        Ok(target)
    }

    pub fn open_fd(&self, path: &str, flags: OpenFlags, mode: Option<u32>) -> VfsResult<u32> {
        let (path, host) = self.host(path)?;
        let file = OpenOptions::new()
            .read(flags.read || !flags.write)
            .write(flags.write && !flags.append)
            .append(flags.append)
            .create(flags.create && !flags.exclusive)
            .create_new(flags.exclusive)
            .truncate(flags.truncate)
            .mode(mode.unwrap_or(DEFAULT_FILE_MODE))
            .open(&host)
            .map_err(|e| io_error(e, &path))?;
        if file.metadata()?.is_dir() {
            return Err(VfsError::is_a_directory(path));
        }

        let mut fds = self.fds.lock();
        let fd = fds.next;
        fds.next = fds.next.wrapping_add(1).max(FIRST_FD);
        fds.open.insert(fd, NativeFile { path, file });
        Ok(fd)
    }

    pub fn close(&self, fd: u32) -> VfsResult<()> {
        self.fds
            .lock()
            .open
            .remove(&fd)
            .map(drop)
            .ok_or_else(|| VfsError::bad_descriptor(fd))
    }

    pub fn read_fd(&self, fd: u32, len: u64, position: Option<u64>) -> VfsResult<Vec<u8>> {
        let mut fds = self.fds.lock();
        let open = fds.open.get_mut(&fd).ok_or_else(|| VfsError::bad_descriptor(fd))?;
        match position {
            Some(position) => {
                let available = open.file.metadata()?.len().saturating_sub(position);
                let mut buf = vec![0u8; len.min(available) as usize];
                let mut filled = 0;
                while filled < buf.len() {
                    let n = open.file.read_at(&mut buf[filled..], position + filled as u64)?;
                    if n == 0 {
                        break;
                    }
                    filled += n;
                }
                buf.truncate(filled);
                Ok(buf)
            }
            None => {
                let mut out = Vec::new();
                (&mut open.file).take(len).read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }

    pub fn write_fd(&self, fd: u32, data: &[u8], position: Option<u64>) -> VfsResult<u64> {
        let mut fds = self.fds.lock();
        let open = fds.open.get_mut(&fd).ok_or_else(|| VfsError::bad_descriptor(fd))?;
        match position {
            Some(position) => open.file.write_all_at(data, position),
            None => open.file.write_all(data),
        }
        .map_err(|e| io_error(e, &open.path))?;
        Ok(data.len() as u64)
    }

    pub fn fstat(&self, fd: u32) -> VfsResult<FileAttr> {
        let fds = self.fds.lock();
        let open = fds.open.get(&fd).ok_or_else(|| VfsError::bad_descriptor(fd))?;
        Ok(attr_of(&open.file.metadata()?))
    }

    /// Sync every open descriptor.
    pub fn flush(&self) -> VfsResult<()> {
        for open in self.fds.lock().open.values() {
            open.file.sync_data()?;
        }
        Ok(())
    }

    pub fn open_fds(&self) -> usize {
        self.fds.lock().open.len()
    }
}

impl Backend for NativeBackend {
    fn execute(&self, op: Op) -> VfsResult<Reply> {
        let reply = match op {
            Op::Read { path } => Reply::Bytes(self.read(&path)?),
            Op::ReadRange { path, start, len } => Reply::Bytes(self.read_range(&path, start, len)?),
            Op::Write { path, data } => {
                self.write(&path, &data)?;
                Reply::Unit
            }
            Op::Append { path, data } => {
                self.append(&path, &data)?;
                Reply::Unit
            }
            Op::Truncate { path, len } => {
                self.truncate(&path, len)?;
                Reply::Unit
            }
            Op::Unlink { path } => {
                self.unlink(&path)?;
                Reply::Unit
            }
            Op::Mkdir {
                path,
                recursive,
                mode,
            } => {
                self.mkdir(&path, recursive, mode)?;
                Reply::Unit
            }
            Op::Rmdir { path, recursive } => {
                self.rmdir(&path, recursive)?;
                Reply::Unit
            }
            Op::Readdir { path } => Reply::Entries(self.readdir(&path)?),
            Op::Rename { from, to } => {
                self.rename(&from, &to)?;
                Reply::Unit
            }
            Op::Copy { from, to } => {
                self.copy(&from, &to)?;
                Reply::Unit
            }
            Op::Link { existing, new } => {
                self.link(&existing, &new)?;
                Reply::Unit
            }
            Op::Stat { path } => Reply::Attr(self.stat(&path)?),
            Op::Lstat { path } => Reply::Attr(self.lstat(&path)?),
            Op::Exists { path } => Reply::Bool(self.exists(&path)?),
            Op::Chmod { path, mode } => {
                self.chmod(&path, mode)?;
                Reply::Unit
            }
            Op::Chown { path, uid, gid } => {
                self.chown(&path, uid, gid)?;
                Reply::Unit
            }
            Op::Utimes { path, atime, mtime } => {
                self.utimes(&path, atime, mtime)?;
                Reply::Unit
            }
            Op::Symlink { target, path } => {
                self.symlink(&target, &path)?;
                Reply::Unit
            }
            Op::Readlink { path } => Reply::Path(self.readlink(&path)?),
            Op::Open { path, flags, mode } => Reply::Fd(self.open_fd(&path, flags, mode)?),
            Op::Close { fd } => {
                self.close(fd)?;
                Reply::Unit
            }
            Op::ReadFd { fd, len, position } => Reply::Bytes(self.read_fd(fd, len, position)?),
            Op::WriteFd { fd, data, position } => Reply::Count(self.write_fd(fd, &data, position)?),
            Op::Fstat { fd } => Reply::Attr(self.fstat(fd)?),
            Op::Flush => {
                self.flush()?;
                Reply::Unit
            }
            // Nothing to reclaim on a host directory.
            Op::Compact => Reply::Count(0),
        };
        Ok(reply)
    }

    fn list_paths(&self) -> VfsResult<Vec<String>> {
        let mut out = Vec::new();
        let mut stack = vec![(ROOT.to_string(), self.root.clone())];
        while let Some((dir, host)) = stack.pop() {
            for entry in fs::read_dir(&host)? {
                let entry = entry?;
                let path = path::join(&dir, &entry.file_name().to_string_lossy());
                if entry.file_type()?.is_dir() {
                    stack.push((path.clone(), entry.path()));
                }
                out.push(path);
            }
        }
        out.sort();
        Ok(out)
    }

    fn name(&self) -> &'static str {
        "native"
    }

    fn shutdown(&self) {
        let mut fds = self.fds.lock();
        let closed = fds.open.len();
        fds.open.clear();
        if closed > 0 {
            tracing::debug!(closed, "closed native descriptors on shutdown");
        }
    }
}

fn refuse_dir(path: &str, host: &Path) -> VfsResult<()> {
    match fs::metadata(host) {
        Ok(meta) if meta.is_dir() => Err(VfsError::is_a_directory(path)),
        _ => Ok(()),
    }
}

/// Attach the store path to the common error kinds.
fn io_error(e: io::Error, path: &str) -> VfsError {
    match e.kind() {
        io::ErrorKind::NotFound => VfsError::not_found(path),
        io::ErrorKind::AlreadyExists => VfsError::already_exists(path),
        io::ErrorKind::NotADirectory => VfsError::not_a_directory(path),
        io::ErrorKind::IsADirectory => VfsError::is_a_directory(path),
        io::ErrorKind::DirectoryNotEmpty => VfsError::directory_not_empty(path),
        io::ErrorKind::PermissionDenied => VfsError::permission_denied(path),
        _ => VfsError::Io(e),
    }
}

fn kind_of(file_type: &fs::FileType) -> FileType {
    if file_type.is_dir() {
        FileType::Directory
    } else if file_type.is_symlink() {
        FileType::Symlink
    } else {
        FileType::File
    }
}

fn millis(time: io::Result<SystemTime>) -> u64 {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_millis() as u64)
}

fn system_time(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}

fn attr_of(meta: &fs::Metadata) -> FileAttr {
    FileAttr {
        size: meta.len(),
        kind: kind_of(&meta.file_type()),
        mode: meta.permissions().mode() & 0o7777,
        uid: meta.uid(),
        gid: meta.gid(),
        mtime: millis(meta.modified()),
        atime: millis(meta.accessed()),
        nlink: meta.nlink() as u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::ErrorCode;
    use tempfile::TempDir;

    fn backend(dir: &TempDir) -> NativeBackend {
        NativeBackend::new(dir.path().join("root")).unwrap()
    }

    #[test]
    fn test_file_roundtrip_through_execute() {
        let dir = TempDir::new().unwrap();
        let native = backend(&dir);

        native.execute(Op::mkdir("/docs", false)).unwrap();
        native.execute(Op::write("/docs/a.txt", b"hello".to_vec())).unwrap();
        let bytes = native.execute(Op::read("/docs/a.txt")).unwrap().into_bytes().unwrap();
        assert_eq!(bytes, b"hello");

        let entries = native.execute(Op::readdir("/docs")).unwrap().into_entries().unwrap();
        assert_eq!(entries, vec![DirEntry::new("a.txt", FileType::File)]);

        let attr = native.execute(Op::stat("/docs/a.txt")).unwrap().into_attr().unwrap();
        assert_eq!(attr.size, 5);
        assert!(attr.is_file());
    }

    #[test]
    fn test_dotdot_stays_inside_root() {
        let dir = TempDir::new().unwrap();
        let native = backend(&dir);
        native.write("/../../escape.txt", b"x").unwrap();
        assert!(native.root().join("escape.txt").exists());
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[test]
    fn test_errors_carry_codes_and_paths() {
        let dir = TempDir::new().unwrap();
        let native = backend(&dir);

        let err = native.read("/missing").unwrap_err();
        assert_eq!(err.code(), ErrorCode::Enoent);
        assert_eq!(err.detail(), "/missing");

        native.mkdir("/d", false, None).unwrap();
        assert_eq!(native.read("/d").unwrap_err().code(), ErrorCode::Eisdir);
        assert_eq!(native.unlink("/d").unwrap_err().code(), ErrorCode::Eisdir);
        native.write("/d/f", b"1").unwrap();
        assert_eq!(native.rmdir("/d", false).unwrap_err().code(), ErrorCode::Enotempty);
        native.rmdir("/d", true).unwrap();
        assert!(!native.exists("/d").unwrap());
    }

    #[test]
    fn test_symlinks_map_absolute_targets_into_root() {
        let dir = TempDir::new().unwrap();
        let native = backend(&dir);
        native.write("/target.txt", b"t").unwrap();
        native.symlink("/target.txt", "/link").unwrap();

        assert_eq!(native.readlink("/link").unwrap(), "/target.txt");
        assert_eq!(native.read("/link").unwrap(), b"t");
        assert!(native.lstat("/link").unwrap().is_symlink());
        assert_eq!(native.readlink("/target.txt").unwrap_err().code(), ErrorCode::Einval);
    }

    #[test]
    fn test_descriptors() {
        let dir = TempDir::new().unwrap();
        let native = backend(&dir);

        let fd = native.open_fd("/f", OpenFlags::create_truncate(), None).unwrap();
        assert_eq!(fd, FIRST_FD);
        assert_eq!(native.write_fd(fd, b"abcdef", None).unwrap(), 6);
        native.write_fd(fd, b"Z", Some(0)).unwrap();
        assert_eq!(native.fstat(fd).unwrap().size, 6);
        native.close(fd).unwrap();
        assert_eq!(native.close(fd).unwrap_err().code(), ErrorCode::Ebadf);

        let fd = native.open_fd("/f", OpenFlags::read(), None).unwrap();
        assert_eq!(native.read_fd(fd, 3, None).unwrap(), b"Zbc");
        assert_eq!(native.read_fd(fd, 10, Some(4)).unwrap(), b"ef");
        assert_eq!(native.read_fd(fd, 10, None).unwrap(), b"def");
        native.shutdown();
        assert_eq!(native.open_fds(), 0);
    }

    #[test]
    fn test_list_paths_walks_tree() {
        let dir = TempDir::new().unwrap();
        let native = backend(&dir);
        native.mkdir("/a/b", true, None).unwrap();
        native.write("/a/b/c", b"").unwrap();
        native.write("/z", b"").unwrap();
        assert_eq!(native.list_paths().unwrap(), vec!["/a", "/a/b", "/a/b/c", "/z"]);
    }

    #[test]
    fn test_metadata_ops() {
        let dir = TempDir::new().unwrap();
        let native = backend(&dir);
        native.write("/m", b"").unwrap();
        native.chmod("/m", 0o600).unwrap();
        native.utimes("/m", 1_000, 2_000).unwrap();
        let attr = native.stat("/m").unwrap();
        assert_eq!(attr.mode, 0o600);
        assert_eq!(attr.mtime, 2_000);
    }
}
