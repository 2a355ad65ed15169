//! The `FileSystem` capability: the narrow set of file operations the rest
//! of the engine needs, behind a trait so tests can swap in
//! [`mem::InMemoryFileSystem`] instead of touching disk.

pub mod mem;
pub mod real;

use crate::error::FsError;
use crate::fileid::FileId;
use camino::{Utf8Path, Utf8PathBuf};
use std::io::{Read, Write};

/// A point in time at one-second granularity, matching the resolution most
/// filesystems actually report for `mtime`. Fingerprint race-window logic
/// (`racily_clean`) depends on this granularity being coarse.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub const EPOCH: Timestamp = Timestamp(0);

    pub fn succ(self) -> Timestamp {
        Timestamp(self.0 + 1)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum FileKind {
    Regular,
    Directory,
    Symlink,
}

/// Just enough of `stat(2)` to test dir/symlink/regular kind, detect size
/// and mtime changes, and derive a [`FileId`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Stat {
    pub kind: FileKind,
    pub size: u64,
    pub mode: u32,
    pub mtime: Timestamp,
    pub ino: u64,
    pub dev: u64,
}

impl Stat {
    pub fn file_id(&self) -> FileId {
        FileId::new(self.ino, self.dev)
    }
}

pub trait FileSystem: Send + Sync {
    /// The engine's notion of "now", used to decide `racily_clean`. Real
    /// filesystems read the wall clock; the in-memory filesystem lets tests
    /// control it explicitly.
    fn now(&self) -> Timestamp;

    /// `stat(2)`: follows symlinks. `Ok(None)` means the path does not
    /// exist (`ENOENT`); any other errno is a genuine [`FsError`].
    fn stat(&self, path: &Utf8Path) -> Result<Option<Stat>, FsError>;

    /// `lstat(2)`: does not follow a trailing symlink.
    fn lstat(&self, path: &Utf8Path) -> Result<Option<Stat>, FsError>;

    fn read_file(&self, path: &Utf8Path) -> Result<Vec<u8>, FsError>;

    /// Sorted list of entry names (not full paths), for directory hashing
    /// and response-file directory creation.
    fn read_dir(&self, path: &Utf8Path) -> Result<Vec<String>, FsError>;

    fn read_link(&self, path: &Utf8Path) -> Result<String, FsError>;

    fn write_file(&self, path: &Utf8Path, contents: &[u8]) -> Result<(), FsError>;

    /// Single-level `mkdir`; the caller composes this into `mkdirs` below.
    fn create_dir(&self, path: &Utf8Path) -> Result<(), FsError>;

    /// `rmdir`; succeeds only if the directory is empty. Implementations
    /// should translate `ENOTEMPTY`/`EEXIST` into `Ok(false)` rather than an
    /// error, since callers use this to opportunistically prune now-empty
    /// ancestor directories.
    fn remove_dir_if_empty(&self, path: &Utf8Path) -> Result<bool, FsError>;

    fn remove_file(&self, path: &Utf8Path) -> Result<(), FsError>;

    fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), FsError>;

    /// Creates a uniquely-named, initially-empty file in `dir` and returns
    /// its path, analogous to POSIX `mkstemp`.
    fn mkstemp(&self, dir: &Utf8Path, prefix: &str) -> Result<Utf8PathBuf, FsError>;

    fn open_append(&self, path: &Utf8Path) -> Result<Box<dyn Write + Send>, FsError>;

    fn open_read(&self, path: &Utf8Path) -> Result<Box<dyn Read + Send>, FsError>;
}

/// Recursively creates `path` and every missing ancestor, invoking
/// `on_created` (in root-to-leaf order) for each directory actually created
/// — callers use this to log `createdDirectory` records.
pub fn mkdirs(
    fs: &dyn FileSystem,
    path: &Utf8Path,
    mut on_created: impl FnMut(&Utf8Path) -> Result<(), FsError>,
) -> Result<(), FsError> {
    let mut to_create = Vec::new();
    let mut cur = Some(path);
    while let Some(p) = cur {
        if p.as_str().is_empty() || p.as_str() == "/" {
            break;
        }
        match fs.stat(p)? {
            Some(stat) if stat.kind == FileKind::Directory => break,
            Some(_) => {
                return Err(FsError::new(
                    p.to_path_buf(),
                    std::io::Error::new(
                        std::io::ErrorKind::AlreadyExists,
                        "exists and is not a directory",
                    ),
                ));
            }
            None => to_create.push(p.to_path_buf()),
        }
        cur = p.parent();
    }

    for dir in to_create.into_iter().rev() {
        match fs.create_dir(&dir) {
            Ok(()) => on_created(&dir)?,
            Err(e) if e.source.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
