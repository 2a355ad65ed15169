//! The real, disk-backed [`FileSystem`] implementation.

use super::{FileKind, FileSystem, Stat, Timestamp};
use crate::error::FsError;
use camino::{Utf8Path, Utf8PathBuf};
use std::ffi::CString;
use std::fs;
use std::io::{Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Default, Clone, Copy)]
pub struct RealFileSystem;

impl RealFileSystem {
    pub fn new() -> Self {
        RealFileSystem
    }
}

fn to_stat(meta: &fs::Metadata) -> Stat {
    use std::os::unix::fs::FileTypeExt;
    let kind = if meta.is_dir() {
        FileKind::Directory
    } else if meta.file_type().is_symlink() {
        FileKind::Symlink
    } else {
        FileKind::Regular
    };
    Stat {
        kind,
        size: meta.size(),
        mode: meta.mode(),
        mtime: Timestamp(meta.mtime()),
        ino: meta.ino(),
        dev: meta.dev(),
    }
}

fn stat_result(path: &Utf8Path, r: std::io::Result<fs::Metadata>) -> Result<Option<Stat>, FsError> {
    match r {
        Ok(meta) => Ok(Some(to_stat(&meta))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(FsError::new(path.to_path_buf(), e)),
    }
}

impl FileSystem for RealFileSystem {
    fn now(&self) -> Timestamp {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Timestamp(secs as i64)
    }

    fn stat(&self, path: &Utf8Path) -> Result<Option<Stat>, FsError> {
        stat_result(path, fs::metadata(path))
    }

    fn lstat(&self, path: &Utf8Path) -> Result<Option<Stat>, FsError> {
        stat_result(path, fs::symlink_metadata(path))
    }

    fn read_file(&self, path: &Utf8Path) -> Result<Vec<u8>, FsError> {
        fs::read(path).map_err(|e| FsError::new(path.to_path_buf(), e))
    }

    fn read_dir(&self, path: &Utf8Path) -> Result<Vec<String>, FsError> {
        let mut names: Vec<String> = fs::read_dir(path)
            .map_err(|e| FsError::new(path.to_path_buf(), e))?
            .map(|entry| {
                entry
                    .map_err(|e| FsError::new(path.to_path_buf(), e))
                    .map(|e| e.file_name().to_string_lossy().into_owned())
            })
            .collect::<Result<_, _>>()?;
        names.sort();
        Ok(names)
    }

    fn read_link(&self, path: &Utf8Path) -> Result<String, FsError> {
        fs::read_link(path)
            .map_err(|e| FsError::new(path.to_path_buf(), e))
            .map(|p| p.to_string_lossy().into_owned())
    }

    fn write_file(&self, path: &Utf8Path, contents: &[u8]) -> Result<(), FsError> {
        fs::write(path, contents).map_err(|e| FsError::new(path.to_path_buf(), e))
    }

    fn create_dir(&self, path: &Utf8Path) -> Result<(), FsError> {
        fs::create_dir(path).map_err(|e| FsError::new(path.to_path_buf(), e))
    }

    fn remove_dir_if_empty(&self, path: &Utf8Path) -> Result<bool, FsError> {
        match fs::remove_dir(path) {
            Ok(()) => Ok(true),
            Err(e)
                if matches!(
                    e.raw_os_error(),
                    Some(libc::ENOTEMPTY) | Some(libc::EEXIST)
                ) =>
            {
                Ok(false)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(FsError::new(path.to_path_buf(), e)),
        }
    }

    fn remove_file(&self, path: &Utf8Path) -> Result<(), FsError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FsError::new(path.to_path_buf(), e)),
        }
    }

    fn rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), FsError> {
        fs::rename(from, to).map_err(|e| FsError::new(from.to_path_buf(), e))
    }

    fn mkstemp(&self, dir: &Utf8Path, prefix: &str) -> Result<Utf8PathBuf, FsError> {
        let template_str = format!("{dir}/{prefix}XXXXXX");
        let mut template = CString::new(template_str.as_bytes())
            .map_err(|e| {
                FsError::new(
                    dir.to_path_buf(),
                    std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
                )
            })?
            .into_bytes_with_nul();

        // SAFETY: `template` is a NUL-terminated, uniquely-owned buffer long
        // enough for mkstemp to rewrite its trailing "XXXXXX" in place.
        let fd = unsafe { libc::mkstemp(template.as_mut_ptr() as *mut libc::c_char) };
        if fd < 0 {
            return Err(FsError::new(dir.to_path_buf(), std::io::Error::last_os_error()));
        }
        // We only needed mkstemp to allocate the unique path; the caller
        // reopens it through `open_append`/`open_read` as needed.
        unsafe {
            libc::close(fd);
        }
        template.pop(); // drop NUL
        let path = std::ffi::OsStr::from_bytes(&template);
        Utf8PathBuf::from_path_buf(path.into()).map_err(|p| {
            FsError::new(
                dir.to_path_buf(),
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("mkstemp produced a non-UTF-8 path: {}", p.display()),
                ),
            )
        })
    }

    fn open_append(&self, path: &Utf8Path) -> Result<Box<dyn Write + Send>, FsError> {
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| FsError::new(path.to_path_buf(), e))?;
        Ok(Box::new(file))
    }

    fn open_read(&self, path: &Utf8Path) -> Result<Box<dyn Read + Send>, FsError> {
        let file = fs::File::open(path).map_err(|e| FsError::new(path.to_path_buf(), e))?;
        Ok(Box::new(file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stat_missing_path_is_none() {
        let fs = RealFileSystem::new();
        let path = Utf8PathBuf::from("/nonexistent/shk-real-fs-test-path");
        assert!(fs.stat(&path).unwrap().is_none());
    }

    #[test]
    fn mkstemp_creates_unique_file() {
        let dir = tempfile::tempdir().unwrap();
        let dir_path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let fs = RealFileSystem::new();
        let a = fs.mkstemp(&dir_path, "shk").unwrap();
        let b = fs.mkstemp(&dir_path, "shk").unwrap();
        assert_ne!(a, b);
        assert!(fs.stat(&a).unwrap().is_some());
    }
}
