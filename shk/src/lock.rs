//! Advisory lock on the persistent invocation log (spec §5, §6;
//! SPEC_FULL.md §C.6): two `shk` invocations against the same build
//! directory serialize through this instead of racing the log file.

use camino::Utf8Path;
use fs4::FileExt;
use std::fs::{File, OpenOptions};
use std::io;

/// Holds an exclusive advisory lock on `.shk_log.lock` for its lifetime.
/// Released automatically on drop.
pub struct BuildLock {
    file: File,
}

impl BuildLock {
    /// Acquires the lock, blocking if another process holds it. Prints a
    /// contention message to stderr exactly once before blocking, mirroring
    /// real build tools' lock-wait UX rather than hanging silently.
    pub fn acquire(path: &Utf8Path) -> io::Result<BuildLock> {
        let file = OpenOptions::new().create(true).write(true).open(path.as_std_path())?;
        if file.try_lock_exclusive().is_err() {
            eprintln!("waiting for persistent build log lock...");
            file.lock_exclusive()?;
        }
        Ok(BuildLock { file })
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    #[test]
    fn acquire_then_release_allows_reacquisition() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join(".shk_log.lock")).unwrap();
        {
            let _first = BuildLock::acquire(&path).unwrap();
        }
        let _second = BuildLock::acquire(&path).unwrap();
    }
}
