//! `InMemoryInvocationLog`: a log that never touches disk, discarded at
//! process exit. Backs `-n` dry-run builds (spec §C.3) and is the log every
//! engine unit test drives directly.

use super::{InvocationLog, RanCommand};
use crate::error::LogError;
use crate::fileid::FileId;
use crate::fingerprint::{self, Fingerprint};
use crate::fs::FileSystem;
use crate::invocations::{Entry, Invocations};
use camino::{Utf8Path, Utf8PathBuf};
use shk_hash::Hash;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
pub struct InMemoryInvocationLog {
    fs: Option<Arc<dyn FileSystem>>,
    invocations: Arc<Mutex<Invocations>>,
}

impl InMemoryInvocationLog {
    pub fn new() -> Self {
        InMemoryInvocationLog {
            fs: None,
            invocations: Arc::new(Mutex::new(Invocations::default())),
        }
    }

    /// Seeds the log from a previously parsed [`Invocations`] (e.g. dry-run
    /// builds start from the real on-disk history) and wires in the
    /// `FileSystem` used to answer `fingerprint()` calls.
    pub fn seeded(fs: Arc<dyn FileSystem>, invocations: Invocations) -> Self {
        InMemoryInvocationLog {
            fs: Some(fs),
            invocations: Arc::new(Mutex::new(invocations)),
        }
    }

    pub fn snapshot(&self) -> Invocations {
        self.invocations.lock().unwrap().clone()
    }

    fn intern(&self, inv: &mut Invocations, path: &Utf8PathBuf, fp: Fingerprint) -> u32 {
        if let Some(idx) = inv
            .fingerprints
            .iter()
            .position(|(p, _)| p == path)
        {
            inv.fingerprints[idx].1 = fp;
            idx as u32
        } else {
            inv.fingerprints.push((path.clone(), fp));
            (inv.fingerprints.len() - 1) as u32
        }
    }
}

impl Default for InMemoryInvocationLog {
    fn default() -> Self {
        Self::new()
    }
}

impl InvocationLog for InMemoryInvocationLog {
    fn created_directory(&self, path: &Utf8Path) -> Result<(), LogError> {
        let file_id = self
            .fs
            .as_ref()
            .and_then(|fs| fs.stat(path).ok().flatten())
            .map(|s| s.file_id())
            .unwrap_or(FileId::missing());
        self.invocations
            .lock()
            .unwrap()
            .created_directories
            .insert(path.to_path_buf(), file_id);
        Ok(())
    }

    fn removed_directory(&self, path: &Utf8Path) -> Result<(), LogError> {
        self.invocations
            .lock()
            .unwrap()
            .created_directories
            .remove(&path.to_path_buf());
        Ok(())
    }

    fn ran_command(&self, cmd: RanCommand<'_>) -> Result<(), LogError> {
        let mut inv = self.invocations.lock().unwrap();
        let mut output_files: Vec<u32> = cmd
            .outputs
            .iter()
            .map(|f| self.intern(&mut inv, &f.path, f.fingerprint))
            .collect();
        let mut input_files: Vec<u32> = cmd
            .inputs
            .iter()
            .map(|f| self.intern(&mut inv, &f.path, f.fingerprint))
            .collect();
        output_files.sort_unstable();
        input_files.sort_unstable();
        let mut ignored_dependencies = cmd.ignored_dependencies.to_vec();
        ignored_dependencies.sort_unstable();
        let mut additional_dependencies = cmd.additional_dependencies.to_vec();
        additional_dependencies.sort_unstable();
        inv.entries.insert(
            cmd.step_hash,
            Entry {
                output_files,
                input_files,
                ignored_dependencies,
                additional_dependencies,
            },
        );
        Ok(())
    }

    fn cleaned_command(&self, step_hash: Hash) -> Result<(), LogError> {
        self.invocations.lock().unwrap().entries.remove(&step_hash);
        Ok(())
    }

    fn fingerprint(&self, path: &Utf8Path) -> Result<(Fingerprint, FileId), LogError> {
        let fs = self
            .fs
            .as_ref()
            .expect("InMemoryInvocationLog::fingerprint called without a FileSystem attached");
        fingerprint::take_fingerprint(fs.as_ref(), fs.now(), path)
            .map_err(|e| LogError::Fs(crate::error::FsError::new(path.to_path_buf(), std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mem::InMemoryFileSystem;

    #[test]
    fn ran_command_then_cleaned_round_trips() {
        let fs: Arc<dyn FileSystem> = Arc::new(InMemoryFileSystem::new());
        let log = InMemoryInvocationLog::seeded(fs, Invocations::default());
        log.ran_command(RanCommand {
            step_hash: Hash::of(b"s"),
            outputs: &[],
            inputs: &[],
            ignored_dependencies: &[],
            additional_dependencies: &[],
        })
        .unwrap();
        assert!(log.snapshot().entries.contains_key(&Hash::of(b"s")));
        log.cleaned_command(Hash::of(b"s")).unwrap();
        assert!(!log.snapshot().entries.contains_key(&Hash::of(b"s")));
    }
}
