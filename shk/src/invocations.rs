//! `Invocations`: the parsed invocation log as a whole (spec §3, §4.2).
//!
//! This is the read-only view handed to `Build::construct` and to the
//! fingerprint memoization pass. It is produced once, at the start of a
//! build, by [`crate::invocation_log::format::parse`].

use crate::fileid::FileId;
use crate::fingerprint::Fingerprint;
use crate::fs::FileSystem;
use camino::Utf8PathBuf;
use shk_hash::Hash;
use std::collections::HashMap;

/// Index into `Invocations::fingerprints`, the shared fingerprint pool.
pub type FingerprintIndex = u32;

/// One record per step-hash: what it read and wrote last time it ran, plus
/// the manifest-vs-reality dependency bookkeeping from spec §3.
#[derive(Clone, Debug, Default)]
pub struct Entry {
    /// Sorted fingerprint-pool indices for files this step wrote.
    pub output_files: Vec<FingerprintIndex>,
    /// Sorted fingerprint-pool indices for files this step read.
    pub input_files: Vec<FingerprintIndex>,
    /// Manifest-declared dependency step indices that were not actually read
    /// last time this step ran. Kept sorted for `stepIsIgnored`'s binary
    /// search (spec §4.4.4).
    pub ignored_dependencies: Vec<u32>,
    /// Step hashes that were actually read but are not declared manifest
    /// edges. Kept sorted.
    pub additional_dependencies: Vec<Hash>,
}

/// The parsed invocation log.
#[derive(Clone, Debug, Default)]
pub struct Invocations {
    pub entries: HashMap<Hash, Entry>,
    /// Shared pool of (path, fingerprint) pairs referenced by index from
    /// `Entry::{output_files,input_files}`, so that one fingerprint can back
    /// multiple entries without duplicating the stat+hash payload.
    pub fingerprints: Vec<(Utf8PathBuf, Fingerprint)>,
    /// Directories Shuriken itself previously created, keyed by the
    /// `FileId` they had when created. A directory that was removed and
    /// replaced (different inode) falls out of this set naturally on the
    /// next parse, since `removedDirectory`/recompaction re-derive it from
    /// path identity, not by re-statting every entry here.
    pub created_directories: HashMap<Utf8PathBuf, FileId>,
}

impl Invocations {
    pub fn fingerprint_path(&self, idx: FingerprintIndex) -> &Utf8PathBuf {
        &self.fingerprints[idx as usize].0
    }

    pub fn fingerprint(&self, idx: FingerprintIndex) -> &Fingerprint {
        &self.fingerprints[idx as usize].1
    }

    pub fn entry(&self, step_hash: &Hash) -> Option<&Entry> {
        self.entries.get(step_hash)
    }

    /// Replaces the placeholder `FileId`s [`crate::invocation_log::format::parse`]
    /// records for `CREATED_DIR` paths with the directory's current on-disk
    /// identity, dropping any path that no longer exists or is no longer a
    /// directory. The binary log format only persists paths (see §4.2); the
    /// "keyed by `FileId`" semantics spec §3 asks for requires statting the
    /// filesystem, so it happens here rather than in the pure parser.
    pub fn resolve_created_directories(&mut self, fs: &dyn FileSystem) -> Result<(), crate::error::FsError> {
        let paths: Vec<Utf8PathBuf> = self.created_directories.keys().cloned().collect();
        for path in paths {
            match fs.stat(&path)? {
                Some(stat) if stat.kind == crate::fs::FileKind::Directory => {
                    self.created_directories.insert(path, stat.file_id());
                }
                _ => {
                    self.created_directories.remove(&path);
                }
            }
        }
        Ok(())
    }

    /// True if `path`, which currently has `file_id`, is a directory
    /// Shuriken previously created and that still has the same identity.
    pub fn was_created_directory(&self, path: &Utf8PathBuf, file_id: FileId) -> bool {
        self.created_directories.get(path) == Some(&file_id)
    }
}
