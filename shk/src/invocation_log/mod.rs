//! `InvocationLog`: the write side of the append-only record described in
//! spec §4.2, plus the variants layered on top of it (§4.3, §C.3).

pub mod delayed;
pub mod format;
pub mod memory;

use crate::error::{FsError, LogError};
use crate::fileid::FileId;
use crate::fingerprint::{self, Fingerprint};
use crate::fs::{mkdirs, FileSystem};
use crate::path::canonicalize;
use camino::{Utf8Path, Utf8PathBuf};
use shk_hash::Hash;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Mutex;

/// One fingerprinted path, ready to be written into (or just read out of) an
/// invocation log entry.
#[derive(Clone, Debug)]
pub struct FingerprintedFile {
    pub path: Utf8PathBuf,
    pub fingerprint: Fingerprint,
}

/// Arguments to [`InvocationLog::ran_command`], gathering everything spec
/// §4.2 says one `INVOCATION` record needs.
pub struct RanCommand<'a> {
    pub step_hash: Hash,
    pub outputs: &'a [FingerprintedFile],
    pub inputs: &'a [FingerprintedFile],
    pub ignored_dependencies: &'a [u32],
    pub additional_dependencies: &'a [Hash],
}

pub trait InvocationLog: Send + Sync {
    fn created_directory(&self, path: &Utf8Path) -> Result<(), LogError>;
    fn removed_directory(&self, path: &Utf8Path) -> Result<(), LogError>;
    fn ran_command(&self, cmd: RanCommand<'_>) -> Result<(), LogError>;
    fn cleaned_command(&self, step_hash: Hash) -> Result<(), LogError>;
    fn fingerprint(&self, path: &Utf8Path) -> Result<(Fingerprint, FileId), LogError>;

    fn fingerprint_files(&self, paths: &[Utf8PathBuf]) -> Result<Vec<FingerprintedFile>, LogError> {
        paths
            .iter()
            .map(|p| {
                self.fingerprint(p).map(|(fingerprint, _)| FingerprintedFile {
                    path: p.clone(),
                    fingerprint,
                })
            })
            .collect()
    }

    /// Re-appends an existing entry with freshly taken fingerprints for
    /// every one of its paths. Used by the racy-clean flush (spec §4.4.3)
    /// and by recompaction.
    fn relog_command(
        &self,
        step_hash: Hash,
        output_paths: &[Utf8PathBuf],
        input_paths: &[Utf8PathBuf],
        ignored_dependencies: &[u32],
        additional_dependencies: &[Hash],
    ) -> Result<(), LogError> {
        let outputs = self.fingerprint_files(output_paths)?;
        let inputs = self.fingerprint_files(input_paths)?;
        self.ran_command(RanCommand {
            step_hash,
            outputs: &outputs,
            inputs: &inputs,
            ignored_dependencies,
            additional_dependencies,
        })
    }
}

struct WriterState {
    writer: Box<dyn Write + Send>,
    path_ids: HashMap<String, u32>,
}

/// The real, disk-backed invocation log (`.shk_log`). Appends are
/// serialized behind a mutex since `InvocationLog` calls can arrive from
/// the scheduler while it is mid-dispatch (spec §4.2, §5 "shared
/// resources").
pub struct PersistentInvocationLog {
    fs: std::sync::Arc<dyn FileSystem>,
    state: Mutex<WriterState>,
}

impl PersistentInvocationLog {
    /// Opens (creating if necessary) the log at `path` for appending.
    /// `path_ids` must be the id table [`format::parse`] returned when this
    /// process read the existing file, so new `PATH` entries continue the
    /// same id space instead of colliding.
    pub fn open(
        fs: std::sync::Arc<dyn FileSystem>,
        path: &Utf8Path,
        path_ids: HashMap<String, u32>,
    ) -> Result<Self, LogError> {
        let existed = fs.stat(path).map_err(LogError::Fs)?.is_some();
        let mut writer = fs.open_append(path).map_err(LogError::Fs)?;
        if !existed {
            let mut header = Vec::new();
            format::write_signature(&mut header);
            writer.write_all(&header).map_err(|e| LogError::Fs(FsError::new(path.to_path_buf(), e)))?;
        }
        Ok(PersistentInvocationLog {
            fs,
            state: Mutex::new(WriterState { writer, path_ids }),
        })
    }

    fn id_for_path(state: &mut WriterState, path: &str) -> u32 {
        let canon = canonicalize(path);
        if let Some(&id) = state.path_ids.get(&canon) {
            return id;
        }
        let id = state.path_ids.len() as u32;
        let mut buf = Vec::new();
        format::write_path(&mut buf, &canon);
        let _ = state.writer.write_all(&buf);
        state.path_ids.insert(canon, id);
        id
    }

    fn append(&self, buf: &[u8]) -> Result<(), LogError> {
        let mut state = self.state.lock().unwrap();
        state
            .writer
            .write_all(buf)
            .map_err(|e| LogError::Fs(FsError::new(Utf8PathBuf::new(), e)))
    }
}

impl InvocationLog for PersistentInvocationLog {
    fn created_directory(&self, path: &Utf8Path) -> Result<(), LogError> {
        let mut state = self.state.lock().unwrap();
        let id = Self::id_for_path(&mut state, path.as_str());
        let mut buf = Vec::new();
        format::write_created_dir(&mut buf, id);
        state
            .writer
            .write_all(&buf)
            .map_err(|e| LogError::Fs(FsError::new(path.to_path_buf(), e)))
    }

    fn removed_directory(&self, path: &Utf8Path) -> Result<(), LogError> {
        let mut state = self.state.lock().unwrap();
        let canon = canonicalize(path.as_str());
        let Some(&id) = state.path_ids.get(&canon) else {
            // Never created, so there is nothing to record as removed.
            return Ok(());
        };
        let mut buf = Vec::new();
        format::write_deleted_dir(&mut buf, id);
        state
            .writer
            .write_all(&buf)
            .map_err(|e| LogError::Fs(FsError::new(path.to_path_buf(), e)))
    }

    fn ran_command(&self, cmd: RanCommand<'_>) -> Result<(), LogError> {
        let mut state = self.state.lock().unwrap();
        let output_ids: Vec<(u32, Fingerprint)> = cmd
            .outputs
            .iter()
            .map(|f| (Self::id_for_path(&mut state, f.path.as_str()), f.fingerprint))
            .collect();
        let input_ids: Vec<(u32, Fingerprint)> = cmd
            .inputs
            .iter()
            .map(|f| (Self::id_for_path(&mut state, f.path.as_str()), f.fingerprint))
            .collect();
        let mut buf = Vec::new();
        format::write_invocation(
            &mut buf,
            &cmd.step_hash,
            &output_ids,
            &input_ids,
            cmd.ignored_dependencies,
            cmd.additional_dependencies,
        );
        state
            .writer
            .write_all(&buf)
            .map_err(|e| LogError::Fs(FsError::new(Utf8PathBuf::new(), e)))
    }

    fn cleaned_command(&self, step_hash: Hash) -> Result<(), LogError> {
        let mut buf = Vec::new();
        format::write_deleted_invocation(&mut buf, &step_hash);
        self.append(&buf)
    }

    fn fingerprint(&self, path: &Utf8Path) -> Result<(Fingerprint, FileId), LogError> {
        fingerprint::take_fingerprint(self.fs.as_ref(), self.fs.now(), path).map_err(|e| match e {
            crate::error::FingerprintError::Fs(fs_err) => LogError::Fs(fs_err),
            other => LogError::Fs(FsError::new(path.to_path_buf(), std::io::Error::new(std::io::ErrorKind::Other, other.to_string()))),
        })
    }
}

/// Recompacts `path` in place: parses it, then writes only the live records
/// (paths still referenced, directories still in the created set,
/// invocations still in `entries`) to a fresh temp file and renames it over
/// the original (spec §4.2 "Recompaction").
pub fn recompact(fs: &dyn FileSystem, path: &Utf8Path) -> Result<(), LogError> {
    let bytes = read_all(fs, path)?;
    let outcome = format::parse(&bytes)?;

    let mut buf = Vec::new();
    format::write_signature(&mut buf);

    let mut live_paths: std::collections::HashSet<&Utf8PathBuf> =
        outcome.invocations.created_directories.keys().collect();
    for (p, _) in &outcome.invocations.fingerprints {
        live_paths.insert(p);
    }
    let mut sorted_live: Vec<&Utf8PathBuf> = live_paths.into_iter().collect();
    sorted_live.sort();

    let mut new_path_ids: HashMap<String, u32> = HashMap::new();
    for p in &sorted_live {
        let id = new_path_ids.len() as u32;
        format::write_path(&mut buf, p.as_str());
        new_path_ids.insert(p.as_str().to_string(), id);
    }
    for dir in outcome.invocations.created_directories.keys() {
        let id = new_path_ids[dir.as_str()];
        format::write_created_dir(&mut buf, id);
    }
    for (hash, entry) in &outcome.invocations.entries {
        let mut path_fp = |idx: u32| -> (u32, Fingerprint) {
            let (p, fp) = &outcome.invocations.fingerprints[idx as usize];
            (new_path_ids[p.as_str()], *fp)
        };
        let outputs: Vec<(u32, Fingerprint)> = entry.output_files.iter().map(|&i| path_fp(i)).collect();
        let inputs: Vec<(u32, Fingerprint)> = entry.input_files.iter().map(|&i| path_fp(i)).collect();
        format::write_invocation(
            &mut buf,
            hash,
            &outputs,
            &inputs,
            &entry.ignored_dependencies,
            &entry.additional_dependencies,
        );
    }

    let dir = crate::path::parent(path).unwrap_or(Utf8Path::new("."));
    let tmp = fs.mkstemp(dir, ".shk_log.recompact.").map_err(LogError::Fs)?;
    {
        let mut writer = fs.open_append(&tmp).map_err(LogError::Fs)?;
        writer
            .write_all(&buf)
            .map_err(|e| LogError::Fs(FsError::new(tmp.clone(), e)))?;
    }
    fs.rename(&tmp, path).map_err(LogError::Fs)?;
    Ok(())
}

pub(crate) fn read_all(fs: &dyn FileSystem, path: &Utf8Path) -> Result<Vec<u8>, LogError> {
    match fs.stat(path).map_err(LogError::Fs)? {
        None => Ok(Vec::new()),
        Some(_) => {
            let mut reader = fs.open_read(path).map_err(LogError::Fs)?;
            let mut buf = Vec::new();
            std::io::Read::read_to_end(&mut reader, &mut buf)
                .map_err(|e| LogError::Fs(FsError::new(path.to_path_buf(), e)))?;
            Ok(buf)
        }
    }
}

/// Parses the log at `path` (if any), recovering from a truncated tail by
/// rewriting the file up to the last known-good entry (spec §7 "Log parse
/// error"). Shared by [`open_persistent`] and [`read_invocations`]; the
/// former goes on to open the file for appending, the latter leaves it
/// exactly as found since it backs a dry run.
fn parse_with_recovery(
    fs: &dyn FileSystem,
    path: &Utf8Path,
) -> Result<format::ParseOutcome, LogError> {
    let bytes = read_all(fs, path)?;
    let mut outcome = format::parse(&bytes)?;
    if let Some(reason) = &outcome.warning {
        tracing::warn!(%reason, path = %path, "truncating invocation log after parse error");
        let dir = crate::path::parent(path).unwrap_or(Utf8Path::new("."));
        let tmp = fs.mkstemp(dir, ".shk_log.truncate.").map_err(LogError::Fs)?;
        {
            let mut writer = fs.open_append(&tmp).map_err(LogError::Fs)?;
            writer
                .write_all(&bytes[..outcome.valid_length])
                .map_err(|e| LogError::Fs(FsError::new(tmp.clone(), e)))?;
        }
        fs.rename(&tmp, path).map_err(LogError::Fs)?;
    }
    outcome
        .invocations
        .resolve_created_directories(fs)
        .map_err(LogError::Fs)?;
    Ok(outcome)
}

/// Opens the persistent log at `path`, parsing any existing content first.
/// Returns the resolved [`crate::invocations::Invocations`], whether
/// recompaction is advisable, and the ready-to-append log handle.
pub fn open_persistent(
    fs: std::sync::Arc<dyn FileSystem>,
    path: &Utf8Path,
) -> Result<(crate::invocations::Invocations, bool, Option<String>, PersistentInvocationLog), LogError>
{
    let outcome = parse_with_recovery(fs.as_ref(), path)?;
    let warning = outcome.warning.clone();
    let needs_recompaction = outcome.needs_recompaction;
    let log = PersistentInvocationLog::open(fs, path, outcome.path_ids)?;
    Ok((outcome.invocations, needs_recompaction, warning, log))
}

/// Parses the log at `path` for dirtiness analysis without ever opening it
/// for writing — used by `-n`, which must not create or append to
/// `.shk_log` (spec §6, §C.3; the ground-truth original guards its build-log
/// open the same way, `cli.cpp`'s `if (!_config.dry_run) { … OpenForWrite … }`).
pub fn read_invocations(
    fs: &dyn FileSystem,
    path: &Utf8Path,
) -> Result<(crate::invocations::Invocations, bool, Option<String>), LogError> {
    let outcome = parse_with_recovery(fs, path)?;
    Ok((outcome.invocations, outcome.needs_recompaction, outcome.warning))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mem::InMemoryFileSystem;
    use std::sync::Arc;

    #[test]
    fn open_on_fresh_path_writes_header() {
        let fs: Arc<dyn FileSystem> = Arc::new(InMemoryFileSystem::new());
        let path = Utf8PathBuf::from("/.shk_log");
        let (invocations, needs_recompaction, warning, log) =
            open_persistent(Arc::clone(&fs), &path).unwrap();
        assert!(invocations.entries.is_empty());
        assert!(!needs_recompaction);
        assert!(warning.is_none());
        log.created_directory(Utf8Path::new("/out")).unwrap();
    }

    #[test]
    fn ran_command_then_reopen_round_trips() {
        let mem_fs = InMemoryFileSystem::new();
        mem_fs.put_file("/out", b"hi".to_vec(), crate::fs::Timestamp(1));
        let fs: Arc<dyn FileSystem> = Arc::new(mem_fs);
        let path = Utf8PathBuf::from("/.shk_log");
        let (_, _, _, log) = open_persistent(Arc::clone(&fs), &path).unwrap();
        let (fp, _) = log.fingerprint(Utf8Path::new("/out")).unwrap();
        log.ran_command(RanCommand {
            step_hash: Hash::of(b"step"),
            outputs: &[FingerprintedFile {
                path: Utf8PathBuf::from("/out"),
                fingerprint: fp,
            }],
            inputs: &[],
            ignored_dependencies: &[],
            additional_dependencies: &[],
        })
        .unwrap();

        let (invocations, _, _, _) = open_persistent(Arc::clone(&fs), &path).unwrap();
        assert!(invocations.entries.contains_key(&Hash::of(b"step")));
    }
}
