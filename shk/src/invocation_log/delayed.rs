//! `DelayedInvocationLog`: buffers `ranCommand`/`cleanedCommand` entries
//! until the wall clock advances past the second they were produced in,
//! avoiding the racy-clean rehash spiral on back-to-back builds (spec §4.3).

use super::{FingerprintedFile, InvocationLog, RanCommand};
use crate::error::LogError;
use crate::fs::{FileSystem, Timestamp};
use camino::Utf8Path;
use shk_hash::Hash;
use std::sync::{Arc, Mutex};

enum PendingEntry {
    Ran {
        step_hash: Hash,
        outputs: Vec<FingerprintedFile>,
        inputs: Vec<FingerprintedFile>,
        ignored_dependencies: Vec<u32>,
        additional_dependencies: Vec<Hash>,
    },
    Cleaned {
        step_hash: Hash,
    },
}

struct Delayed {
    timestamp: Timestamp,
    entry: PendingEntry,
}

struct State {
    pending: Vec<Delayed>,
    write_all_called: bool,
}

/// Wraps an inner [`InvocationLog`], holding `ranCommand`/`cleanedCommand`
/// calls in memory until `fs.now()` advances past the second they arrived
/// in. [`DelayedInvocationLog::write_all`] must be called exactly once
/// before the wrapper is dropped; the `Drop` impl panics otherwise, matching
/// the destructor assertion in the upstream design.
pub struct DelayedInvocationLog {
    fs: Arc<dyn FileSystem>,
    inner: Box<dyn InvocationLog>,
    state: Mutex<State>,
}

impl DelayedInvocationLog {
    pub fn new(fs: Arc<dyn FileSystem>, inner: Box<dyn InvocationLog>) -> Self {
        DelayedInvocationLog {
            fs,
            inner,
            state: Mutex::new(State {
                pending: Vec::new(),
                write_all_called: false,
            }),
        }
    }

    fn flush_older_than(&self, now: Timestamp) -> Result<(), LogError> {
        let mut state = self.state.lock().unwrap();
        let split = state
            .pending
            .iter()
            .position(|d| d.timestamp >= now)
            .unwrap_or(state.pending.len());
        let ready: Vec<Delayed> = state.pending.drain(..split).collect();
        drop(state);
        for delayed in ready {
            match delayed.entry {
                PendingEntry::Cleaned { step_hash } => self.inner.cleaned_command(step_hash)?,
                PendingEntry::Ran {
                    step_hash,
                    outputs,
                    inputs,
                    ignored_dependencies,
                    additional_dependencies,
                } => self.inner.ran_command(RanCommand {
                    step_hash,
                    outputs: &outputs,
                    inputs: &inputs,
                    ignored_dependencies: &ignored_dependencies,
                    additional_dependencies: &additional_dependencies,
                })?,
            }
        }
        Ok(())
    }

    /// Flushes every remaining pending entry regardless of timestamp. Must
    /// be called exactly once, after the last `ran_command`/`cleaned_command`
    /// call, before the wrapper is dropped.
    pub fn write_all(&self) -> Result<(), LogError> {
        self.flush_older_than(Timestamp(i64::MAX))?;
        let mut state = self.state.lock().unwrap();
        debug_assert!(state.pending.is_empty());
        state.write_all_called = true;
        Ok(())
    }
}

impl Drop for DelayedInvocationLog {
    fn drop(&mut self) {
        if !self.state.get_mut().unwrap().write_all_called && !std::thread::panicking() {
            panic!("DelayedInvocationLog dropped without calling write_all");
        }
    }
}

impl InvocationLog for DelayedInvocationLog {
    fn created_directory(&self, path: &Utf8Path) -> Result<(), LogError> {
        // Directories are not fingerprinted and never racy; pass straight
        // through.
        self.inner.created_directory(path)
    }

    fn removed_directory(&self, path: &Utf8Path) -> Result<(), LogError> {
        self.inner.removed_directory(path)
    }

    fn ran_command(&self, cmd: RanCommand<'_>) -> Result<(), LogError> {
        let now = self.fs.now();
        self.flush_older_than(now)?;
        self.state.lock().unwrap().pending.push(Delayed {
            timestamp: now,
            entry: PendingEntry::Ran {
                step_hash: cmd.step_hash,
                outputs: cmd.outputs.to_vec(),
                inputs: cmd.inputs.to_vec(),
                ignored_dependencies: cmd.ignored_dependencies.to_vec(),
                additional_dependencies: cmd.additional_dependencies.to_vec(),
            },
        });
        Ok(())
    }

    fn cleaned_command(&self, step_hash: Hash) -> Result<(), LogError> {
        let now = self.fs.now();
        self.flush_older_than(now)?;
        self.state.lock().unwrap().pending.push(Delayed {
            timestamp: now,
            entry: PendingEntry::Cleaned { step_hash },
        });
        Ok(())
    }

    fn fingerprint(&self, path: &Utf8Path) -> Result<(crate::fingerprint::Fingerprint, crate::fileid::FileId), LogError> {
        self.inner.fingerprint(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mem::InMemoryFileSystem;
    use crate::invocation_log::memory::InMemoryInvocationLog;

    #[test]
    fn entry_written_same_second_is_held_until_clock_advances() {
        let mem = Arc::new(InMemoryFileSystem::new());
        mem.set_now(Timestamp(5));
        let fs: Arc<dyn FileSystem> = mem.clone();
        let inner = InMemoryInvocationLog::new();
        let inner_view = inner.clone();
        let log = DelayedInvocationLog::new(Arc::clone(&fs), Box::new(inner));

        log.ran_command(RanCommand {
            step_hash: Hash::of(b"s"),
            outputs: &[],
            inputs: &[],
            ignored_dependencies: &[],
            additional_dependencies: &[],
        })
        .unwrap();
        assert!(!inner_view.snapshot().entries.contains_key(&Hash::of(b"s")));

        mem.set_now(Timestamp(6));
        log.cleaned_command(Hash::of(b"unrelated")).unwrap();
        assert!(inner_view.snapshot().entries.contains_key(&Hash::of(b"s")));

        log.write_all().unwrap();
    }

    #[test]
    #[should_panic(expected = "write_all")]
    fn dropping_without_write_all_panics() {
        let fs: Arc<dyn FileSystem> = Arc::new(InMemoryFileSystem::new());
        let log = DelayedInvocationLog::new(fs, Box::new(InMemoryInvocationLog::new()));
        log.ran_command(RanCommand {
            step_hash: Hash::of(b"s"),
            outputs: &[],
            inputs: &[],
            ignored_dependencies: &[],
            additional_dependencies: &[],
        })
        .unwrap();
    }
}
