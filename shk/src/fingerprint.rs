//! Stat+hash file identity with race-window avoidance (spec §4.1).

use crate::error::FingerprintError;
use crate::fileid::FileId;
use crate::fs::{FileKind, FileSystem, Stat, Timestamp};
use camino::Utf8Path;
use shk_hash::{Hash, HashWriter};

/// A subset of `stat(2)` sufficient to tell "unchanged" from "changed"
/// without reading file content, stored verbatim inside a [`Fingerprint`].
pub type StatInfo = Stat;

/// A content+stat identity record for one path at one point in time.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Fingerprint {
    pub stat: StatInfo,
    /// True if the fingerprint cannot yet be trusted by stat alone — it was
    /// taken at or before the file's own mtime, so a same-second edit after
    /// the fingerprint was taken is indistinguishable from "unchanged".
    pub racily_clean: bool,
    pub hash: Hash,
}

/// The result of comparing a live file against a previously recorded
/// [`Fingerprint`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct MatchResult {
    pub clean: bool,
    /// True if the caller should rewrite the log entry with a fresh,
    /// non-racy fingerprint (the stat-only fast path could not be taken).
    pub should_update: bool,
    pub file_id: FileId,
}

fn hash_regular_file(fs: &dyn FileSystem, path: &Utf8Path, stat: &Stat) -> Result<Hash, FingerprintError> {
    let content = fs.read_file(path)?;
    let mut w = HashWriter::new();
    w.update(b"f").update_framed(&stat.size.to_le_bytes());
    w.update_framed(&content);
    Ok(w.finish())
}

fn hash_directory(fs: &dyn FileSystem, path: &Utf8Path) -> Result<Hash, FingerprintError> {
    let mut names = fs.read_dir(path)?;
    names.sort();
    let mut w = HashWriter::new();
    w.update(b"d");
    for name in &names {
        w.update_framed(name.as_bytes());
    }
    Ok(w.finish())
}

fn hash_symlink(fs: &dyn FileSystem, path: &Utf8Path) -> Result<Hash, FingerprintError> {
    let target = fs.read_link(path)?;
    let mut w = HashWriter::new();
    w.update(b"l").update_framed(target.as_bytes());
    Ok(w.finish())
}

fn hash_for(fs: &dyn FileSystem, path: &Utf8Path, stat: &Stat) -> Result<Hash, FingerprintError> {
    match stat.kind {
        FileKind::Regular => hash_regular_file(fs, path, stat),
        FileKind::Directory => hash_directory(fs, path),
        FileKind::Symlink => hash_symlink(fs, path),
    }
}

/// Stats and hashes `path` fresh, as of `now`. `now` is supplied by the
/// caller (ordinarily the invocation log's delayed-write clock) rather than
/// read from the system clock here, so tests can script race windows.
pub fn take_fingerprint(
    fs: &dyn FileSystem,
    now: Timestamp,
    path: &Utf8Path,
) -> Result<(Fingerprint, FileId), FingerprintError> {
    let Some(stat) = fs.stat(path)? else {
        // A missing input is legitimate (e.g. an optional declared output);
        // give it a stable, distinguishable-from-everything-else fingerprint.
        let stat = Stat {
            kind: FileKind::Regular,
            size: 0,
            mode: 0,
            mtime: Timestamp(0),
            ino: 0,
            dev: 0,
        };
        return Ok((
            Fingerprint {
                stat,
                racily_clean: false,
                hash: Hash::of(b"shk:missing"),
            },
            FileId::missing(),
        ));
    };
    let file_id = stat.file_id();
    let hash = hash_for(fs, path, &stat)?;
    let racily_clean = now <= stat.mtime;
    Ok((
        Fingerprint {
            stat,
            racily_clean,
            hash,
        },
        file_id,
    ))
}

/// Refreshes an existing fingerprint only if it might be stale: an
/// already-non-racy fingerprint whose stat still matches the file is
/// returned unchanged (the whole point of the fingerprint cache).
pub fn retake_fingerprint(
    fs: &dyn FileSystem,
    now: Timestamp,
    path: &Utf8Path,
    old: &Fingerprint,
) -> Result<Fingerprint, FingerprintError> {
    if !old.racily_clean {
        if let Some(stat) = fs.stat(path)? {
            if stat == old.stat {
                return Ok(*old);
            }
        }
    }
    let (fp, _) = take_fingerprint(fs, now, path)?;
    Ok(fp)
}

/// Compares `fp` (a previously recorded fingerprint) against the file's
/// current on-disk state.
fn is_missing_sentinel(fp: &Fingerprint) -> bool {
    fp.stat.ino == 0 && fp.stat.dev == 0 && fp.stat.size == 0 && fp.hash == Hash::of(b"shk:missing")
}

pub fn fingerprint_matches(
    fs: &dyn FileSystem,
    path: &Utf8Path,
    fp: &Fingerprint,
) -> Result<MatchResult, FingerprintError> {
    let current = fs.stat(path)?;
    let Some(stat) = current else {
        return Ok(MatchResult {
            clean: is_missing_sentinel(fp),
            should_update: false,
            file_id: FileId::missing(),
        });
    };
    let file_id = stat.file_id();

    if stat == fp.stat {
        if !fp.racily_clean {
            // Fast path: identical stat, fingerprint already confirmed
            // non-racy. No need to touch file content.
            return Ok(MatchResult {
                clean: true,
                should_update: false,
                file_id,
            });
        }
        let hash = hash_for(fs, path, &stat)?;
        return Ok(MatchResult {
            clean: hash == fp.hash,
            should_update: true,
            file_id,
        });
    }

    // The file has definitely been touched (some part of its stat
    // changed), but it might still have the same metadata shape and
    // content — e.g. mtime bumped by a no-op rewrite. Either way the log
    // entry should be refreshed so this expensive path isn't repeated.
    let metadata_matches =
        stat.kind == fp.stat.kind && stat.size == fp.stat.size && stat.mode == fp.stat.mode;
    let clean = metadata_matches && hash_for(fs, path, &stat)? == fp.hash;
    Ok(MatchResult {
        clean,
        should_update: true,
        file_id,
    })
}

/// The decision-from-precollected-data variant: used when one step wants to
/// decide whether it can skip rebuilding against another step's freshly
/// written output, without re-statting through the `FileSystem` capability.
pub fn fingerprint_matches_known(fp: &Fingerprint, new_stat: &Stat, new_hash: &Hash) -> MatchResult {
    let file_id = new_stat.file_id();
    if *new_stat == fp.stat {
        if !fp.racily_clean {
            return MatchResult {
                clean: true,
                should_update: false,
                file_id,
            };
        }
        return MatchResult {
            clean: *new_hash == fp.hash,
            should_update: true,
            file_id,
        };
    }
    let metadata_matches =
        new_stat.kind == fp.stat.kind && new_stat.size == fp.stat.size && new_stat.mode == fp.stat.mode;
    MatchResult {
        clean: metadata_matches && *new_hash == fp.hash,
        should_update: true,
        file_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mem::InMemoryFileSystem;

    #[test]
    fn take_then_match_with_no_mutation_is_clean() {
        let fs = InMemoryFileSystem::new();
        fs.put_file("/a", b"hello".to_vec(), Timestamp(1));
        fs.set_now(Timestamp(5));
        let (fp, _) = take_fingerprint(&fs, fs.now(), Utf8Path::new("/a")).unwrap();
        assert!(!fp.racily_clean);
        let m = fingerprint_matches(&fs, Utf8Path::new("/a"), &fp).unwrap();
        assert!(m.clean);
        assert!(!m.should_update);
    }

    #[test]
    fn racily_clean_when_fingerprinted_at_or_before_mtime() {
        let fs = InMemoryFileSystem::new();
        fs.put_file("/a", b"hello".to_vec(), Timestamp(5));
        fs.set_now(Timestamp(5));
        let (fp, _) = take_fingerprint(&fs, fs.now(), Utf8Path::new("/a")).unwrap();
        assert!(fp.racily_clean);
        let m = fingerprint_matches(&fs, Utf8Path::new("/a"), &fp).unwrap();
        assert!(m.clean);
        assert!(m.should_update);
    }

    #[test]
    fn touched_mtime_unchanged_content_is_clean_but_needs_rehash() {
        let fs = InMemoryFileSystem::new();
        fs.put_file("/a", b"hello".to_vec(), Timestamp(1));
        fs.set_now(Timestamp(5));
        let (fp, _) = take_fingerprint(&fs, fs.now(), Utf8Path::new("/a")).unwrap();
        // Touch mtime without changing content.
        fs.put_file("/a", b"hello".to_vec(), Timestamp(6));
        let m = fingerprint_matches(&fs, Utf8Path::new("/a"), &fp).unwrap();
        assert!(m.clean);
        assert!(m.should_update);
    }

    #[test]
    fn content_change_is_dirty() {
        let fs = InMemoryFileSystem::new();
        fs.put_file("/a", b"hello".to_vec(), Timestamp(1));
        fs.set_now(Timestamp(5));
        let (fp, _) = take_fingerprint(&fs, fs.now(), Utf8Path::new("/a")).unwrap();
        fs.put_file("/a", b"goodbye".to_vec(), Timestamp(1));
        let m = fingerprint_matches(&fs, Utf8Path::new("/a"), &fp).unwrap();
        assert!(!m.clean);
    }

    #[test]
    fn retake_skips_hashing_when_stat_unchanged_and_not_racy() {
        let fs = InMemoryFileSystem::new();
        fs.put_file("/a", b"hello".to_vec(), Timestamp(1));
        fs.set_now(Timestamp(5));
        let (fp, _) = take_fingerprint(&fs, fs.now(), Utf8Path::new("/a")).unwrap();
        let refreshed = retake_fingerprint(&fs, fs.now(), Utf8Path::new("/a"), &fp).unwrap();
        assert_eq!(refreshed, fp);
    }

    #[test]
    fn directory_and_file_with_same_name_cannot_collide() {
        let fs = InMemoryFileSystem::new();
        fs.put_file("/x", b"".to_vec(), Timestamp(1));
        let (file_fp, _) = take_fingerprint(&fs, Timestamp(5), Utf8Path::new("/x")).unwrap();
        fs.remove_file(Utf8Path::new("/x")).unwrap();
        fs.touch_dir("/x", Timestamp(1));
        let (dir_fp, _) = take_fingerprint(&fs, Timestamp(5), Utf8Path::new("/x")).unwrap();
        assert_ne!(file_fp.hash, dir_fp.hash);
    }
}
