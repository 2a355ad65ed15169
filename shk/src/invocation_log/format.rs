//! Binary wire format for the invocation log (spec §4.2).
//!
//! All multi-byte values are little-endian. The file starts with the ASCII
//! signature `invocations:` followed by a 32-bit version (the version field
//! doubles as a byte-order mark). The body is a stream of entries, each
//! prefixed by a 32-bit header: the top 30 bits are the payload length in
//! bytes (always a multiple of 4), the bottom 2 bits are the entry type.

use crate::error::LogError;
use crate::fileid::FileId;
use crate::fingerprint::Fingerprint;
use crate::fs::{FileKind, Timestamp};
use crate::invocations::{Entry, FingerprintIndex, Invocations};
use camino::Utf8PathBuf;
use shk_hash::Hash;
use std::collections::HashMap;

pub const SIGNATURE: &[u8] = b"invocations:";
pub const VERSION: u32 = 1;

const TYPE_MASK: u32 = 0b11;
const TYPE_PATH: u32 = 0;
const TYPE_CREATED_DIR: u32 = 1;
const TYPE_INVOCATION: u32 = 2;
const TYPE_DELETED: u32 = 3;

/// Fixed on-disk width of one serialized [`Fingerprint`]. Chosen so every
/// entry's total payload length is a multiple of 4 by construction (kind +
/// racily_clean are packed with 2 bytes of padding to keep the rest of the
/// struct 8-byte friendly).
pub const FINGERPRINT_LEN: usize = 60;

fn kind_byte(kind: FileKind) -> u8 {
    match kind {
        FileKind::Regular => 0,
        FileKind::Directory => 1,
        FileKind::Symlink => 2,
    }
}

fn byte_kind(b: u8) -> Option<FileKind> {
    match b {
        0 => Some(FileKind::Regular),
        1 => Some(FileKind::Directory),
        2 => Some(FileKind::Symlink),
        _ => None,
    }
}

fn write_fingerprint(out: &mut Vec<u8>, fp: &Fingerprint) {
    out.push(kind_byte(fp.stat.kind));
    out.push(fp.racily_clean as u8);
    out.extend_from_slice(&[0u8; 2]);
    out.extend_from_slice(&fp.stat.size.to_le_bytes());
    out.extend_from_slice(&fp.stat.mtime.0.to_le_bytes());
    out.extend_from_slice(&fp.stat.mode.to_le_bytes());
    out.extend_from_slice(&fp.stat.ino.to_le_bytes());
    out.extend_from_slice(&fp.stat.dev.to_le_bytes());
    out.extend_from_slice(fp.hash.as_bytes());
    debug_assert_eq!(out.len() % 4, 0);
}

fn read_fingerprint(buf: &[u8]) -> Result<Fingerprint, LogError> {
    if buf.len() < FINGERPRINT_LEN {
        return Err(truncated("fingerprint"));
    }
    let kind = byte_kind(buf[0]).ok_or_else(|| truncated("fingerprint file kind"))?;
    let racily_clean = buf[1] != 0;
    let size = u64::from_le_bytes(buf[4..12].try_into().unwrap());
    let mtime = i64::from_le_bytes(buf[12..20].try_into().unwrap());
    let mode = u32::from_le_bytes(buf[20..24].try_into().unwrap());
    let ino = u64::from_le_bytes(buf[24..32].try_into().unwrap());
    let dev = u64::from_le_bytes(buf[32..40].try_into().unwrap());
    let mut hash_bytes = [0u8; shk_hash::LEN];
    hash_bytes.copy_from_slice(&buf[40..40 + shk_hash::LEN]);
    Ok(Fingerprint {
        stat: crate::fs::Stat {
            kind,
            size,
            mode,
            mtime: Timestamp(mtime),
            ino,
            dev,
        },
        racily_clean,
        hash: Hash::from_bytes(hash_bytes),
    })
}

fn truncated(reason: &str) -> LogError {
    LogError::Truncated {
        path: Utf8PathBuf::new(),
        offset: 0,
        reason: reason.to_string(),
    }
}

fn header(len: usize, ty: u32) -> u32 {
    debug_assert_eq!(len % 4, 0);
    (len as u32) | ty
}

pub fn write_signature(out: &mut Vec<u8>) {
    out.extend_from_slice(SIGNATURE);
    out.extend_from_slice(&VERSION.to_le_bytes());
}

/// `path_len` is the length with the trailing NUL, before padding.
fn path_padding(path_len_with_nul: usize) -> usize {
    (4 - (path_len_with_nul % 4)) % 4
}

pub fn write_path(out: &mut Vec<u8>, path: &str) {
    let with_nul = path.len() + 1;
    let padding = path_padding(with_nul);
    out.extend_from_slice(&header(with_nul + padding, TYPE_PATH).to_le_bytes());
    out.extend_from_slice(path.as_bytes());
    out.extend_from_slice(&[0u8; 4][..1 + padding]);
}

pub fn write_created_dir(out: &mut Vec<u8>, path_id: u32) {
    out.extend_from_slice(&header(4, TYPE_CREATED_DIR).to_le_bytes());
    out.extend_from_slice(&path_id.to_le_bytes());
}

pub fn write_deleted_dir(out: &mut Vec<u8>, path_id: u32) {
    out.extend_from_slice(&header(4, TYPE_DELETED).to_le_bytes());
    out.extend_from_slice(&path_id.to_le_bytes());
}

pub fn write_deleted_invocation(out: &mut Vec<u8>, step_hash: &Hash) {
    out.extend_from_slice(&header(shk_hash::LEN, TYPE_DELETED).to_le_bytes());
    out.extend_from_slice(step_hash.as_bytes());
}

/// `outputs`/`inputs` are `(path_id, fingerprint)` pairs, outputs first.
pub fn write_invocation(
    out: &mut Vec<u8>,
    step_hash: &Hash,
    outputs: &[(u32, Fingerprint)],
    inputs: &[(u32, Fingerprint)],
    ignored_dependencies: &[u32],
    additional_dependencies: &[Hash],
) {
    let per_file = 4 + FINGERPRINT_LEN;
    let len = shk_hash::LEN
        + 4
        + 4
        + 4
        + per_file * (outputs.len() + inputs.len())
        + 4 * ignored_dependencies.len()
        + shk_hash::LEN * additional_dependencies.len();
    out.extend_from_slice(&header(len, TYPE_INVOCATION).to_le_bytes());
    out.extend_from_slice(step_hash.as_bytes());
    out.extend_from_slice(&(outputs.len() as u32).to_le_bytes());
    out.extend_from_slice(&(ignored_dependencies.len() as u32).to_le_bytes());
    out.extend_from_slice(&(additional_dependencies.len() as u32).to_le_bytes());
    for (path_id, fp) in outputs.iter().chain(inputs.iter()) {
        out.extend_from_slice(&path_id.to_le_bytes());
        write_fingerprint(out, fp);
    }
    for step_idx in ignored_dependencies {
        out.extend_from_slice(&step_idx.to_le_bytes());
    }
    for hash in additional_dependencies {
        out.extend_from_slice(hash.as_bytes());
    }
}

/// Heuristic recompaction thresholds (spec §4.2).
const MIN_COMPACTION_ENTRY_COUNT: usize = 1000;
const COMPACTION_RATIO: usize = 3;

pub struct ParseOutcome {
    pub invocations: Invocations,
    /// Map from path string to its allocated path id, needed by the writer
    /// to avoid re-emitting `PATH` entries for paths already in the file.
    pub path_ids: HashMap<String, u32>,
    pub needs_recompaction: bool,
    /// Set if a parse error truncated the log; the caller should log this
    /// as a warning, not fail the build (spec §7).
    pub warning: Option<String>,
    /// Byte offset the file should be truncated to, if any entry failed to
    /// parse (always the end of the last successfully parsed entry).
    pub valid_length: usize,
}

/// Parses a complete invocation log file (header + entry stream) from
/// `data`. An empty `data` (the log does not exist yet) yields an empty,
/// fresh [`Invocations`].
pub fn parse(data: &[u8]) -> Result<ParseOutcome, LogError> {
    if data.is_empty() {
        return Ok(ParseOutcome {
            invocations: Invocations::default(),
            path_ids: HashMap::new(),
            needs_recompaction: false,
            warning: None,
            valid_length: 0,
        });
    }

    let sig_len = SIGNATURE.len() + 4;
    if data.len() < sig_len || &data[..SIGNATURE.len()] != SIGNATURE {
        return Err(LogError::MissingHeader);
    }
    let version = u32::from_le_bytes(data[SIGNATURE.len()..sig_len].try_into().unwrap());
    if version != VERSION {
        return Err(LogError::UnsupportedVersion {
            found: version,
            expected: VERSION,
        });
    }

    let mut invocations = Invocations::default();
    let mut path_ids: HashMap<String, u32> = HashMap::new();
    // Maps an allocated path entry id to its position in `invocations.fingerprints`
    // is not needed directly; we instead keep a parallel table from entry-id to path.
    let mut paths_by_id: Vec<Option<Utf8PathBuf>> = Vec::new();
    let mut fingerprint_index_of: HashMap<(u32, [u8; FINGERPRINT_LEN]), FingerprintIndex> =
        HashMap::new();

    let mut offset = sig_len;
    let mut entry_count: usize = 0;
    let mut warning = None;

    'parse: while offset < data.len() {
        let entry_start = offset;
        if data.len() - offset < 4 {
            warning = Some("invalid invocation log: encountered truncated entry".to_string());
            break 'parse;
        }
        let raw_header = u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap());
        let entry_len = (raw_header & !TYPE_MASK) as usize;
        let entry_type = raw_header & TYPE_MASK;
        let body_start = offset + 4;
        if data.len() - body_start < entry_len {
            warning = Some("invalid invocation log: encountered invalid entry".to_string());
            break 'parse;
        }
        let body = &data[body_start..body_start + entry_len];

        let result = (|| -> Result<(), String> {
            match entry_type {
                TYPE_PATH => {
                    let nul_pos = body
                        .iter()
                        .position(|&b| b == 0)
                        .ok_or_else(|| "invocation log: non null terminated path".to_string())?;
                    let path_str = std::str::from_utf8(&body[..nul_pos])
                        .map_err(|_| "invocation log: path is not valid UTF-8".to_string())?
                        .to_string();
                    let id = paths_by_id.len() as u32;
                    paths_by_id.push(Some(Utf8PathBuf::from(&path_str)));
                    path_ids.insert(path_str, id);
                    Ok(())
                }
                TYPE_CREATED_DIR => {
                    let path_id = read_path_id(body, &paths_by_id)?;
                    let path = paths_by_id[path_id as usize].clone().unwrap();
                    invocations
                        .created_directories
                        .insert(path, FileId::missing());
                    Ok(())
                }
                TYPE_INVOCATION => {
                    if body.len() < shk_hash::LEN + 12 {
                        return Err("invocation log: truncated invocation".to_string());
                    }
                    let mut hash_bytes = [0u8; shk_hash::LEN];
                    hash_bytes.copy_from_slice(&body[..shk_hash::LEN]);
                    let step_hash = Hash::from_bytes(hash_bytes);
                    let mut p = shk_hash::LEN;
                    let output_count =
                        u32::from_le_bytes(body[p..p + 4].try_into().unwrap()) as usize;
                    p += 4;
                    let ignored_count =
                        u32::from_le_bytes(body[p..p + 4].try_into().unwrap()) as usize;
                    p += 4;
                    let additional_count =
                        u32::from_le_bytes(body[p..p + 4].try_into().unwrap()) as usize;
                    p += 4;

                    let per_file = 4 + FINGERPRINT_LEN;
                    let files_bytes_end_hint = body.len().saturating_sub(
                        4 * ignored_count + shk_hash::LEN * additional_count,
                    );
                    if files_bytes_end_hint < p {
                        return Err("invocation log: truncated invocation".to_string());
                    }
                    let files_bytes = files_bytes_end_hint - p;
                    if files_bytes % per_file != 0 {
                        return Err("invocation log: malformed invocation file section".to_string());
                    }
                    let total_files = files_bytes / per_file;
                    if total_files < output_count {
                        return Err("invocation log: truncated invocation outputs".to_string());
                    }
                    let input_count = total_files - output_count;

                    let mut read_files = |count: usize,
                                           p: &mut usize|
                     -> Result<Vec<FingerprintIndex>, String> {
                        let mut out = Vec::with_capacity(count);
                        for _ in 0..count {
                            let path_id = read_path_id(&body[*p..*p + 4], &paths_by_id)?;
                            *p += 4;
                            let fp = read_fingerprint(&body[*p..*p + FINGERPRINT_LEN])
                                .map_err(|e| e.to_string())?;
                            *p += FINGERPRINT_LEN;
                            let path = paths_by_id[path_id as usize].clone().unwrap();
                            let mut key_bytes = [0u8; FINGERPRINT_LEN];
                            let mut tmp = Vec::with_capacity(FINGERPRINT_LEN);
                            write_fingerprint(&mut tmp, &fp);
                            key_bytes.copy_from_slice(&tmp);
                            let idx = *fingerprint_index_of
                                .entry((path_id, key_bytes))
                                .or_insert_with(|| {
                                    invocations.fingerprints.push((path, fp));
                                    (invocations.fingerprints.len() - 1) as FingerprintIndex
                                });
                            out.push(idx);
                        }
                        Ok(out)
                    };

                    let mut output_files = read_files(output_count, &mut p)?;
                    let mut input_files = read_files(input_count, &mut p)?;
                    output_files.sort_unstable();
                    input_files.sort_unstable();

                    let mut ignored_dependencies = Vec::with_capacity(ignored_count);
                    for _ in 0..ignored_count {
                        ignored_dependencies
                            .push(u32::from_le_bytes(body[p..p + 4].try_into().unwrap()));
                        p += 4;
                    }
                    ignored_dependencies.sort_unstable();

                    let mut additional_dependencies = Vec::with_capacity(additional_count);
                    for _ in 0..additional_count {
                        let mut hb = [0u8; shk_hash::LEN];
                        hb.copy_from_slice(&body[p..p + shk_hash::LEN]);
                        additional_dependencies.push(Hash::from_bytes(hb));
                        p += shk_hash::LEN;
                    }
                    additional_dependencies.sort_unstable();

                    invocations.entries.insert(
                        step_hash,
                        Entry {
                            output_files,
                            input_files,
                            ignored_dependencies,
                            additional_dependencies,
                        },
                    );
                    Ok(())
                }
                TYPE_DELETED => {
                    if body.len() == 4 {
                        let path_id = read_path_id(body, &paths_by_id)?;
                        let path = paths_by_id[path_id as usize].clone().unwrap();
                        invocations.created_directories.remove(&path);
                        Ok(())
                    } else if body.len() == shk_hash::LEN {
                        let mut hb = [0u8; shk_hash::LEN];
                        hb.copy_from_slice(body);
                        invocations.entries.remove(&Hash::from_bytes(hb));
                        Ok(())
                    } else {
                        Err("invocation log: invalid deleted entry".to_string())
                    }
                }
                _ => Err("invocation log: unknown entry type".to_string()),
            }
        })();

        if let Err(reason) = result {
            warning = Some(reason);
            offset = entry_start;
            break 'parse;
        }

        offset = body_start + entry_len;
        entry_count += 1;
    }

    let valid_length = if warning.is_some() { offset } else { data.len() };

    let unique_record_count =
        invocations.entries.len() + invocations.created_directories.len() + path_ids.len();
    let needs_recompaction = entry_count > MIN_COMPACTION_ENTRY_COUNT
        && entry_count > unique_record_count * COMPACTION_RATIO;

    Ok(ParseOutcome {
        invocations,
        path_ids,
        needs_recompaction,
        warning,
        valid_length,
    })
}

fn read_path_id(buf: &[u8], paths_by_id: &[Option<Utf8PathBuf>]) -> Result<u32, String> {
    if buf.len() < 4 {
        return Err("invocation log: truncated path reference".to_string());
    }
    let id = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    match paths_by_id.get(id as usize) {
        Some(Some(_)) => Ok(id),
        _ => Err("invocation log: encountered invalid path ref".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{FileKind, Stat};

    fn fp(seed: u8) -> Fingerprint {
        Fingerprint {
            stat: Stat {
                kind: FileKind::Regular,
                size: seed as u64,
                mode: 0o100644,
                mtime: Timestamp(seed as i64),
                ino: seed as u64,
                dev: 1,
            },
            racily_clean: false,
            hash: Hash::of(&[seed]),
        }
    }

    #[test]
    fn round_trips_empty_log() {
        let mut buf = Vec::new();
        write_signature(&mut buf);
        let outcome = parse(&buf).unwrap();
        assert!(outcome.invocations.entries.is_empty());
        assert!(!outcome.needs_recompaction);
    }

    #[test]
    fn round_trips_one_invocation() {
        let mut buf = Vec::new();
        write_signature(&mut buf);
        write_path(&mut buf, "/out");
        write_path(&mut buf, "/in");
        let hash = Hash::of(b"step");
        write_invocation(
            &mut buf,
            &hash,
            &[(0, fp(1))],
            &[(1, fp(2))],
            &[7],
            &[Hash::of(b"other-step")],
        );
        let outcome = parse(&buf).unwrap();
        assert!(outcome.warning.is_none());
        let entry = outcome.invocations.entries.get(&hash).unwrap();
        assert_eq!(entry.output_files.len(), 1);
        assert_eq!(entry.input_files.len(), 1);
        assert_eq!(entry.ignored_dependencies, vec![7]);
        assert_eq!(entry.additional_dependencies, vec![Hash::of(b"other-step")]);
        assert_eq!(
            outcome.invocations.fingerprint_path(entry.output_files[0]),
            "/out"
        );
    }

    #[test]
    fn cleaned_command_removes_entry() {
        let mut buf = Vec::new();
        write_signature(&mut buf);
        write_path(&mut buf, "/out");
        let hash = Hash::of(b"step");
        write_invocation(&mut buf, &hash, &[(0, fp(1))], &[], &[], &[]);
        write_deleted_invocation(&mut buf, &hash);
        let outcome = parse(&buf).unwrap();
        assert!(!outcome.invocations.entries.contains_key(&hash));
    }

    #[test]
    fn created_then_removed_directory_leaves_nothing() {
        let mut buf = Vec::new();
        write_signature(&mut buf);
        write_path(&mut buf, "/dir");
        write_created_dir(&mut buf, 0);
        write_deleted_dir(&mut buf, 0);
        let outcome = parse(&buf).unwrap();
        assert!(outcome.invocations.created_directories.is_empty());
    }

    #[test]
    fn truncated_entry_is_a_warning_not_an_error() {
        let mut buf = Vec::new();
        write_signature(&mut buf);
        write_path(&mut buf, "/out");
        let valid_len = buf.len();
        // Append a bogus, too-short entry header claiming a large payload.
        buf.extend_from_slice(&header(64, TYPE_CREATED_DIR).to_le_bytes());
        buf.extend_from_slice(&[1, 2]); // short of the claimed 64 bytes
        let outcome = parse(&buf).unwrap();
        assert!(outcome.warning.is_some());
        assert_eq!(outcome.valid_length, valid_len);
    }

    #[test]
    fn recompaction_threshold_triggers_on_enough_dead_entries() {
        let mut buf = Vec::new();
        write_signature(&mut buf);
        let hash = Hash::of(b"step");
        for _ in 0..1500 {
            write_deleted_invocation(&mut buf, &hash);
        }
        let outcome = parse(&buf).unwrap();
        assert!(outcome.needs_recompaction);
    }

    #[test]
    fn missing_signature_is_rejected() {
        let err = parse(b"not-a-log-file-of-any-kind!!").unwrap_err();
        assert!(matches!(err, LogError::MissingHeader));
    }
}
