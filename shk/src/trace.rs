//! The `Trace` file format written by the external `shk-trace` helper and
//! read back by [`crate::command_runner::tracing::TracingCommandRunner`]
//! (spec §4.5, §6 "Trace file format").
//!
//! The distilled format is "a flatbuffer-validated binary `Trace`". No crate
//! in this workspace's dependency stack provides FlatBuffers bindings, so we
//! hand-roll an equivalent tagged format: a 4-byte magic, a version, and
//! three length-prefixed vectors of length-prefixed UTF-8 strings (inputs,
//! outputs, errors) — the same little-endian encoding style already used for
//! the invocation log (`invocation_log::format`).

use crate::error::LogError;

const MAGIC: &[u8; 4] = b"shkT";
const VERSION: u32 = 1;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Trace {
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub errors: Vec<String>,
}

impl Trace {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&VERSION.to_le_bytes());
        write_strings(&mut buf, &self.inputs);
        write_strings(&mut buf, &self.outputs);
        write_strings(&mut buf, &self.errors);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Trace, LogError> {
        if data.len() < 8 || &data[0..4] != MAGIC {
            return Err(truncated(0, "missing trace magic"));
        }
        let version = u32::from_le_bytes(data[4..8].try_into().unwrap());
        if version != VERSION {
            return Err(LogError::UnsupportedVersion {
                found: version,
                expected: VERSION,
            });
        }
        let mut cursor = 8usize;
        let inputs = read_strings(data, &mut cursor)?;
        let outputs = read_strings(data, &mut cursor)?;
        let errors = read_strings(data, &mut cursor)?;
        Ok(Trace {
            inputs,
            outputs,
            errors,
        })
    }
}

fn truncated(offset: usize, reason: &str) -> LogError {
    LogError::Truncated {
        path: camino::Utf8PathBuf::new(),
        offset: offset as u64,
        reason: reason.to_string(),
    }
}

fn write_strings(buf: &mut Vec<u8>, values: &[String]) {
    buf.extend_from_slice(&(values.len() as u32).to_le_bytes());
    for v in values {
        let bytes = v.as_bytes();
        buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        buf.extend_from_slice(bytes);
    }
}

fn read_strings(data: &[u8], cursor: &mut usize) -> Result<Vec<String>, LogError> {
    let count = read_u32(data, cursor)?;
    let mut out = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = read_u32(data, cursor)? as usize;
        let end = cursor
            .checked_add(len)
            .filter(|&e| e <= data.len())
            .ok_or_else(|| truncated(*cursor, "string length runs past end of trace"))?;
        let s = std::str::from_utf8(&data[*cursor..end])
            .map_err(|_| truncated(*cursor, "invalid utf-8 in trace string"))?
            .to_string();
        *cursor = end;
        out.push(s);
    }
    Ok(out)
}

fn read_u32(data: &[u8], cursor: &mut usize) -> Result<u32, LogError> {
    let end = cursor
        .checked_add(4)
        .filter(|&e| e <= data.len())
        .ok_or_else(|| truncated(*cursor, "truncated length prefix in trace"))?;
    let value = u32::from_le_bytes(data[*cursor..end].try_into().unwrap());
    *cursor = end;
    Ok(value)
}

/// Paths the tracer is known to touch incidentally on every command and
/// which should never be treated as real dependencies (spec §4.5).
pub const IGNORED_PATHS: &[&str] = &[
    "/dev/null",
    "/dev/urandom",
    "/dev/random",
    "/dev/tty",
    "/dev/stdin",
    "/dev/stdout",
    "/dev/stderr",
];

pub fn is_ignored(path: &str) -> bool {
    IGNORED_PATHS.contains(&path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode() {
        let trace = Trace {
            inputs: vec!["/a".to_string(), "/b".to_string()],
            outputs: vec!["/out".to_string()],
            errors: vec![],
        };
        let decoded = Trace::decode(&trace.encode()).unwrap();
        assert_eq!(trace, decoded);
    }

    #[test]
    fn decode_rejects_bad_magic() {
        let err = Trace::decode(b"xxxx0000").unwrap_err();
        assert!(matches!(err, LogError::Truncated { .. }));
    }

    #[test]
    fn decode_rejects_unsupported_version() {
        let mut buf = Vec::new();
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&99u32.to_le_bytes());
        let err = Trace::decode(&buf).unwrap_err();
        assert!(matches!(err, LogError::UnsupportedVersion { found: 99, .. }));
    }

    #[test]
    fn ignores_known_system_paths() {
        assert!(is_ignored("/dev/null"));
        assert!(!is_ignored("/home/user/src/main.c"));
    }
}
