//! Error types for every library-level subsystem.
//!
//! Library code returns these via `thiserror`-derived enums so that callers
//! can match on kind; the CLI binary is the only place these get converted
//! into an `anyhow::Error` for user-facing reporting (see `bin/shk/main.rs`).

use camino::Utf8PathBuf;
use shk_hash::Hash;
use std::io;
use thiserror::Error;

/// A filesystem capability failure, carrying the path it failed on.
#[derive(Debug, Error)]
#[error("{path}: {source}")]
pub struct FsError {
    pub path: Utf8PathBuf,
    #[source]
    pub source: io::Error,
}

impl FsError {
    pub fn new(path: impl Into<Utf8PathBuf>, source: io::Error) -> Self {
        FsError {
            path: path.into(),
            source,
        }
    }
}

#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error("path `{0}` has an unrecognized file kind")]
    UnknownKind(Utf8PathBuf),
}

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("dependency cycle detected: {0}")]
    Cycle(String),
    #[error("multiple steps produce output `{0}`")]
    DuplicateOutput(Utf8PathBuf),
    #[error("unknown target `{0}`")]
    UnknownTarget(String),
    #[error("step declares no outputs and is not a default or root")]
    UnreachableStep,
}

#[derive(Debug, Error)]
pub enum LogError {
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error("invocation log `{path}` truncated after parse error at byte {offset}: {reason}")]
    Truncated {
        path: Utf8PathBuf,
        offset: u64,
        reason: String,
    },
    #[error("invocation log has unsupported version {found}, expected {expected}")]
    UnsupportedVersion { found: u32, expected: u32 },
    #[error("invocation log is missing its signature header")]
    MissingHeader,
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("more than one step wrote to the same file `{path}`")]
    DuplicateWriter { path: Utf8PathBuf },
    #[error("invariant violation: {0}")]
    Invariant(String),
    #[error("command for step producing `{outputs}` failed: {message}")]
    CommandFailed { outputs: String, message: String },
    #[error("cycle discovered via additional dependencies involving step hash {0}")]
    AdditionalDependencyCycle(Hash),
}
