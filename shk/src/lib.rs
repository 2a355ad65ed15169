//! Shuriken (`shk`): a Ninja-compatible build engine, as a library the
//! `shk` binary is a thin CLI front-end over (spec §1, §7).
//!
//! Manifest lexing/parsing is out of scope (see [`manifest::RawManifest`]);
//! callers hand this crate an already-decoded manifest and it owns
//! everything downstream: dirtiness analysis, scheduling, command
//! execution, and the invocation log that makes the next build incremental.

pub mod build;
pub mod command_runner;
pub mod config;
pub mod error;
pub mod fileid;
pub mod fingerprint;
pub mod fs;
pub mod invocation_log;
pub mod invocations;
pub mod lock;
pub mod manifest;
pub mod path;
pub mod status;
pub mod trace;

pub use build::{Build, BuildResult};
pub use config::Config;
pub use error::{BuildError, FingerprintError, FsError, LogError, ManifestError};
pub use manifest::{CompiledManifest, RawManifest, RawStep, Step, StepId};
