//! Scheduling state for one build: the parallel-vector step-node
//! representation spec §3/§4.4.1 mandates instead of a general graph crate.

use crate::fileid::FileId;
use crate::manifest::StepId;
use shk_hash::Hash;
use std::collections::HashMap;

/// One step's scheduling state, parallel to `CompiledManifest::steps()`.
#[derive(Clone, Debug, Default)]
pub struct StepNode {
    pub dependents: Vec<StepId>,
    pub dependencies_count: u32,
    pub should_build: bool,
    /// DFS recursion-stack marker used only while `Build::construct` is
    /// running; defense-in-depth against cycles the manifest compiler
    /// should already have rejected (and against cycles introduced by
    /// `additional_dependencies`, which the compiler never saw).
    pub currently_visited: bool,
    /// True until a direct dependency of this step actually runs (as
    /// opposed to being skipped/clean). Backs the `canSkipBuildCommand`
    /// fast path (spec §4.4.5).
    pub no_direct_dependencies_built: bool,
}

/// Transient per-build scheduling state (spec §3 "Build (transient, per
/// invocation)").
#[derive(Default)]
pub struct BuildState {
    pub step_nodes: Vec<StepNode>,
    /// LIFO work stack of steps whose `dependencies_count == 0` and that
    /// should be built.
    pub ready_steps: Vec<StepId>,
    /// Completed outputs, `FileId -> producing step`. Used to detect two
    /// steps writing the same file and to derive `used_dependencies`.
    pub output_files: HashMap<FileId, StepId>,
    /// `FileId -> content hash` for every file written so far this build;
    /// backs the skip-if-unchanged-inputs check without re-hashing from
    /// disk when the writer is known.
    pub written_files: HashMap<FileId, Hash>,
    pub remaining_failures: i64,
    pub invoked_commands: u64,
}

impl BuildState {
    pub fn new(step_count: usize, failures_allowed: i64) -> Self {
        BuildState {
            step_nodes: vec![StepNode::default(); step_count],
            ready_steps: Vec::new(),
            output_files: HashMap::new(),
            written_files: HashMap::new(),
            remaining_failures: failures_allowed,
            invoked_commands: 0,
        }
    }
}

/// Overall result of running a build to completion (spec §4.4.5
/// "Termination").
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BuildResult {
    Success,
    NoWorkToDo,
    Failure,
    Interrupted,
}
