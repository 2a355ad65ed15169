//! The `Build` engine: scheduler, step-node state, clean-step discard,
//! cancellation, failure accounting (spec §4.4).

mod dispatch;
pub mod state;

pub use state::BuildResult;

use crate::error::BuildError;
use crate::fileid::FileId;
use crate::fingerprint::{self, MatchResult};
use crate::fs::FileSystem;
use crate::invocation_log::InvocationLog;
use crate::invocations::{FingerprintIndex, Invocations};
use crate::manifest::{CompiledManifest, StepId, CONSOLE_POOL};
use crate::status::BuildStatus;
use camino::Utf8PathBuf;
use shk_hash::Hash;
use state::{BuildState, StepNode};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Everything the scheduler needs for the duration of one build, wrapped in
/// `Arc` so command-completion callbacks (which must be `'static + Send` to
/// cross into the command runner's worker threads) can hold a clone of it.
pub(crate) struct Inner {
    manifest: Arc<CompiledManifest>,
    invocations: Arc<Invocations>,
    fs: Arc<dyn FileSystem>,
    log: Arc<dyn InvocationLog>,
    runner: Arc<dyn crate::command_runner::CommandRunner>,
    status: Arc<dyn BuildStatus>,
    /// Precomputed once in `Build::construct`; read-only for the rest of
    /// the build (spec §4.4.2 "computeFingerprintMatchesMemo").
    match_memo: HashMap<FingerprintIndex, MatchResult>,
    state: Mutex<BuildState>,
    /// The `-k` value as given; `state.remaining_failures` counts down from
    /// it, so comparing against this tells `run()` whether any failure
    /// occurred.
    failures_allowed: i64,
    /// `-n`: the dispatch loop must not touch the real file system (no
    /// `mkdirs`, no rspfile writes, no deleting stale outputs/depfiles) even
    /// though a concrete `fs` is still needed to read current state for
    /// fingerprinting (spec §6, §C.3).
    dry_run: bool,
}

pub struct Build {
    inner: Arc<Inner>,
}

fn hash_to_step_map(manifest: &CompiledManifest) -> HashMap<Hash, StepId> {
    manifest
        .steps()
        .iter()
        .enumerate()
        .map(|(i, step)| (step.hash, StepId(i as u32)))
        .collect()
}

fn mark_reachable(
    manifest: &CompiledManifest,
    step_nodes: &mut [StepNode],
    edges: &mut HashSet<(u32, u32)>,
    id: StepId,
) -> Result<(), BuildError> {
    if step_nodes[id.0 as usize].should_build {
        return Ok(());
    }
    if step_nodes[id.0 as usize].currently_visited {
        return Err(BuildError::Invariant(format!(
            "cycle detected reaching step {} while constructing the build graph",
            id.0
        )));
    }
    step_nodes[id.0 as usize].currently_visited = true;
    step_nodes[id.0 as usize].should_build = true;
    step_nodes[id.0 as usize].no_direct_dependencies_built = true;

    for dep in manifest.step_dependencies(id) {
        if edges.insert((id.0, dep.0)) {
            step_nodes[id.0 as usize].dependencies_count += 1;
            step_nodes[dep.0 as usize].dependents.push(id);
        }
        mark_reachable(manifest, step_nodes, edges, dep)?;
    }

    step_nodes[id.0 as usize].currently_visited = false;
    Ok(())
}

/// BFS over the `a depends on b` edge set: can `from` reach `to`? Used to
/// detect cycles that `additional_dependencies` edges (not known to the
/// manifest compiler) would introduce.
fn can_reach(adj: &HashMap<u32, Vec<u32>>, from: u32, to: u32) -> bool {
    let mut seen = HashSet::new();
    let mut stack = vec![from];
    while let Some(node) = stack.pop() {
        if node == to {
            return true;
        }
        if !seen.insert(node) {
            continue;
        }
        if let Some(next) = adj.get(&node) {
            stack.extend(next.iter().copied());
        }
    }
    false
}

impl Build {
    /// Builds the scheduling graph, resolves `additional_dependencies`
    /// edges from the invocation log, and runs `discardCleanSteps` (spec
    /// §4.4.1, §4.4.2, §4.4.3). Returns the constructed `Build` plus the
    /// count of steps discarded as already-clean, for status reporting.
    #[allow(clippy::too_many_arguments)]
    pub fn construct(
        manifest: Arc<CompiledManifest>,
        invocations: Arc<Invocations>,
        fs: Arc<dyn FileSystem>,
        log: Arc<dyn InvocationLog>,
        runner: Arc<dyn crate::command_runner::CommandRunner>,
        status: Arc<dyn BuildStatus>,
        failures_allowed: i64,
        specified_steps: &[StepId],
        dry_run: bool,
    ) -> Result<(Build, usize), BuildError> {
        let roots: Vec<StepId> = if !specified_steps.is_empty() {
            specified_steps.to_vec()
        } else if !manifest.defaults.is_empty() {
            manifest.defaults.clone()
        } else {
            manifest.roots.clone()
        };

        let mut step_nodes = vec![StepNode::default(); manifest.step_count()];
        let mut edges: HashSet<(u32, u32)> = HashSet::new();
        let mut dep_adj: HashMap<u32, Vec<u32>> = HashMap::new();
        for &root in &roots {
            mark_reachable(&manifest, &mut step_nodes, &mut edges, root)?;
        }
        for &(a, b) in &edges {
            dep_adj.entry(a).or_default().push(b);
        }

        let hash_to_step = hash_to_step_map(&manifest);
        let should_build_steps: Vec<StepId> = (0..manifest.step_count())
            .filter(|&i| step_nodes[i].should_build)
            .map(|i| StepId(i as u32))
            .collect();

        for &step_id in &should_build_steps {
            let step = manifest.step(step_id);
            let Some(entry) = invocations.entry(&step.hash) else {
                continue;
            };
            for additional_hash in &entry.additional_dependencies {
                match hash_to_step.get(additional_hash) {
                    Some(&target) => {
                        if !step_nodes[target.0 as usize].should_build {
                            mark_reachable(&manifest, &mut step_nodes, &mut edges, target)?;
                            dep_adj.clear();
                            for &(a, b) in &edges {
                                dep_adj.entry(a).or_default().push(b);
                            }
                        }
                        if edges.contains(&(step_id.0, target.0)) {
                            continue;
                        }
                        if can_reach(&dep_adj, target.0, step_id.0) {
                            return Err(BuildError::AdditionalDependencyCycle(*additional_hash));
                        }
                        edges.insert((step_id.0, target.0));
                        dep_adj.entry(step_id.0).or_default().push(target.0);
                        step_nodes[step_id.0 as usize].dependencies_count += 1;
                        step_nodes[target.0 as usize].dependents.push(step_id);
                    }
                    None => {
                        // The step that produced this read no longer exists
                        // in the manifest; we can't tell whether it would
                        // still be a direct, un-rebuilt dependency, so the
                        // optimization is disabled for safety.
                        step_nodes[step_id.0 as usize].no_direct_dependencies_built = false;
                    }
                }
            }
        }

        let ready_steps: Vec<StepId> = (0..manifest.step_count())
            .filter(|&i| step_nodes[i].should_build && step_nodes[i].dependencies_count == 0)
            .map(|i| StepId(i as u32))
            .collect();

        status.set_total_steps(should_build_steps.len());

        let relevant_indices: HashSet<FingerprintIndex> = should_build_steps
            .iter()
            .filter_map(|&id| invocations.entry(&manifest.step(id).hash))
            .flat_map(|entry| entry.output_files.iter().chain(entry.input_files.iter()).copied())
            .collect();
        let match_memo = compute_fingerprint_matches(fs.as_ref(), &invocations, &relevant_indices);

        let mut state = BuildState::new(manifest.step_count(), failures_allowed);
        state.step_nodes = step_nodes;
        state.ready_steps = ready_steps;

        let inner = Arc::new(Inner {
            manifest,
            invocations,
            fs,
            log,
            runner,
            status,
            match_memo,
            state: Mutex::new(state),
            failures_allowed,
            dry_run,
        });

        let skipped = discard_clean_steps(&inner)?;
        Ok((Build { inner }, skipped))
    }

    /// Runs the scheduler to completion (spec §4.4.5 "Termination").
    pub fn run(&self) -> Result<BuildResult, BuildError> {
        dispatch::run(&self.inner)
    }
}

/// Runs `fingerprintMatches` for every fingerprint index any should-build
/// step's invocation entry references, on a fixed four-worker pool (spec
/// §4.4.2). Failures are folded into a `clean=false` verdict rather than
/// aborting the whole memoization pass — a step whose fingerprint can't be
/// read is conservatively treated as dirty.
fn compute_fingerprint_matches(
    fs: &dyn FileSystem,
    invocations: &Invocations,
    indices: &HashSet<FingerprintIndex>,
) -> HashMap<FingerprintIndex, MatchResult> {
    let indices: Vec<FingerprintIndex> = indices.iter().copied().collect();
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(4)
        .build()
        .expect("failed to build fingerprint-matching thread pool");
    let results: Vec<(FingerprintIndex, MatchResult)> = pool.install(|| {
        use rayon::prelude::*;
        indices
            .par_iter()
            .map(|&idx| {
                let path = invocations.fingerprint_path(idx);
                let fp = invocations.fingerprint(idx);
                let result = fingerprint::fingerprint_matches(fs, path, fp).unwrap_or(MatchResult {
                    clean: false,
                    should_update: false,
                    file_id: FileId::missing(),
                });
                (idx, result)
            })
            .collect()
    });
    results.into_iter().collect()
}

fn is_clean(inner: &Inner, step_id: StepId) -> Result<bool, BuildError> {
    let step = inner.manifest.step(step_id);
    if step.phony() {
        return Ok(true);
    }
    if step.pool_name == CONSOLE_POOL {
        // Console steps read stdin, a non-deterministic source; always
        // dirty (spec §4.4.3).
        return Ok(false);
    }
    if step.generator {
        if step.generator_inputs.is_empty() || step.generator_outputs.is_empty() {
            return Ok(false);
        }
        let mut max_input = None;
        for &input in &step.generator_inputs {
            let path = inner.manifest.path(input);
            let Some(stat) = inner.fs.stat(path).map_err(BuildError::Fs)? else {
                return Ok(false);
            };
            max_input = Some(max_input.map_or(stat.mtime, |m: crate::fs::Timestamp| m.max(stat.mtime)));
        }
        let mut min_output = None;
        for &output in &step.generator_outputs {
            let path = inner.manifest.path(output);
            let Some(stat) = inner.fs.stat(path).map_err(BuildError::Fs)? else {
                return Ok(false);
            };
            min_output = Some(min_output.map_or(stat.mtime, |m: crate::fs::Timestamp| m.min(stat.mtime)));
        }
        return Ok(max_input <= min_output);
    }

    let Some(entry) = inner.invocations.entry(&step.hash) else {
        return Ok(false);
    };

    let mut should_update = false;
    for idx in entry.output_files.iter().chain(entry.input_files.iter()) {
        let Some(result) = inner.match_memo.get(idx) else {
            return Ok(false);
        };
        if !result.clean {
            return Ok(false);
        }
        should_update |= result.should_update;
    }

    if should_update {
        let output_paths: Vec<Utf8PathBuf> = entry
            .output_files
            .iter()
            .map(|&i| inner.invocations.fingerprint_path(i).clone())
            .collect();
        let input_paths: Vec<Utf8PathBuf> = entry
            .input_files
            .iter()
            .map(|&i| inner.invocations.fingerprint_path(i).clone())
            .collect();
        inner
            .log
            .relog_command(
                step.hash,
                &output_paths,
                &input_paths,
                &entry.ignored_dependencies,
                &entry.additional_dependencies,
            )
            .map_err(BuildError::Log)?;
    }

    Ok(true)
}

/// The prior run's output `FileId`s for a step, keyed by path, read back
/// from its invocation entry. Empty for phony/generator steps, which are
/// never recorded in the log.
fn output_file_ids_for_build_step(inner: &Inner, step_id: StepId) -> Vec<(FileId, Utf8PathBuf)> {
    let step = inner.manifest.step(step_id);
    match inner.invocations.entry(&step.hash) {
        None => Vec::new(),
        Some(entry) => entry
            .output_files
            .iter()
            .map(|&i| {
                let fp = inner.invocations.fingerprint(i);
                (fp.stat.file_id(), inner.invocations.fingerprint_path(i).clone())
            })
            .collect(),
    }
}

/// Marks `step_id` done: records its outputs into `output_files` (failing
/// the build on a collision), and propagates readiness to dependents (spec
/// §4.4.4).
fn mark_step_node_as_done(
    inner: &Inner,
    step_id: StepId,
    outputs: &[(FileId, Utf8PathBuf)],
    step_was_skipped: bool,
) -> Result<Vec<StepId>, BuildError> {
    let mut state = inner.state.lock().unwrap();

    for (file_id, path) in outputs {
        if file_id.is_missing() {
            continue;
        }
        if let Some(&existing) = state.output_files.get(file_id) {
            if existing != step_id {
                return Err(BuildError::DuplicateWriter { path: path.clone() });
            }
        } else {
            state.output_files.insert(*file_id, step_id);
        }
    }

    let dependents = state.step_nodes[step_id.0 as usize].dependents.clone();
    let mut newly_ready = Vec::new();
    for dep in dependents {
        if !step_was_skipped && state.step_nodes[dep.0 as usize].no_direct_dependencies_built {
            let dep_step = inner.manifest.step(dep);
            let is_ignored = inner
                .invocations
                .entry(&dep_step.hash)
                .map(|e| e.ignored_dependencies.contains(&step_id.0))
                .unwrap_or(false);
            if !is_ignored {
                state.step_nodes[dep.0 as usize].no_direct_dependencies_built = false;
            }
        }
        state.step_nodes[dep.0 as usize].dependencies_count -= 1;
        if state.step_nodes[dep.0 as usize].dependencies_count == 0 {
            newly_ready.push(dep);
        }
    }
    Ok(newly_ready)
}

/// Pops the construction-time ready set and marks every clean or phony step
/// done, cascading through newly-ready dependents; non-clean steps become
/// the build's real starting `ready_steps` (spec §4.4.3). Returns the
/// number of non-phony steps discarded this way.
fn discard_clean_steps(inner: &Arc<Inner>) -> Result<usize, BuildError> {
    let mut queue: Vec<StepId> = {
        let mut state = inner.state.lock().unwrap();
        std::mem::take(&mut state.ready_steps)
    };
    let mut new_ready = Vec::new();
    let mut skipped = 0usize;

    while let Some(step_id) = queue.pop() {
        let step = inner.manifest.step(step_id);
        let clean = is_clean(inner, step_id)?;
        if step.phony() || clean {
            if !step.phony() {
                skipped += 1;
            }
            let outputs = output_file_ids_for_build_step(inner, step_id);
            let newly_ready = mark_step_node_as_done(inner, step_id, &outputs, true)?;
            queue.extend(newly_ready);
        } else {
            new_ready.push(step_id);
        }
    }

    inner.state.lock().unwrap().ready_steps = new_ready;
    Ok(skipped)
}

/// The `canSkipBuildCommand` fast path (spec §4.4.5): a step whose direct
/// dependencies never actually ran this build can still skip execution if
/// every one of its recorded inputs still matches reality.
fn can_skip_build_command(inner: &Inner, step_id: StepId) -> Result<bool, BuildError> {
    let step = inner.manifest.step(step_id);
    if !inner.state.lock().unwrap().step_nodes[step_id.0 as usize].no_direct_dependencies_built {
        return Ok(false);
    }
    let Some(entry) = inner.invocations.entry(&step.hash) else {
        return Ok(false);
    };

    for &idx in &entry.input_files {
        let path = inner.invocations.fingerprint_path(idx).clone();
        let fp = *inner.invocations.fingerprint(idx);
        let stat = inner.fs.stat(&path).map_err(BuildError::Fs)?;
        let matches = match stat {
            Some(stat) => {
                let file_id = stat.file_id();
                let known_hash = inner.state.lock().unwrap().written_files.get(&file_id).copied();
                match known_hash {
                    Some(hash) => fingerprint::fingerprint_matches_known(&fp, &stat, &hash),
                    None => fingerprint::fingerprint_matches(inner.fs.as_ref(), &path, &fp).map_err(|e| {
                        BuildError::Invariant(format!("failed to verify fingerprint for {path}: {e}"))
                    })?,
                }
            }
            None => fingerprint::fingerprint_matches(inner.fs.as_ref(), &path, &fp).map_err(|e| {
                BuildError::Invariant(format!("failed to verify fingerprint for {path}: {e}"))
            })?,
        };
        if !matches.clean {
            return Ok(false);
        }
    }
    Ok(true)
}
