//! `CompiledManifest`: the indexed, validated build DAG (spec §3, §4.4.1).
//!
//! Manifest lexing/parsing is out of scope; callers hand us an already
//! decoded [`RawManifest`] (e.g. produced by a ninja-grammar front end that
//! lives elsewhere) and [`CompiledManifest::compile`] does the validation,
//! interning, and indexing that the rest of the engine relies on.

use crate::error::ManifestError;
use crate::path::canonicalize;
use camino::Utf8PathBuf;
use shk_hash::{Hash, HashWriter};
use std::collections::HashMap;

pub const CONSOLE_POOL: &str = "console";

/// Interned index into a manifest's path table.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct PathId(pub u32);

/// Interned index into `CompiledManifest::steps`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct StepId(pub u32);

impl StepId {
    fn idx(self) -> usize {
        self.0 as usize
    }
}

#[derive(Default)]
struct PathTable {
    paths: Vec<Utf8PathBuf>,
    index: HashMap<String, PathId>,
}

impl PathTable {
    fn intern(&mut self, path: &str) -> PathId {
        let canon = canonicalize(path);
        if let Some(&id) = self.index.get(&canon) {
            return id;
        }
        let id = PathId(self.paths.len() as u32);
        self.paths.push(Utf8PathBuf::from(canon.clone()));
        self.index.insert(canon, id);
        id
    }

    fn get(&self, id: PathId) -> &camino::Utf8Path {
        &self.paths[id.0 as usize]
    }
}

/// A step as handed to us, prior to compilation. Paths are plain strings;
/// `CompiledManifest::compile` interns and canonicalizes them.
///
/// `Serialize`/`Deserialize` back the CLI's JSON manifest loader (see
/// `bin/shk/manifest_loader.rs`) — the ninja-grammar lexer that would
/// normally produce this type is out of scope.
#[derive(Default, Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct RawStep {
    pub command: String,
    pub description: String,
    pub pool_name: String,
    pub rspfile: Option<String>,
    pub rspfile_content: String,
    pub depfile: Option<String>,
    pub inputs: Vec<String>,
    pub implicit_inputs: Vec<String>,
    pub order_only_dependencies: Vec<String>,
    pub outputs: Vec<String>,
    pub output_dirs: Vec<String>,
    pub generator: bool,
    pub restat: bool,
    /// Only meaningful for generator steps: the mtime-compared sets used by
    /// the generator cleanness rule in §4.4.3, which does not consult the
    /// invocation log.
    pub generator_inputs: Vec<String>,
    pub generator_outputs: Vec<String>,
}

#[derive(Default, Clone, Debug, serde::Serialize, serde::Deserialize)]
pub struct RawManifest {
    pub steps: Vec<RawStep>,
    /// Step indices to build when the user names no target on the CLI.
    pub defaults: Vec<usize>,
    /// Named pool depths declared by the manifest (the reserved `console`
    /// pool is added automatically and cannot be overridden).
    pub pools: Vec<(String, usize)>,
    pub build_dir: Option<String>,
}

#[derive(Clone, Debug)]
pub struct Step {
    pub command: String,
    pub description: String,
    pub pool_name: String,
    pub rspfile: Option<PathId>,
    pub rspfile_content: String,
    pub depfile: Option<PathId>,
    pub inputs: Vec<PathId>,
    pub implicit_inputs: Vec<PathId>,
    pub order_only_dependencies: Vec<PathId>,
    pub outputs: Vec<PathId>,
    pub output_dirs: Vec<PathId>,
    pub generator: bool,
    pub restat: bool,
    pub generator_inputs: Vec<PathId>,
    pub generator_outputs: Vec<PathId>,
    pub hash: Hash,
}

impl Step {
    pub fn phony(&self) -> bool {
        self.command.is_empty()
    }

    /// Every path this step reads or requires ordering against, excluding
    /// outputs — the union spec §3 calls `dependencies()`, before it is
    /// resolved down to producing step indices by [`CompiledManifest`].
    fn dependency_paths(&self) -> impl Iterator<Item = PathId> + '_ {
        self.inputs
            .iter()
            .chain(self.implicit_inputs.iter())
            .chain(self.order_only_dependencies.iter())
            .copied()
    }
}

fn compute_hash(raw: &RawStep, path_of: impl Fn(&str) -> String) -> Hash {
    let mut w = HashWriter::new();
    if !raw.generator {
        // Generator steps exclude the command from the hash so manifest
        // regeneration commands can be edited without perpetually
        // invalidating themselves.
        w.update_framed(raw.command.as_bytes());
    }
    for list in [
        &raw.inputs,
        &raw.implicit_inputs,
        &raw.order_only_dependencies,
        &raw.outputs,
    ] {
        w.update(&(list.len() as u32).to_le_bytes());
        for p in list {
            w.update_framed(path_of(p).as_bytes());
        }
    }
    w.update_framed(raw.rspfile_content.as_bytes());
    w.update(&[raw.restat as u8, raw.generator as u8]);
    w.finish()
}

pub struct CompiledManifest {
    steps: Vec<Step>,
    pub defaults: Vec<StepId>,
    pub roots: Vec<StepId>,
    /// Named pool depths, including the reserved `console` pool (depth 1).
    /// Depth 0 means unbounded.
    pub pools: Vec<(String, usize)>,
    pub build_dir: Option<Utf8PathBuf>,
    paths: PathTable,
    outputs_sorted: Vec<(String, StepId)>,
    inputs_sorted: Vec<(String, StepId)>,
    output_step: HashMap<PathId, StepId>,
}

impl CompiledManifest {
    pub fn compile(raw: RawManifest) -> Result<CompiledManifest, ManifestError> {
        let mut paths = PathTable::default();
        let mut steps = Vec::with_capacity(raw.steps.len());

        for raw_step in &raw.steps {
            let intern_list = |paths: &mut PathTable, list: &[String]| -> Vec<PathId> {
                list.iter().map(|p| paths.intern(p)).collect()
            };
            let hash = compute_hash(raw_step, canonicalize);
            steps.push(Step {
                command: raw_step.command.clone(),
                description: raw_step.description.clone(),
                pool_name: raw_step.pool_name.clone(),
                rspfile: raw_step.rspfile.as_deref().map(|p| paths.intern(p)),
                rspfile_content: raw_step.rspfile_content.clone(),
                depfile: raw_step.depfile.as_deref().map(|p| paths.intern(p)),
                inputs: intern_list(&mut paths, &raw_step.inputs),
                implicit_inputs: intern_list(&mut paths, &raw_step.implicit_inputs),
                order_only_dependencies: intern_list(&mut paths, &raw_step.order_only_dependencies),
                outputs: intern_list(&mut paths, &raw_step.outputs),
                output_dirs: intern_list(&mut paths, &raw_step.output_dirs),
                generator: raw_step.generator,
                restat: raw_step.restat,
                generator_inputs: intern_list(&mut paths, &raw_step.generator_inputs),
                generator_outputs: intern_list(&mut paths, &raw_step.generator_outputs),
                hash,
            });
        }

        let mut output_step: HashMap<PathId, StepId> = HashMap::new();
        for (i, step) in steps.iter().enumerate() {
            let step_id = StepId(i as u32);
            for &out in &step.outputs {
                if output_step.insert(out, step_id).is_some() {
                    return Err(ManifestError::DuplicateOutput(paths.get(out).to_path_buf()));
                }
            }
        }

        let mut pools = raw
            .pools
            .into_iter()
            .filter(|(name, _)| name != CONSOLE_POOL)
            .collect::<Vec<_>>();
        pools.push((CONSOLE_POOL.to_string(), 1));

        let mut manifest = CompiledManifest {
            steps,
            defaults: raw.defaults.into_iter().map(|i| StepId(i as u32)).collect(),
            roots: Vec::new(),
            pools,
            build_dir: raw.build_dir.map(Utf8PathBuf::from),
            paths,
            outputs_sorted: Vec::new(),
            inputs_sorted: Vec::new(),
            output_step,
        };

        manifest.check_acyclic()?;
        manifest.index_lookup_tables();
        manifest.roots = manifest.compute_roots();
        Ok(manifest)
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, id: StepId) -> &Step {
        &self.steps[id.idx()]
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn path(&self, id: PathId) -> &camino::Utf8Path {
        self.paths.get(id)
    }

    /// Resolves a step's declared dependencies down to the step indices
    /// that actually produce them. Paths with no producing step (source
    /// files) are silently dropped — they are leaves, not edges.
    pub fn step_dependencies(&self, id: StepId) -> Vec<StepId> {
        let step = self.step(id);
        let mut deps: Vec<StepId> = step
            .dependency_paths()
            .filter_map(|p| self.output_step.get(&p).copied())
            .collect();
        deps.sort_by_key(|s| s.0);
        deps.dedup();
        deps
    }

    pub fn output_step_of(&self, path: PathId) -> Option<StepId> {
        self.output_step.get(&path).copied()
    }

    fn index_lookup_tables(&mut self) {
        for (i, step) in self.steps.iter().enumerate() {
            let step_id = StepId(i as u32);
            for &out in &step.outputs {
                self.outputs_sorted
                    .push((self.paths.get(out).to_string(), step_id));
            }
            for &input in step.inputs.iter().chain(step.implicit_inputs.iter()) {
                self.inputs_sorted
                    .push((self.paths.get(input).to_string(), step_id));
            }
        }
        self.outputs_sorted.sort();
        self.inputs_sorted.sort();
    }

    fn compute_roots(&self) -> Vec<StepId> {
        let mut is_dependency = vec![false; self.steps.len()];
        for step in &self.steps {
            for dep in step.dependency_paths() {
                if let Some(producer) = self.output_step.get(&dep) {
                    is_dependency[producer.idx()] = true;
                }
            }
        }
        (0..self.steps.len())
            .filter(|&i| !is_dependency[i] && !self.steps[i].outputs.is_empty())
            .map(|i| StepId(i as u32))
            .collect()
    }

    fn check_acyclic(&self) -> Result<(), ManifestError> {
        #[derive(Clone, Copy, PartialEq)]
        enum State {
            Unvisited,
            Visiting,
            Done,
        }
        let mut state = vec![State::Unvisited; self.steps.len()];
        let mut stack_trace = Vec::new();

        fn visit(
            manifest: &CompiledManifest,
            id: StepId,
            state: &mut [State],
            stack_trace: &mut Vec<StepId>,
        ) -> Result<(), ManifestError> {
            match state[id.idx()] {
                State::Done => return Ok(()),
                State::Visiting => {
                    let names: Vec<String> = stack_trace
                        .iter()
                        .skip_while(|&&s| s != id)
                        .chain(std::iter::once(&id))
                        .map(|s| format!("{:?}", manifest.step(*s).outputs.first()))
                        .collect();
                    return Err(ManifestError::Cycle(names.join(" -> ")));
                }
                State::Unvisited => {}
            }
            state[id.idx()] = State::Visiting;
            stack_trace.push(id);
            for dep in manifest.step_dependencies(id) {
                visit(manifest, dep, state, stack_trace)?;
            }
            stack_trace.pop();
            state[id.idx()] = State::Done;
            Ok(())
        }

        for i in 0..self.steps.len() {
            visit(self, StepId(i as u32), &mut state, &mut stack_trace)?;
        }
        Ok(())
    }

    /// Binary-search lookup for a plain target name (spec §6 "Plain name
    /// matches any output path").
    pub fn find_output(&self, target: &str) -> Option<StepId> {
        let canon = canonicalize(target);
        self.outputs_sorted
            .binary_search_by(|(p, _)| p.as_str().cmp(canon.as_str()))
            .ok()
            .map(|i| self.outputs_sorted[i].1)
    }

    /// Resolves the `^` suffix syntax: every step that reads `target` as an
    /// (explicit or implicit) input.
    pub fn find_steps_reading(&self, target: &str) -> Vec<StepId> {
        let canon = canonicalize(target);
        let start = self
            .inputs_sorted
            .partition_point(|(p, _)| p.as_str() < canon.as_str());
        self.inputs_sorted[start..]
            .iter()
            .take_while(|(p, _)| p.as_str() == canon.as_str())
            .map(|(_, s)| *s)
            .collect()
    }

    pub fn pool_depth(&self, name: &str) -> Option<usize> {
        self.pools.iter().find(|(n, _)| n == name).map(|(_, d)| *d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(outputs: &[&str], inputs: &[&str]) -> RawStep {
        RawStep {
            command: "cmd".into(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[test]
    fn duplicate_output_is_rejected() {
        let raw = RawManifest {
            steps: vec![step(&["out"], &[]), step(&["out"], &[])],
            ..Default::default()
        };
        assert!(matches!(
            CompiledManifest::compile(raw),
            Err(ManifestError::DuplicateOutput(_))
        ));
    }

    #[test]
    fn cycle_is_rejected() {
        let raw = RawManifest {
            steps: vec![step(&["a"], &["b"]), step(&["b"], &["a"])],
            ..Default::default()
        };
        assert!(matches!(
            CompiledManifest::compile(raw),
            Err(ManifestError::Cycle(_))
        ));
    }

    #[test]
    fn roots_are_outputs_nobody_depends_on() {
        let raw = RawManifest {
            steps: vec![step(&["a"], &[]), step(&["b"], &["a"])],
            ..Default::default()
        };
        let m = CompiledManifest::compile(raw).unwrap();
        assert_eq!(m.roots, vec![StepId(1)]);
    }

    #[test]
    fn console_pool_always_present_with_depth_one() {
        let m = CompiledManifest::compile(RawManifest::default()).unwrap();
        assert_eq!(m.pool_depth(CONSOLE_POOL), Some(1));
    }

    #[test]
    fn output_lookup_binary_search() {
        let raw = RawManifest {
            steps: vec![step(&["out.o"], &["in.c"])],
            ..Default::default()
        };
        let m = CompiledManifest::compile(raw).unwrap();
        assert_eq!(m.find_output("out.o"), Some(StepId(0)));
        assert_eq!(m.find_steps_reading("in.c"), vec![StepId(0)]);
    }

    #[test]
    fn generator_step_hash_excludes_command() {
        let mut a = step(&["out"], &["in"]);
        a.generator = true;
        a.command = "cmd-v1".into();
        let mut b = a.clone();
        b.command = "cmd-v2".into();
        let ha = compute_hash(&a, canonicalize);
        let hb = compute_hash(&b, canonicalize);
        assert_eq!(ha, hb);
    }

    #[test]
    fn non_generator_step_hash_includes_command() {
        let a = step(&["out"], &["in"]);
        let mut b = a.clone();
        b.command = "other".into();
        let ha = compute_hash(&a, canonicalize);
        let hb = compute_hash(&b, canonicalize);
        assert_ne!(ha, hb);
    }
}
