//! The dispatch loop: pulls ready steps off the scheduler, hands them to the
//! command runner, and reconciles completions back into scheduling state
//! (spec §4.4.4, §4.4.5, §4.6).

use super::{
    can_skip_build_command, mark_step_node_as_done, output_file_ids_for_build_step, BuildResult,
    Inner,
};
use crate::command_runner::{CommandResult, StepContext};
use crate::error::{BuildError, FsError};
use crate::fs::FileKind;
use crate::invocation_log::FingerprintedFile;
use crate::manifest::{StepId, CONSOLE_POOL};
use crate::path;
use camino::{Utf8Path, Utf8PathBuf};
use std::collections::HashSet;
use std::sync::Arc;

/// Drives the build to completion: repeatedly fills the runner's capacity
/// with ready steps, then blocks for at least one completion, until neither
/// ready work nor in-flight commands remain.
pub(super) fn run(inner: &Arc<Inner>) -> Result<BuildResult, BuildError> {
    if inner.state.lock().unwrap().ready_steps.is_empty() {
        return Ok(BuildResult::NoWorkToDo);
    }

    loop {
        enqueue_build_command(inner)?;

        let no_ready = inner.state.lock().unwrap().ready_steps.is_empty();
        let in_flight = inner.runner.size() > 0;
        if !in_flight {
            if no_ready {
                break;
            }
            // Nothing in flight and nothing runnable (pool exhaustion,
            // remaining_failures exhausted); there is no completion to wait
            // for, so stop rather than spin.
            break;
        }
        if inner.runner.run_commands() {
            return Ok(BuildResult::Interrupted);
        }
    }

    let had_failure = inner.state.lock().unwrap().remaining_failures < inner.failures_allowed;
    Ok(if had_failure {
        BuildResult::Failure
    } else {
        BuildResult::Success
    })
}

/// Pops the highest-priority ready step whose pool has room, if any.
fn pop_ready_step(inner: &Inner) -> Option<StepId> {
    let mut state = inner.state.lock().unwrap();
    for i in (0..state.ready_steps.len()).rev() {
        let step_id = state.ready_steps[i];
        let pool_name = &inner.manifest.step(step_id).pool_name;
        if inner.runner.pool_has_room(pool_name) {
            return Some(state.ready_steps.remove(i));
        }
    }
    None
}

fn enqueue_build_command(inner: &Arc<Inner>) -> Result<(), BuildError> {
    loop {
        if !inner.runner.can_run_more() {
            return Ok(());
        }
        if inner.state.lock().unwrap().remaining_failures <= 0 {
            return Ok(());
        }
        let Some(step_id) = pop_ready_step(inner) else {
            return Ok(());
        };

        let step = inner.manifest.step(step_id).clone();
        inner.status.step_started(&step);

        if step.phony() {
            // discard_clean_steps already handles the normal case; this only
            // guards against a phony step reached solely via an
            // additional_dependencies edge added after that pass ran.
            inner.status.step_finished(&step, true, "");
            command_bypassed(inner, step_id)?;
            continue;
        }

        if can_skip_build_command(inner, step_id)? {
            inner.status.step_finished(&step, true, "");
            command_bypassed(inner, step_id)?;
            continue;
        }

        if !inner.dry_run {
            if let Some(rspfile) = step.rspfile {
                let rsp_path = inner.manifest.path(rspfile);
                if let Some(parent) = path::parent(rsp_path) {
                    mkdirs_logging(inner, parent)?;
                }
                inner
                    .fs
                    .write_file(rsp_path, step.rspfile_content.as_bytes())
                    .map_err(BuildError::Fs)?;
            }
            for &dir in &step.output_dirs {
                mkdirs_logging(inner, inner.manifest.path(dir))?;
            }
            for &out in &step.outputs {
                if let Some(parent) = path::parent(inner.manifest.path(out)) {
                    mkdirs_logging(inner, parent)?;
                }
            }
            delete_old_outputs(inner, step_id)?;
        }

        inner.state.lock().unwrap().invoked_commands += 1;

        let console = step.pool_name == CONSOLE_POOL;
        let ctx = StepContext {
            step_id,
            command: step.command.clone(),
            pool_name: step.pool_name.clone(),
            generator: step.generator,
            console,
        };

        let inner_for_callback = Arc::clone(inner);
        inner.runner.invoke(
            ctx,
            Box::new(move |result| {
                if let Err(e) = command_done(&inner_for_callback, step_id, result) {
                    tracing::error!(error = %e, step = step_id.0, "bookkeeping failed after command completion");
                    inner_for_callback.state.lock().unwrap().remaining_failures = 0;
                }
            }),
        );
    }
}

fn command_bypassed(inner: &Arc<Inner>, step_id: StepId) -> Result<(), BuildError> {
    let outputs = output_file_ids_for_build_step(inner, step_id);
    let newly_ready = mark_step_node_as_done(inner, step_id, &outputs, true)?;
    inner.state.lock().unwrap().ready_steps.extend(newly_ready);
    Ok(())
}

fn is_not_found(err: &FsError) -> bool {
    err.source.kind() == std::io::ErrorKind::NotFound
}

/// Removes output files a previous run of this exact step produced but the
/// manifest no longer declares as an output, and prunes any now-empty
/// ancestor directories `shk` created for them (spec §4.4.4).
fn delete_old_outputs(inner: &Inner, step_id: StepId) -> Result<(), BuildError> {
    let step = inner.manifest.step(step_id);
    let Some(entry) = inner.invocations.entry(&step.hash) else {
        return Ok(());
    };
    let current_outputs: HashSet<&str> =
        step.outputs.iter().map(|&id| inner.manifest.path(id).as_str()).collect();

    let stale: Vec<Utf8PathBuf> = entry
        .output_files
        .iter()
        .map(|&i| inner.invocations.fingerprint_path(i).clone())
        .filter(|p| !current_outputs.contains(p.as_str()))
        .collect();

    for path in stale {
        match inner.fs.remove_file(&path) {
            Ok(()) => prune_created_ancestors(inner, &path)?,
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(BuildError::Fs(e)),
        }
    }
    Ok(())
}

/// Walks up from `path`'s parent, removing each ancestor directory that
/// `shk` itself created and that is now empty, stopping at the first
/// ancestor that either isn't ours or isn't empty (spec §4.2
/// "created_directories").
fn prune_created_ancestors(inner: &Inner, path: &Utf8Path) -> Result<(), BuildError> {
    let mut cur = path::parent(path);
    while let Some(dir) = cur {
        let Some(stat) = inner.fs.stat(dir).map_err(BuildError::Fs)? else {
            break;
        };
        if stat.kind != FileKind::Directory {
            break;
        }
        if !inner.invocations.was_created_directory(&dir.to_path_buf(), stat.file_id()) {
            break;
        }
        if !inner.fs.remove_dir_if_empty(dir).map_err(BuildError::Fs)? {
            break;
        }
        inner.log.removed_directory(dir).map_err(BuildError::Log)?;
        cur = path::parent(dir);
    }
    Ok(())
}

/// Creates `dir` and every missing ancestor, logging each one actually
/// created so a later, emptied-out build can prune them again.
fn mkdirs_logging(inner: &Inner, dir: &Utf8Path) -> Result<(), BuildError> {
    crate::fs::mkdirs(inner.fs.as_ref(), dir, |p| {
        inner.log.created_directory(p).map_err(|e| {
            FsError::new(p.to_path_buf(), std::io::Error::other(e.to_string()))
        })
    })
    .map_err(BuildError::Fs)
}

/// Reconciles one finished command: reports status, and on success records
/// a fresh invocation-log entry (discovering `ignored_dependencies` and
/// `additional_dependencies` against the manifest's declared edges) before
/// cascading readiness to dependents. A failed command decrements the
/// failure budget without touching scheduling state — its outputs are not
/// trusted and its dependents never become ready.
fn command_done(inner: &Arc<Inner>, step_id: StepId, result: CommandResult) -> Result<(), BuildError> {
    let step = inner.manifest.step(step_id).clone();
    inner.status.step_finished(&step, result.success, &result.output);

    // The depfile has been consumed (or was never produced) either way;
    // the rspfile is kept on failure for post-mortem inspection (spec
    // §4.4.5 "Command completion"). Neither is touched in a dry run: no
    // command actually ran, so nothing was produced or consumed to clean up.
    if !inner.dry_run {
        if let Some(depfile) = step.depfile {
            let _ = inner.fs.remove_file(inner.manifest.path(depfile));
        }
    }

    if !result.success {
        let mut state = inner.state.lock().unwrap();
        state.remaining_failures -= 1;
        return Ok(());
    }

    if !inner.dry_run {
        if let Some(rspfile) = step.rspfile {
            let _ = inner.fs.remove_file(inner.manifest.path(rspfile));
        }
    }

    let console_or_generator_untraced =
        result.input_files.is_empty() && result.output_files.is_empty() && (step.generator || step.pool_name == CONSOLE_POOL);
    let (input_paths, output_paths): (Vec<Utf8PathBuf>, Vec<Utf8PathBuf>) = if console_or_generator_untraced {
        let inputs = step
            .inputs
            .iter()
            .chain(step.implicit_inputs.iter())
            .map(|&id| inner.manifest.path(id).to_path_buf())
            .collect();
        let outputs = step.outputs.iter().map(|&id| inner.manifest.path(id).to_path_buf()).collect();
        (inputs, outputs)
    } else {
        (result.input_files, result.output_files)
    };

    let declared_deps = inner.manifest.step_dependencies(step_id);
    let mut used_producers: HashSet<StepId> = HashSet::new();
    let mut additional_dependencies = Vec::new();
    for p in &input_paths {
        if let Some(producer) = inner.manifest.find_output(p.as_str()) {
            if producer == step_id {
                continue;
            }
            used_producers.insert(producer);
            if !declared_deps.contains(&producer) {
                additional_dependencies.push(inner.manifest.step(producer).hash);
            }
        }
    }
    additional_dependencies.sort();
    additional_dependencies.dedup();

    let ignored_dependencies: Vec<u32> = declared_deps
        .iter()
        .filter(|d| !used_producers.contains(d))
        .map(|d| d.0)
        .collect();

    let output_fps: Vec<FingerprintedFile> =
        inner.log.fingerprint_files(&output_paths).map_err(BuildError::Log)?;
    let input_fps: Vec<FingerprintedFile> =
        inner.log.fingerprint_files(&input_paths).map_err(BuildError::Log)?;

    {
        let mut state = inner.state.lock().unwrap();
        for f in &output_fps {
            state.written_files.insert(f.fingerprint.stat.file_id(), f.fingerprint.hash);
        }
    }

    inner
        .log
        .ran_command(crate::invocation_log::RanCommand {
            step_hash: step.hash,
            outputs: &output_fps,
            inputs: &input_fps,
            ignored_dependencies: &ignored_dependencies,
            additional_dependencies: &additional_dependencies,
        })
        .map_err(BuildError::Log)?;

    let outputs: Vec<(crate::fileid::FileId, Utf8PathBuf)> = output_fps
        .into_iter()
        .map(|f| (f.fingerprint.stat.file_id(), f.path))
        .collect();
    let newly_ready = mark_step_node_as_done(inner, step_id, &outputs, false)?;
    inner.state.lock().unwrap().ready_steps.extend(newly_ready);
    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::build::Build;
    use crate::command_runner::dry_run::DryRunCommandRunner;
    use crate::fingerprint::Fingerprint;
    use crate::fs::mem::InMemoryFileSystem;
    use crate::fs::{FileKind, FileSystem, Stat, Timestamp};
    use crate::invocation_log::memory::InMemoryInvocationLog;
    use crate::invocations::{Entry, Invocations};
    use crate::manifest::{CompiledManifest, RawManifest, RawStep, StepId};
    use crate::status::NullBuildStatus;
    use camino::Utf8PathBuf;
    use std::sync::Arc;

    /// A dry run must never run `delete_old_outputs`: a step whose prior
    /// invocation-log entry recorded a now-undeclared output must leave that
    /// file on disk (spec §6, §C.3).
    #[test]
    fn dry_run_does_not_delete_a_stale_prior_output() {
        let manifest = Arc::new(
            CompiledManifest::compile(RawManifest {
                steps: vec![RawStep {
                    command: "cmd".into(),
                    outputs: vec!["out".into()],
                    ..Default::default()
                }],
                defaults: vec![0],
                ..Default::default()
            })
            .unwrap(),
        );
        let step_hash = manifest.step(StepId(0)).hash;

        let mem_fs = InMemoryFileSystem::new();
        mem_fs.put_file("stale", b"leftover".to_vec(), Timestamp(1));
        let fs: Arc<dyn FileSystem> = Arc::new(mem_fs);

        // A stale fingerprint that will never match whatever's really on
        // disk, so the step comes up dirty and `enqueue_build_command`
        // actually dispatches it instead of discarding it as clean.
        let stale_fp = Fingerprint {
            stat: Stat {
                kind: FileKind::Regular,
                size: 999,
                mode: 0,
                mtime: Timestamp(1),
                ino: 123_456,
                dev: 1,
            },
            racily_clean: false,
            hash: shk_hash::Hash::of(b"stale-marker"),
        };
        let mut invocations = Invocations::default();
        invocations.fingerprints.push((Utf8PathBuf::from("stale"), stale_fp));
        invocations.entries.insert(
            step_hash,
            Entry {
                output_files: vec![0],
                input_files: vec![],
                ignored_dependencies: vec![],
                additional_dependencies: vec![],
            },
        );

        let log = Arc::new(InMemoryInvocationLog::seeded(Arc::clone(&fs), invocations.clone()));
        let runner = Arc::new(DryRunCommandRunner::new());
        let status = Arc::new(NullBuildStatus);

        let (build, _skipped) = Build::construct(
            Arc::clone(&manifest),
            Arc::new(invocations),
            Arc::clone(&fs),
            log,
            runner,
            status,
            1,
            &[],
            true,
        )
        .unwrap();

        build.run().unwrap();

        assert_eq!(fs.read_file(camino::Utf8Path::new("stale")).unwrap(), b"leftover");
        assert!(!fs.stat(camino::Utf8Path::new("out")).unwrap().is_some());
    }
}
