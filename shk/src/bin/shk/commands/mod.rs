//! The `-t TOOL` subtools (spec §6 "Tools").

pub mod clean;
pub mod commands;
pub mod compdb;
pub mod deps;
pub mod list;
pub mod query;
pub mod recompact;
pub mod targets;

use crate::edit_distance::spellcheck;
use anyhow::{anyhow, Result};
use shk::manifest::StepId;
use shk::{CompiledManifest, Config};
use std::sync::Arc;

/// Everything a tool needs: the compiled manifest, the parsed invocation
/// history, and a filesystem to act through.
pub struct ToolContext<'a> {
    pub manifest: &'a CompiledManifest,
    pub invocations: &'a shk::invocations::Invocations,
    pub fs: Arc<dyn shk::fs::FileSystem>,
    pub log: Arc<dyn shk::invocation_log::InvocationLog>,
    pub config: &'a Config,
}

pub const TOOL_NAMES: &[&str] = &[
    "clean", "commands", "compdb", "deps", "list", "query", "recompact", "targets",
];

/// Dispatches `-t TOOL args...`. Unknown tool names get an edit-distance
/// suggestion rather than a bare "not found" (spec §6, grounded in the
/// original's `spellcheckString` usage for mistyped tool names).
pub fn run(tool: &str, args: &[String], ctx: &ToolContext) -> Result<i32> {
    match tool {
        "clean" => clean::run(args, ctx),
        "commands" => commands::run(args, ctx),
        "compdb" => compdb::run(args, ctx),
        "deps" => deps::run(args, ctx),
        "list" => list::run(args, ctx),
        "query" => query::run(args, ctx),
        "recompact" => recompact::run(args, ctx),
        "targets" => targets::run(args, ctx),
        other => {
            let mut message = format!("unknown tool `{other}`");
            if let Some(suggestion) = spellcheck(other, TOOL_NAMES.iter().copied()) {
                message.push_str(&format!(", did you mean `{suggestion}`?"));
            }
            Err(anyhow!(message))
        }
    }
}

/// Resolves target names to the steps that produce them. A name ending in
/// `^` resolves to every step that reads it instead of the step that
/// produces it (spec §6 "`target^` selects dependents").
pub fn resolve_targets(manifest: &CompiledManifest, names: &[String]) -> Result<Vec<StepId>> {
    let mut steps = Vec::new();
    for name in names {
        if let Some(target) = name.strip_suffix('^') {
            let readers = manifest.find_steps_reading(target);
            if readers.is_empty() {
                return Err(unknown_target(manifest, target));
            }
            steps.extend(readers);
        } else {
            match manifest.find_output(name) {
                Some(step) => steps.push(step),
                None => return Err(unknown_target(manifest, name)),
            }
        }
    }
    steps.sort_by_key(|s| s.0);
    steps.dedup();
    Ok(steps)
}

fn unknown_target(manifest: &CompiledManifest, name: &str) -> anyhow::Error {
    let candidates: Vec<&str> = manifest
        .steps()
        .iter()
        .flat_map(|s| s.outputs.iter())
        .map(|&id| manifest.path(id).as_str())
        .collect();
    let mut message = format!("unknown target `{name}`");
    if let Some(suggestion) = spellcheck(name, candidates) {
        message.push_str(&format!(", did you mean `{suggestion}`?"));
    }
    anyhow!(message)
}

/// Every step reachable from `roots`, in an order where a step always
/// follows everything it depends on (so printing/removing in this order
/// never acts on a step before its dependencies).
pub fn topological_order(manifest: &CompiledManifest, roots: &[StepId]) -> Vec<StepId> {
    let mut order = Vec::new();
    let mut visited = vec![false; manifest.step_count()];

    fn visit(
        manifest: &CompiledManifest,
        id: StepId,
        visited: &mut [bool],
        order: &mut Vec<StepId>,
    ) {
        if visited[id.0 as usize] {
            return;
        }
        visited[id.0 as usize] = true;
        for dep in manifest.step_dependencies(id) {
            visit(manifest, dep, visited, order);
        }
        order.push(id);
    }

    for &root in roots {
        visit(manifest, root, &mut visited, &mut order);
    }
    order
}

/// The steps to act on when the user named none explicitly: the manifest's
/// defaults, or every root if there are no defaults (spec §6, mirroring the
/// build's own target-resolution fallback in `Build::construct`).
pub fn default_targets(manifest: &CompiledManifest) -> Vec<StepId> {
    if !manifest.defaults.is_empty() {
        manifest.defaults.clone()
    } else {
        manifest.roots.clone()
    }
}
