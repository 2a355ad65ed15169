//! `-t targets`: lists every output path the manifest knows how to build,
//! marking roots and defaults.

use super::ToolContext;
use anyhow::Result;
use shk::manifest::StepId;

pub fn run(_args: &[String], ctx: &ToolContext) -> Result<i32> {
    let is_root: std::collections::HashSet<StepId> = ctx.manifest.roots.iter().copied().collect();
    let is_default: std::collections::HashSet<StepId> =
        ctx.manifest.defaults.iter().copied().collect();

    let mut rows: Vec<(String, &'static str)> = Vec::new();
    for (i, step) in ctx.manifest.steps().iter().enumerate() {
        let step_id = StepId(i as u32);
        let marker = if is_default.contains(&step_id) {
            " (default)"
        } else if is_root.contains(&step_id) {
            " (root)"
        } else {
            ""
        };
        for &output in &step.outputs {
            rows.push((ctx.manifest.path(output).to_string(), marker));
        }
    }
    rows.sort();
    for (path, marker) in rows {
        println!("{path}{marker}");
    }
    Ok(0)
}
