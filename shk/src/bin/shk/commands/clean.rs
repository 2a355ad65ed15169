//! `-t clean`: removes declared outputs and forgets their invocation-log
//! entries, so the next build treats them as never having run.

use super::{default_targets, resolve_targets, topological_order, ToolContext};
use anyhow::Result;

pub fn run(args: &[String], ctx: &ToolContext) -> Result<i32> {
    let targets: Vec<String> = args.to_vec();
    let steps = if targets.is_empty() {
        default_targets(ctx.manifest)
    } else {
        resolve_targets(ctx.manifest, &targets)?
    };

    let mut removed = 0usize;
    for step_id in topological_order(ctx.manifest, &steps) {
        let step = ctx.manifest.step(step_id);
        if step.phony() {
            continue;
        }
        for &output in &step.outputs {
            let path = ctx.manifest.path(output);
            match ctx.fs.remove_file(path) {
                Ok(()) => {
                    println!("Cleaning... {path}");
                    removed += 1;
                }
                Err(e) => eprintln!("shk: could not remove {path}: {e}"),
            }
        }
        if let Err(e) = ctx.log.cleaned_command(step.hash) {
            eprintln!("shk: could not forget invocation log entry: {e}");
        }
    }
    println!("Cleaned {removed} files.");
    Ok(0)
}
