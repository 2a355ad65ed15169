//! `-t commands`: prints the shell command line for every non-phony step
//! needed to build the given (or default) targets, in dependency order.

use super::{default_targets, resolve_targets, topological_order, ToolContext};
use anyhow::Result;

pub fn run(args: &[String], ctx: &ToolContext) -> Result<i32> {
    let steps = if args.is_empty() {
        default_targets(ctx.manifest)
    } else {
        resolve_targets(ctx.manifest, args)?
    };

    for step_id in topological_order(ctx.manifest, &steps) {
        let step = ctx.manifest.step(step_id);
        if step.phony() {
            continue;
        }
        println!("{}", step.command);
    }
    Ok(0)
}
