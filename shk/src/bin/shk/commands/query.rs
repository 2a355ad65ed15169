//! `-t query TARGET`: prints the step that produces a target and its
//! manifest-declared inputs and outputs (the static graph, unlike `-t deps`
//! which reports what was actually read on the last build).

use super::{resolve_targets, ToolContext};
use anyhow::{bail, Result};

pub fn run(args: &[String], ctx: &ToolContext) -> Result<i32> {
    if args.is_empty() {
        bail!("usage: shk -t query TARGET...");
    }

    for target in args {
        let steps = resolve_targets(ctx.manifest, std::slice::from_ref(target))?;
        println!("{target}:");
        for step_id in steps {
            let step = ctx.manifest.step(step_id);
            println!("  outputs:");
            for &id in &step.outputs {
                println!("    {}", ctx.manifest.path(id));
            }
            println!("  inputs:");
            for &id in step.inputs.iter().chain(step.implicit_inputs.iter()) {
                println!("    {}", ctx.manifest.path(id));
            }
            if !step.order_only_dependencies.is_empty() {
                println!("  order-only dependencies:");
                for &id in &step.order_only_dependencies {
                    println!("    {}", ctx.manifest.path(id));
                }
            }
        }
    }
    Ok(0)
}
