//! `-t deps`: prints the input files recorded for a target the last time it
//! was built, as read back from the invocation log (not the manifest's
//! static dependency lists, which `-t query` covers instead).

use super::{default_targets, resolve_targets, ToolContext};
use anyhow::Result;

pub fn run(args: &[String], ctx: &ToolContext) -> Result<i32> {
    let steps = if args.is_empty() {
        default_targets(ctx.manifest)
    } else {
        resolve_targets(ctx.manifest, args)?
    };

    for step_id in steps {
        let step = ctx.manifest.step(step_id);
        let label = step.outputs.first().map(|&id| ctx.manifest.path(id).as_str()).unwrap_or("(phony)");
        match ctx.invocations.entry(&step.hash) {
            None => println!("{label}: deps not recorded"),
            Some(entry) => {
                println!("{label}:");
                for &idx in &entry.input_files {
                    println!("    {}", ctx.invocations.fingerprint_path(idx));
                }
            }
        }
        println!();
    }
    Ok(0)
}
