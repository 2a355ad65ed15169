//! `-t compdb`: emits a JSON compilation database (the `compile_commands.json`
//! format consumed by clangd and friends), one entry per non-phony step that
//! has at least one input.

use super::ToolContext;
use anyhow::Result;
use serde::Serialize;

#[derive(Serialize)]
struct CompdbEntry {
    directory: String,
    command: String,
    file: String,
}

pub fn run(_args: &[String], ctx: &ToolContext) -> Result<i32> {
    let directory = ctx.config.working_directory.to_string();
    let mut entries = Vec::new();
    for step in ctx.manifest.steps() {
        if step.phony() {
            continue;
        }
        let Some(&first_input) = step.inputs.first() else {
            continue;
        };
        entries.push(CompdbEntry {
            directory: directory.clone(),
            command: step.command.clone(),
            file: ctx.manifest.path(first_input).to_string(),
        });
    }
    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(0)
}
