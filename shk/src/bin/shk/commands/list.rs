//! `-t list`: prints every subtool name and a one-line description (spec
//! §C.1, recovered from the original's `Tool` table in `shk.cpp`).

use super::ToolContext;
use anyhow::Result;

const DESCRIPTIONS: &[(&str, &str)] = &[
    ("clean", "remove built files"),
    ("commands", "list all commands required to rebuild given targets"),
    ("compdb", "dump JSON compilation database for given targets"),
    ("deps", "show dependencies recorded for given targets"),
    ("list", "list available subtools"),
    ("query", "show inputs/outputs for a given target"),
    ("recompact", "recompact the persistent invocation log"),
    ("targets", "list all targets the build file knows how to build"),
];

pub fn run(_args: &[String], _ctx: &ToolContext) -> Result<i32> {
    println!("shk subtools:");
    let width = DESCRIPTIONS.iter().map(|(name, _)| name.len()).max().unwrap_or(0);
    for (name, description) in DESCRIPTIONS {
        println!("  {name:width$}  {description}");
    }
    Ok(0)
}
