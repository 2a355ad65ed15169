//! `-t recompact`: rewrites the invocation log keeping only live records
//! (spec §4.2 "Recompaction"), grounded directly in the original's
//! `tools/recompact.cpp`.

use super::ToolContext;
use anyhow::{Context, Result};

pub fn run(_args: &[String], ctx: &ToolContext) -> Result<i32> {
    let path = ctx.config.log_path();
    shk::invocation_log::recompact(ctx.fs.as_ref(), &path)
        .with_context(|| format!("failed to recompact `{path}`"))?;
    Ok(0)
}
