//! `TracingCommandRunner`: wraps an inner [`CommandRunner`] and discovers a
//! command's actual inputs/outputs by shelling out through the external
//! `shk-trace` helper (spec §4.5). Generator and console-pool steps skip
//! tracing entirely — their cleanness criteria don't need it.
//!
//! `shk-trace` itself (the syscall-level tracer) is an external helper
//! binary, out of scope for this crate; only the protocol for invoking it
//! and the format of the trace file it leaves behind (`crate::trace`) are
//! implemented here.

use super::{Callback, CommandResult, CommandRunner, StepContext};
use crate::fs::FileSystem;
use crate::trace::{is_ignored, Trace};
use camino::Utf8Path;
use std::sync::Arc;

pub struct TracingCommandRunner<R> {
    inner: R,
    fs: Arc<dyn FileSystem>,
}

impl<R: CommandRunner> TracingCommandRunner<R> {
    pub fn new(inner: R, fs: Arc<dyn FileSystem>) -> Self {
        TracingCommandRunner { inner, fs }
    }

    fn should_trace(ctx: &StepContext) -> bool {
        !ctx.generator && !ctx.console && !ctx.command.trim().is_empty()
    }
}

impl<R: CommandRunner> CommandRunner for TracingCommandRunner<R> {
    fn invoke(&self, ctx: StepContext, callback: Callback) {
        if !Self::should_trace(&ctx) {
            self.inner.invoke(ctx, callback);
            return;
        }

        let tmp = match self.fs.mkstemp(Utf8Path::new("."), ".shk_trace.") {
            Ok(path) => path,
            Err(e) => {
                callback(CommandResult {
                    success: false,
                    output: format!("failed to create trace temp file: {e}"),
                    input_files: Vec::new(),
                    output_files: Vec::new(),
                });
                return;
            }
        };

        let traced_command = format!("shk-trace -f {} -- {}", shell_quote(tmp.as_str()), ctx.command);
        let mut traced_ctx = ctx.clone();
        traced_ctx.command = traced_command;

        let fs = Arc::clone(&self.fs);
        let tmp_for_callback = tmp.clone();
        let wrapped: Callback = Box::new(move |mut result| {
            if result.success {
                match read_trace(fs.as_ref(), &tmp_for_callback) {
                    Ok(trace) => {
                        if !trace.errors.is_empty() {
                            result.success = false;
                            result.output.push_str(&trace.errors.join("\n"));
                        }
                        result.input_files.extend(
                            trace
                                .inputs
                                .into_iter()
                                .filter(|p| !is_ignored(p))
                                .map(camino::Utf8PathBuf::from),
                        );
                        result.output_files.extend(
                            trace
                                .outputs
                                .into_iter()
                                .filter(|p| !is_ignored(p))
                                .map(camino::Utf8PathBuf::from),
                        );
                    }
                    Err(e) => {
                        result.success = false;
                        result.output.push_str(&format!("failed to read trace: {e}"));
                    }
                }
            }
            let _ = fs.remove_file(&tmp_for_callback);
            callback(result);
        });

        self.inner.invoke(traced_ctx, wrapped);
    }

    fn size(&self) -> usize {
        self.inner.size()
    }

    fn can_run_more(&self) -> bool {
        self.inner.can_run_more()
    }

    fn run_commands(&self) -> bool {
        self.inner.run_commands()
    }
}

fn read_trace(fs: &dyn FileSystem, path: &Utf8Path) -> Result<Trace, crate::error::LogError> {
    let mut reader = fs
        .open_read(path)
        .map_err(crate::error::LogError::Fs)?;
    let mut buf = Vec::new();
    std::io::Read::read_to_end(&mut reader, &mut buf).map_err(|e| {
        crate::error::LogError::Fs(crate::error::FsError::new(path.to_path_buf(), e))
    })?;
    Trace::decode(&buf)
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_runner::dry_run::DryRunCommandRunner;
    use crate::fs::mem::InMemoryFileSystem;
    use crate::manifest::StepId;

    #[test]
    fn generator_steps_are_never_traced() {
        let fs: Arc<dyn FileSystem> = Arc::new(InMemoryFileSystem::new());
        let runner = TracingCommandRunner::new(DryRunCommandRunner::new(), fs);
        runner.invoke(
            StepContext {
                step_id: StepId(0),
                command: "touch out".to_string(),
                pool_name: String::new(),
                generator: true,
                console: false,
            },
            Box::new(|result| assert!(result.success)),
        );
        runner.run_commands();
    }
}
