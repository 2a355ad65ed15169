//! The `CommandRunner` capability (spec §4.5, §4.6, §C.4): executes one
//! step's command and reports back what it read/wrote.

pub mod dry_run;
pub mod limited;
pub mod process_pool;
pub mod tracing;

use crate::manifest::StepId;
use camino::Utf8PathBuf;
use std::sync::Arc;

/// Everything a runner needs to know about the step it is invoking, beyond
/// the literal command line.
#[derive(Clone, Debug)]
pub struct StepContext {
    pub step_id: StepId,
    pub command: String,
    pub pool_name: String,
    pub generator: bool,
    /// True for the reserved `console` pool: stdio is handed to the child
    /// directly and the step is never traced (spec §4.5).
    pub console: bool,
}

/// What a finished (or failed) command reports back to the scheduler.
#[derive(Clone, Debug, Default)]
pub struct CommandResult {
    pub success: bool,
    /// Combined stdout+stderr, shown by `BuildStatus` on failure or in `-v`
    /// mode.
    pub output: String,
    /// Paths the command read, as discovered by tracing (or declared,
    /// for generator/console steps that skip tracing).
    pub input_files: Vec<Utf8PathBuf>,
    /// Paths the command wrote.
    pub output_files: Vec<Utf8PathBuf>,
}

pub type Callback = Box<dyn FnOnce(CommandResult) + Send>;

/// A capability that can run shell commands, possibly many in parallel,
/// reporting completions back through callbacks registered at `invoke` time
/// (spec §4.4.5, §4.6, §9 "Asynchronous command completion").
pub trait CommandRunner: Send + Sync {
    fn invoke(&self, ctx: StepContext, callback: Callback);

    /// Number of commands currently in flight.
    fn size(&self) -> usize;

    /// Whether another command could be started right now (capacity and,
    /// for the real runner, load-average headroom).
    fn can_run_more(&self) -> bool;

    /// Blocks until at least one in-flight command completes (invoking its
    /// callback) or an interrupt signal arrives. Returns `true` if
    /// interrupted.
    fn run_commands(&self) -> bool;

    /// Whether the named pool has room for one more command. The scheduler
    /// checks this before calling `invoke` for a step assigned to a pool, in
    /// addition to `can_run_more`'s global capacity check. Default: every
    /// pool is unlimited; only [`limited::LimitedCommandRunner`] overrides
    /// this.
    fn pool_has_room(&self, _pool_name: &str) -> bool {
        true
    }
}

/// Lets an `Arc`-owned runner (e.g. [`process_pool::ProcessPoolCommandRunner`],
/// which must live behind an `Arc` for its signal-watcher thread) be used
/// anywhere a generic `R: CommandRunner` layer is expected.
impl<T: CommandRunner + ?Sized> CommandRunner for Arc<T> {
    fn invoke(&self, ctx: StepContext, callback: Callback) {
        (**self).invoke(ctx, callback)
    }

    fn size(&self) -> usize {
        (**self).size()
    }

    fn can_run_more(&self) -> bool {
        (**self).can_run_more()
    }

    fn run_commands(&self) -> bool {
        (**self).run_commands()
    }

    fn pool_has_room(&self, pool_name: &str) -> bool {
        (**self).pool_has_room(pool_name)
    }
}
