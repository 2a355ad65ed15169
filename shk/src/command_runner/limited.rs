//! `LimitedCommandRunner`: enforces the manifest's named-pool concurrency
//! limits (spec §4.1 "pools", §C.4). Sits between the scheduler and the
//! runner that actually executes commands.
//!
//! The `console` pool is reserved with depth 1 by [`crate::manifest`]; this
//! decorator doesn't special-case it beyond reading that depth out of the
//! table like any other pool.

use super::{Callback, CommandRunner, StepContext};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub struct LimitedCommandRunner<R> {
    inner: R,
    pool_depths: HashMap<String, usize>,
    running: Arc<Mutex<HashMap<String, usize>>>,
}

impl<R: CommandRunner> LimitedCommandRunner<R> {
    pub fn new(inner: R, pool_depths: HashMap<String, usize>) -> Self {
        LimitedCommandRunner {
            inner,
            pool_depths,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Whether the named pool has room for one more command. The unnamed
    /// default pool (`""`) is never limited. The scheduler must check this
    /// before handing a step to [`CommandRunner::invoke`]; unlike the
    /// capacity exposed by `can_run_more`, it's per-pool rather than global.
    pub fn pool_has_room(&self, pool_name: &str) -> bool {
        if pool_name.is_empty() {
            return true;
        }
        let depth = self.pool_depths.get(pool_name).copied().unwrap_or(usize::MAX);
        let running = self.running.lock().unwrap();
        running.get(pool_name).copied().unwrap_or(0) < depth
    }

    pub fn pool_depth(&self, pool_name: &str) -> Option<usize> {
        self.pool_depths.get(pool_name).copied()
    }
}

impl<R: CommandRunner> CommandRunner for LimitedCommandRunner<R> {
    fn invoke(&self, ctx: StepContext, callback: Callback) {
        let pool_name = ctx.pool_name.clone();
        if !pool_name.is_empty() {
            *self.running.lock().unwrap().entry(pool_name.clone()).or_insert(0) += 1;
        }
        let running = Arc::clone(&self.running);
        let wrapped: Callback = Box::new(move |result| {
            if !pool_name.is_empty() {
                if let Some(count) = running.lock().unwrap().get_mut(&pool_name) {
                    *count = count.saturating_sub(1);
                }
            }
            callback(result);
        });
        self.inner.invoke(ctx, wrapped);
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

    fn pool_has_room(&self, pool_name: &str) -> bool {
        LimitedCommandRunner::pool_has_room(self, pool_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_runner::dry_run::DryRunCommandRunner;
    use crate::manifest::StepId;

    fn ctx(pool_name: &str) -> StepContext {
        StepContext {
            step_id: StepId(0),
            command: "true".to_string(),
            pool_name: pool_name.to_string(),
            generator: false,
            console: false,
        }
    }

    #[test]
    fn default_pool_always_has_room() {
        let runner = LimitedCommandRunner::new(DryRunCommandRunner::new(), HashMap::new());
        assert!(runner.pool_has_room(""));
        assert!(runner.pool_has_room("unspecified-pool"));
    }

    #[test]
    fn named_pool_fills_up_and_drains_on_completion() {
        let mut depths = HashMap::new();
        depths.insert("link".to_string(), 1usize);
        let runner = LimitedCommandRunner::new(DryRunCommandRunner::new(), depths);

        assert!(runner.pool_has_room("link"));
        runner.invoke(ctx("link"), Box::new(|_| {}));
        assert!(!runner.pool_has_room("link"));

        runner.run_commands();
        assert!(runner.pool_has_room("link"));
    }
}
