//! `DryRunCommandRunner`: backs `-n`. Every invocation is reported as an
//! immediate success without ever spawning a process (spec §C.3).

use super::{Callback, CommandResult, CommandRunner, StepContext};
use std::sync::Mutex;

/// Accepts invocations, queues their callbacks, and fires them back on the
/// next `run_commands()` call — mirroring the real runner's asynchronous
/// completion protocol closely enough that the scheduler can't tell the
/// difference.
#[derive(Default)]
pub struct DryRunCommandRunner {
    pending: Mutex<Vec<(StepContext, Callback)>>,
}

impl DryRunCommandRunner {
    pub fn new() -> Self {
        DryRunCommandRunner::default()
    }
}

impl CommandRunner for DryRunCommandRunner {
    fn invoke(&self, ctx: StepContext, callback: Callback) {
        self.pending.lock().unwrap().push((ctx, callback));
    }

    fn size(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    fn can_run_more(&self) -> bool {
        true
    }

    fn run_commands(&self) -> bool {
        let queued = std::mem::take(&mut *self.pending.lock().unwrap());
        for (_ctx, callback) in queued {
            callback(CommandResult {
                success: true,
                output: String::new(),
                input_files: Vec::new(),
                output_files: Vec::new(),
            });
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::StepId;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn every_invocation_reports_success_without_running_anything() {
        let runner = DryRunCommandRunner::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        runner.invoke(
            StepContext {
                step_id: StepId(0),
                command: "this is not a real shell command".to_string(),
                pool_name: String::new(),
                generator: false,
                console: false,
            },
            Box::new(move |result| {
                assert!(result.success);
                calls2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        runner.run_commands();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
