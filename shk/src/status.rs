//! `BuildStatus`: where the scheduler reports progress (spec §4.4.5 emits
//! `stepStarted`/`stepFinished`; §6 documents the `NINJA_STATUS` format).

use crate::manifest::{CompiledManifest, Step};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Sink for build progress. The scheduler calls these synchronously from
/// its own thread, so implementations don't need interior locking beyond
/// what they use for their own counters.
pub trait BuildStatus: Send + Sync {
    fn step_started(&self, step: &Step);
    fn step_finished(&self, step: &Step, success: bool, output: &str);
    /// Total number of steps the scheduler intends to (possibly) run, known
    /// once `Build::construct` finishes. Used to fill `%t` in the status
    /// format.
    fn set_total_steps(&self, total: usize);
}

/// Renders `NINJA_STATUS` (default `"[%s/%t] "`) before each step's
/// description or command, matching real ninja's progress line.
pub struct TerminalBuildStatus {
    format: String,
    started: AtomicUsize,
    finished: AtomicUsize,
    total: AtomicUsize,
}

impl TerminalBuildStatus {
    pub fn new() -> Self {
        let format = std::env::var("NINJA_STATUS").unwrap_or_else(|_| "[%s/%t] ".to_string());
        TerminalBuildStatus {
            format,
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
        }
    }

    fn render(&self) -> String {
        let started = self.started.load(Ordering::SeqCst);
        let total = self.total.load(Ordering::SeqCst);
        self.format
            .replace("%s", &started.to_string())
            .replace("%t", &total.to_string())
            .replace("%f", &self.finished.load(Ordering::SeqCst).to_string())
    }
}

impl Default for TerminalBuildStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildStatus for TerminalBuildStatus {
    fn step_started(&self, step: &Step) {
        self.started.fetch_add(1, Ordering::SeqCst);
        let label = if step.description.is_empty() {
            step.command.as_str()
        } else {
            step.description.as_str()
        };
        eprint!("{}{}\n", self.render(), label);
        let _ = std::io::stderr().flush();
    }

    fn step_finished(&self, _step: &Step, success: bool, output: &str) {
        self.finished.fetch_add(1, Ordering::SeqCst);
        if !success && !output.is_empty() {
            eprint!("{output}");
            let _ = std::io::stderr().flush();
        }
    }

    fn set_total_steps(&self, total: usize) {
        self.total.store(total, Ordering::SeqCst);
    }
}

/// Used for dry runs and tests: discards every report.
#[derive(Default)]
pub struct NullBuildStatus;

impl BuildStatus for NullBuildStatus {
    fn step_started(&self, _step: &Step) {}
    fn step_finished(&self, _step: &Step, _success: bool, _output: &str) {}
    fn set_total_steps(&self, _total: usize) {}
}

/// Helper for callers that want to prime `set_total_steps` from a manifest's
/// should-build set without threading `CompiledManifest` through every call
/// site.
pub fn report_total(status: &dyn BuildStatus, manifest: &CompiledManifest, should_build: &[bool]) {
    let total = (0..manifest.step_count()).filter(|&i| should_build[i]).count();
    status.set_total_steps(total);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_status_format_substitutes_counts() {
        std::env::remove_var("NINJA_STATUS");
        let status = TerminalBuildStatus::new();
        status.set_total_steps(3);
        assert_eq!(status.render(), "[0/3] ");
    }
}
