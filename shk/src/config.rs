//! `Config`: resolved, immutable build parameters threaded through the
//! engine instead of read from globals (SPEC_FULL.md §B).

use camino::Utf8PathBuf;

/// Default manifest file name when `-f` is not given (spec §6).
pub const DEFAULT_MANIFEST: &str = "build.ninja";

#[derive(Clone, Debug)]
pub struct Config {
    /// Resolved working directory after applying `-C dir`.
    pub working_directory: Utf8PathBuf,
    pub manifest_path: Utf8PathBuf,
    /// The manifest's `builddir` variable, if any; `.shk_log` and its
    /// `.lock` sibling live here.
    pub build_dir: Utf8PathBuf,
    pub parallelism: usize,
    /// Raw `-k N` value: 0 means unlimited, otherwise the number of
    /// failures tolerated before the scheduler stops enqueuing new work
    /// (spec §6).
    pub keep_going: u32,
    /// `-l N`: pause starting new commands once the 1-minute load average
    /// exceeds this.
    pub load_average_ceiling: Option<f64>,
    /// `-n`: use an in-memory invocation log and a `DryRunCommandRunner`
    /// instead of touching disk or spawning processes.
    pub dry_run: bool,
    pub verbose: bool,
}

impl Config {
    pub fn log_path(&self) -> Utf8PathBuf {
        self.build_dir.join(".shk_log")
    }

    pub fn lock_path(&self) -> Utf8PathBuf {
        self.build_dir.join(".shk_log.lock")
    }

    /// The `remaining_failures` countdown `Build::construct` seeds
    /// `BuildState` with; `0` ("unlimited") becomes a very large number
    /// rather than a sentinel so the decrementing loop in `dispatch::run`
    /// needs no special case.
    pub fn failures_allowed(&self) -> i64 {
        if self.keep_going == 0 {
            i64::MAX
        } else {
            self.keep_going as i64
        }
    }
}

/// Ninja's own default: number of online CPUs plus a couple, capped low on
/// single-core machines. Used when `-j` is not given.
pub fn default_parallelism() -> usize {
    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    cpus + 2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_going_zero_means_unlimited() {
        let cfg = Config {
            working_directory: Utf8PathBuf::from("."),
            manifest_path: Utf8PathBuf::from("build.ninja"),
            build_dir: Utf8PathBuf::from("."),
            parallelism: 1,
            keep_going: 0,
            load_average_ceiling: None,
            dry_run: false,
            verbose: false,
        };
        assert_eq!(cfg.failures_allowed(), i64::MAX);
    }

    #[test]
    fn keep_going_n_is_passed_through() {
        let cfg = Config {
            working_directory: Utf8PathBuf::from("."),
            manifest_path: Utf8PathBuf::from("build.ninja"),
            build_dir: Utf8PathBuf::from("."),
            parallelism: 1,
            keep_going: 3,
            load_average_ceiling: None,
            dry_run: false,
            verbose: false,
        };
        assert_eq!(cfg.failures_allowed(), 3);
    }
}
