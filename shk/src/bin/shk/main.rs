//! `shk`: thin CLI front-end over the [`shk`] build engine library (spec
//! §1, §6, §7). Argument parsing, manifest loading, and subtool dispatch
//! live here; everything about dirtiness analysis, scheduling, and the
//! invocation log is the library's job.

mod args;
mod commands;
mod edit_distance;
mod manifest_loader;

use anyhow::{Context, Result};
use args::Args;
use camino::Utf8PathBuf;
use clap::Parser;
use commands::ToolContext;
use shk::command_runner::dry_run::DryRunCommandRunner;
use shk::command_runner::limited::LimitedCommandRunner;
use shk::command_runner::process_pool::ProcessPoolCommandRunner;
use shk::command_runner::tracing::TracingCommandRunner;
use shk::command_runner::CommandRunner;
use shk::config::{default_parallelism, DEFAULT_MANIFEST};
use shk::fs::real::RealFileSystem;
use shk::fs::FileSystem;
use shk::invocation_log::delayed::DelayedInvocationLog;
use shk::invocation_log::memory::InMemoryInvocationLog;
use shk::invocation_log::{open_persistent, InvocationLog};
use shk::lock::BuildLock;
use shk::status::{BuildStatus, TerminalBuildStatus};
use shk::{Build, BuildResult, CompiledManifest, Config};
use std::collections::HashMap;
use std::sync::Arc;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    match run(args) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("shk: error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { LevelFilter::DEBUG } else { LevelFilter::INFO };
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .with_env_var("SHK_LOG")
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();
}

fn run(args: Args) -> Result<i32> {
    if let Some(dir) = &args.chdir {
        std::env::set_current_dir(dir).with_context(|| format!("failed to chdir to `{dir}`"))?;
    }

    let cwd = Utf8PathBuf::from_path_buf(std::env::current_dir()?)
        .map_err(|p| anyhow::anyhow!("current directory `{}` is not valid UTF-8", p.display()))?;

    let manifest_path = args
        .manifest_file
        .clone()
        .unwrap_or_else(|| Utf8PathBuf::from(DEFAULT_MANIFEST));

    let raw = manifest_loader::load(&manifest_path)?;
    let manifest = Arc::new(CompiledManifest::compile(raw).context("failed to compile manifest")?);

    let build_dir = manifest.build_dir.clone().unwrap_or_else(|| cwd.clone());
    let config = Config {
        working_directory: cwd,
        manifest_path,
        build_dir,
        parallelism: args.parallelism.unwrap_or_else(default_parallelism),
        keep_going: args.keep_going,
        load_average_ceiling: args.load_average,
        dry_run: args.dry_run,
        verbose: args.verbose,
    };

    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem::new());
    // `-n` must not touch the real file system at all beyond reading it for
    // fingerprinting, matching the original's
    // `if (!_build_dir.empty() && !_config.dry_run) { MakeDirs(...) }`.
    if !config.dry_run {
        shk::fs::mkdirs(fs.as_ref(), &config.build_dir, |_| Ok(())).context("failed to create build directory")?;
    }

    let _lock = BuildLock::acquire(&config.lock_path()).context("failed to acquire build log lock")?;

    if let Some(tool) = &args.tool {
        // Subtools (`clean`, `recompact`, …) own their own writes to the log
        // independent of `-n`, so they always get a writable handle.
        let (invocations, _needs_recompaction, warning, persistent_log) =
            open_persistent(Arc::clone(&fs), &config.log_path()).context("failed to open invocation log")?;
        if let Some(reason) = warning {
            tracing::warn!(%reason, "invocation log recovered from a parse error");
        }
        let log: Arc<dyn InvocationLog> = Arc::new(persistent_log);
        let ctx = ToolContext {
            manifest: &manifest,
            invocations: &invocations,
            fs: Arc::clone(&fs),
            log,
            config: &config,
        };
        return match commands::run(tool, &args.rest, &ctx) {
            Ok(code) => Ok(code),
            Err(e) => {
                eprintln!("shk: error: {e:#}");
                Ok(1)
            }
        };
    }

    let specified_steps = if args.rest.is_empty() {
        Vec::new()
    } else {
        commands::resolve_targets(&manifest, &args.rest)?
    };

    let pool_depths: HashMap<String, usize> = manifest
        .pools
        .iter()
        .filter(|&&(_, depth)| depth > 0)
        .map(|(name, depth)| (name.clone(), *depth))
        .collect();

    let status: Arc<dyn BuildStatus> = Arc::new(TerminalBuildStatus::new());

    // `-n` parses `.shk_log` for dirtiness analysis but never opens it for
    // writing — `PersistentInvocationLog::open` would create the file (and
    // write its header) on a fresh build directory, which a dry run must
    // never do (spec §6, §C.3; ground-truth original's
    // `if (!_config.dry_run) { … OpenForWrite … }`).
    let (runner, log, invocations, needs_recompaction, delayed): (
        Arc<dyn CommandRunner>,
        Arc<dyn InvocationLog>,
        shk::invocations::Invocations,
        bool,
        Option<Arc<DelayedInvocationLog>>,
    ) = if config.dry_run {
        let (invocations, needs_recompaction, warning) =
            shk::invocation_log::read_invocations(fs.as_ref(), &config.log_path())
                .context("failed to read invocation log")?;
        if let Some(reason) = warning {
            tracing::warn!(%reason, "invocation log recovered from a parse error");
        }
        let runner = LimitedCommandRunner::new(DryRunCommandRunner::new(), pool_depths);
        let log = Arc::new(InMemoryInvocationLog::seeded(Arc::clone(&fs), invocations.clone()));
        (Arc::new(runner), log, invocations, needs_recompaction, None)
    } else {
        let (invocations, needs_recompaction, warning, persistent_log) =
            open_persistent(Arc::clone(&fs), &config.log_path()).context("failed to open invocation log")?;
        if let Some(reason) = warning {
            tracing::warn!(%reason, "invocation log recovered from a parse error");
        }
        let process = ProcessPoolCommandRunner::new(config.parallelism, config.load_average_ceiling);
        let traced = TracingCommandRunner::new(process, Arc::clone(&fs));
        let runner = LimitedCommandRunner::new(traced, pool_depths);
        let delayed = Arc::new(DelayedInvocationLog::new(Arc::clone(&fs), Box::new(persistent_log)));
        let log: Arc<dyn InvocationLog> = Arc::clone(&delayed) as Arc<dyn InvocationLog>;
        (Arc::new(runner), log, invocations, needs_recompaction, Some(delayed))
    };

    let invocations_for_build = Arc::new(invocations);
    let (build, skipped) = Build::construct(
        Arc::clone(&manifest),
        invocations_for_build,
        Arc::clone(&fs),
        log,
        runner,
        status,
        config.failures_allowed(),
        &specified_steps,
        config.dry_run,
    )
    .context("failed to construct build graph")?;
    tracing::debug!(skipped, "steps already clean, not rebuilt");

    let result = build.run().context("build failed")?;

    if let Some(delayed) = delayed {
        delayed.write_all().context("failed to flush invocation log")?;
        drop(delayed);
        if needs_recompaction {
            shk::invocation_log::recompact(fs.as_ref(), &config.log_path())
                .context("failed to recompact invocation log")?;
        }
    }

    Ok(match result {
        BuildResult::Success | BuildResult::NoWorkToDo => 0,
        BuildResult::Failure => 1,
        BuildResult::Interrupted => 2,
    })
}
