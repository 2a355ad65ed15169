//! CLI arguments: `shk` keeps ninja's short-flag surface rather than a
//! subcommand grammar (spec §6), since that is the interface manifests and
//! wrapper scripts in the wild already depend on.

use camino::Utf8PathBuf;
use clap::Parser;

#[derive(Parser, Clone, Debug)]
#[command(
    name = "shk",
    version,
    about = "A Ninja-compatible build system",
    after_help = "Run `shk -t list` for the list of available -t tools."
)]
pub struct Args {
    /// Change to DIR before doing anything else.
    #[arg(short = 'C', value_name = "DIR")]
    pub chdir: Option<Utf8PathBuf>,

    /// Specify input build file (default: build.ninja).
    #[arg(short = 'f', value_name = "FILE")]
    pub manifest_file: Option<Utf8PathBuf>,

    /// Run N jobs in parallel (default derived from the number of CPUs).
    #[arg(short = 'j', value_name = "N")]
    pub parallelism: Option<usize>,

    /// Keep going until N jobs fail (0 means never stop, default 1).
    #[arg(short = 'k', value_name = "N", default_value_t = 1)]
    pub keep_going: u32,

    /// Do not start new jobs once the 1-minute load average exceeds N.
    #[arg(short = 'l', value_name = "N")]
    pub load_average: Option<f64>,

    /// Dry run: don't run commands, just show what would be run.
    #[arg(short = 'n')]
    pub dry_run: bool,

    /// Show all command lines while building.
    #[arg(short = 'v')]
    pub verbose: bool,

    /// Run a subtool (use `-t list` to list subtools).
    #[arg(short = 't', value_name = "TOOL")]
    pub tool: Option<String>,

    /// Targets to build, or arguments to the `-t` tool.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub rest: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn parses_targets_after_flags() {
        let args = Args::parse_from(["shk", "-j4", "-k0", "all", "tests"]);
        assert_eq!(args.parallelism, Some(4));
        assert_eq!(args.keep_going, 0);
        assert_eq!(args.rest, vec!["all", "tests"]);
    }

    #[test]
    fn tool_name_and_tool_args_are_captured() {
        let args = Args::parse_from(["shk", "-t", "clean", "-g"]);
        assert_eq!(args.tool.as_deref(), Some("clean"));
        assert_eq!(args.rest, vec!["-g"]);
    }
}
