//! # Command-Line Configuration
//!
//! Argument parsing for the driver/worker CLI (§6). Mirrors the engine's two
//! run modes: a human invokes the driver (`--module`, `--workers`, `--port`),
//! and the driver re-execs itself into hidden worker processes
//! (`--dtest-worker`, `--worker-id`, `--driver-super-addr`) that a user never
//! types directly.

use clap::builder::styling::{AnsiColor, Styles};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// A distributed, sandboxed test-execution engine.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Only run tests in these modules (repeatable; default: all registered modules)
    #[arg(long = "module", value_name = "MODULE")]
    pub modules: Vec<String>,

    /// Number of workers a distributed test may allocate, at most
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Port the driver's super socket binds to (0 = ephemeral)
    #[arg(long, default_value_t = 0)]
    pub port: u16,

    /// Output file for the persisted JSON report
    #[arg(short = 'o', long, default_value = "dtest-report.json")]
    pub output: PathBuf,

    /// Silence the colorized per-test console summary
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Increase diagnostic log verbosity on stderr (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Internal: run as a worker instead of a driver. Never set by hand.
    #[arg(long, hide = true)]
    pub dtest_worker: bool,

    /// Internal: this worker's numeric id, assigned by the driver.
    #[arg(long, hide = true)]
    pub worker_id: Option<u32>,

    /// Internal: address of the driver's super socket this worker reports to.
    #[arg(long, hide = true, value_parser = crate::transport::parse_addr)]
    pub driver_super_addr: Option<SocketAddr>,
}

/// Validated, driver-side configuration derived from [`Args`].
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub modules: Option<std::collections::HashSet<String>>,
    pub max_workers: usize,
    pub output: PathBuf,
    pub quiet: bool,
    pub verbose: u8,
}

impl From<&Args> for EngineConfig {
    fn from(args: &Args) -> Self {
        let modules = if args.modules.is_empty() { None } else { Some(args.modules.iter().cloned().collect()) };
        EngineConfig { modules, max_workers: args.workers.max(1), output: args.output.clone(), quiet: args.quiet, verbose: args.verbose }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_well_formed() {
        Args::command().debug_assert();
    }

    #[test]
    fn empty_module_filter_means_run_everything() {
        let args = Args::parse_from(["dtest-rs"]);
        let config = EngineConfig::from(&args);
        assert!(config.modules.is_none());
    }

    #[test]
    fn module_filter_collects_repeated_flags() {
        let args = Args::parse_from(["dtest-rs", "--module", "a", "--module", "b"]);
        let config = EngineConfig::from(&args);
        assert_eq!(config.modules.unwrap().len(), 2);
    }
}
