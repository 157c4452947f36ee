//! Boundcheck Trace Replayer
//!
//! Replays a trace of allocations and pointer operations through the bounds
//! checker. Exits with status 1 on a bounds violation and 2 when the trace
//! itself cannot be run.

use anyhow::{Context, Result};
use boundcheck::memory::parse_addr;
use boundcheck::trace::{self, Replayer};
use boundcheck::{Addr, BoundChecker, Config, UntrackedPolicy, Violation, Zone};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

/// Replays allocation traces through the bounds checker.
#[derive(Parser, Debug)]
#[command(name = "boundcheck")]
#[command(version)]
#[command(about = "Replays allocation traces through the bounds checker", long_about = None)]
struct Cli {
    /// Trace file to replay
    #[arg(value_name = "TRACE")]
    trace: PathBuf,

    /// Treat untracked memory as invalid
    #[arg(long)]
    strict: bool,

    /// Zone to mark invalid at startup, can be repeated
    #[arg(long = "reserve", value_name = "ADDR:SIZE")]
    reserved: Vec<Zone>,

    /// First address of the heap
    #[arg(long, value_name = "ADDR", value_parser = parse_addr)]
    heap_base: Option<Addr>,

    /// Size of the heap in bytes
    #[arg(long, value_name = "SIZE", value_parser = parse_addr)]
    heap_size: Option<u32>,

    /// Print the region table after a successful replay
    #[arg(long)]
    dump: bool,
}

impl Cli {
    /// Applies the command line on top of the environment configuration.
    fn config(&self) -> Result<Config> {
        let mut config = Config::from_env()?;
        if self.strict {
            config.untracked = UntrackedPolicy::Forbid;
        }
        if let Some(base) = self.heap_base {
            config.heap_base = base;
        }
        if let Some(size) = self.heap_size {
            config.heap_size = size;
        }
        config.reserved_zones.extend_from_slice(&self.reserved);
        Ok(config)
    }
}

fn main() -> ExitCode {
    let log_level = std::env::var("BCHECK_LOG").unwrap_or_else(|_| "info".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match cli.config() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e:#}");
            return ExitCode::from(2);
        }
    };
    let on_violation = config.on_violation;

    match replay(&cli, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => match e.downcast_ref::<Violation>() {
            Some(violation) => on_violation.raise(*violation),
            None => {
                error!("Replay failed: {e:#}");
                ExitCode::from(2)
            }
        },
    }
}

fn replay(cli: &Cli, config: Config) -> Result<()> {
    let source = std::fs::read_to_string(&cli.trace)
        .with_context(|| format!("cannot read trace `{}`", cli.trace.display()))?;
    let lines = trace::parse(&source)?;

    let mut replayer = Replayer::new(BoundChecker::new(config)?);
    let mut stdout = std::io::stdout().lock();
    replayer.run(&lines, &mut stdout)?;

    if cli.dump {
        write!(stdout, "{}", replayer.checker().table().dump())?;
    }
    Ok(())
}
