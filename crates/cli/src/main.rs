mod cmd;
mod output;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use buildsched_lib::TriggerKind;
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::cmd::{Target, cmd_build, cmd_clean, cmd_order, cmd_watch};
use crate::output::OutputFormat;

/// bsched - incremental build scheduler for multi-project workspaces
#[derive(Parser)]
#[command(name = "bsched")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Increase log verbosity (-v info, -vv debug, -vvv trace)
  #[arg(short, long, global = true, action = ArgAction::Count)]
  verbose: u8,

  /// Scheduler configuration file (JSON)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Print the order a build would visit units in
  Order {
    #[command(flatten)]
    target: Target,

    /// Output format
    #[arg(short = 'o', long, value_enum, default_value = "text")]
    output: OutputFormat,
  },

  /// Run a build pass
  Build {
    #[command(flatten)]
    target: Target,

    /// Trigger kind: full, incremental or auto
    #[arg(short, long, default_value = "incremental")]
    trigger: TriggerKind,

    /// Output format
    #[arg(short = 'o', long, value_enum, default_value = "text")]
    output: OutputFormat,
  },

  /// Run a clean pass
  Clean {
    #[command(flatten)]
    target: Target,

    /// Output format
    #[arg(short = 'o', long, value_enum, default_value = "text")]
    output: OutputFormat,
  },

  /// Read `<project> <path>` lines from stdin and let auto-build react
  Watch {
    /// Workspace manifest (JSON)
    #[arg(short, long, default_value = "workspace.json")]
    manifest: PathBuf,

    /// How long to wait for the last auto-build once stdin closes (e.g. "30s")
    #[arg(long, value_parser = humantime::parse_duration, default_value = "60s")]
    settle: Duration,

    /// Output format
    #[arg(short = 'o', long, value_enum, default_value = "text")]
    output: OutputFormat,
  },
}

fn init_tracing(verbose: u8) {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
    let level = match verbose {
      0 => "warn",
      1 => "info",
      2 => "debug",
      _ => "trace",
    };
    EnvFilter::new(level)
  });

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();
}

fn main() -> Result<()> {
  let cli = Cli::parse();
  init_tracing(cli.verbose);

  let config = cli.config.as_deref();
  match cli.command {
    Commands::Order { target, output } => cmd_order(&target, config, output),
    Commands::Build {
      target,
      trigger,
      output,
    } => cmd_build(&target, config, trigger, output),
    Commands::Clean { target, output } => cmd_clean(&target, config, output),
    Commands::Watch {
      manifest,
      settle,
      output,
    } => cmd_watch(&manifest, config, settle, output),
  }
}
