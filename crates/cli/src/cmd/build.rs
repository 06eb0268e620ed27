//! Implementation of the `bsched build` and `bsched clean` commands.
//!
//! Both run a single pass synchronously. Nothing is persisted between
//! invocations, so every unit's first build in a process is a full one.

use std::path::Path;

use anyhow::{Result, bail};
use buildsched_lib::{PassOutcome, TriggerKind};
use tracing::info;

use super::{Target, load_workspace, resolve_units};
use crate::output::{OutputFormat, print_json, print_report, print_success, print_warning};

pub fn cmd_build(target: &Target, config: Option<&Path>, trigger: TriggerKind, output: OutputFormat) -> Result<()> {
  run_pass(target, config, trigger, output)
}

pub fn cmd_clean(target: &Target, config: Option<&Path>, output: OutputFormat) -> Result<()> {
  run_pass(target, config, TriggerKind::Clean, output)
}

fn run_pass(target: &Target, config: Option<&Path>, trigger: TriggerKind, output: OutputFormat) -> Result<()> {
  let workspace = load_workspace(&target.manifest, config)?;
  let units = resolve_units(&workspace, &target.units)?;
  info!(trigger = %trigger, units = units.len(), "running pass");

  let report = workspace.build(&units, trigger, target.include_references())?;

  if output.is_json() {
    print_json(&report)?;
  } else {
    print_report(&report);
    println!();
    match report.outcome {
      PassOutcome::IterationCapReached => print_warning("Iteration cap reached; some rebuild requests were dropped"),
      PassOutcome::Cancelled => print_warning("Pass cancelled"),
      PassOutcome::Completed if report.is_success() => print_success(&format!("{} complete", trigger)),
      PassOutcome::Completed => {}
    }
  }

  let failed = report.failures().count();
  if failed > 0 {
    bail!("{} build step(s) failed", failed);
  }
  Ok(())
}
