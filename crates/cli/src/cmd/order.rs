//! Implementation of the `bsched order` command.

use std::path::Path;

use anyhow::Result;

use super::{Target, load_workspace, resolve_units};
use crate::output::{OutputFormat, print_info, print_json};

/// Print the order a build of the target units would use.
pub fn cmd_order(target: &Target, config: Option<&Path>, output: OutputFormat) -> Result<()> {
  let workspace = load_workspace(&target.manifest, config)?;
  let units = resolve_units(&workspace, &target.units)?;
  let order = workspace.resolve_order(&units, target.include_references());

  if output.is_json() {
    let names: Vec<String> = order.iter().map(ToString::to_string).collect();
    print_json(&names)?;
    return Ok(());
  }

  if order.is_empty() {
    print_info("Nothing to build");
    return Ok(());
  }
  for (position, unit) in order.iter().enumerate() {
    println!("{:>3}. {}", position + 1, unit);
  }
  Ok(())
}
