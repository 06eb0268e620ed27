mod build;
mod order;
mod watch;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use buildsched_lib::build::register_builtin_steps;
use buildsched_lib::workspace::manifest::WorkspaceManifest;
use buildsched_lib::{StepRegistry, UnitId, Workspace, WorkspaceConfig};
use clap::Args;
use tracing::debug;

pub use build::{cmd_build, cmd_clean};
pub use order::cmd_order;
pub use watch::cmd_watch;

/// Which units a command works on.
#[derive(Args, Debug)]
pub struct Target {
  /// Workspace manifest (JSON)
  #[arg(short, long, default_value = "workspace.json")]
  pub manifest: PathBuf,

  /// Units as `project` (active configuration) or `project/config`.
  /// Defaults to the active configuration of every open project.
  pub units: Vec<String>,

  /// Do not pull in referenced units
  #[arg(long)]
  pub no_references: bool,
}

impl Target {
  pub fn include_references(&self) -> bool {
    !self.no_references
  }
}

/// Load configuration and manifest into a fresh workspace with the built-in steps.
pub fn load_workspace(manifest: &Path, config: Option<&Path>) -> Result<Arc<Workspace>> {
  let config = WorkspaceConfig::load(config).context("Failed to load scheduler configuration")?;
  load_workspace_with(manifest, config)
}

pub fn load_workspace_with(manifest: &Path, config: WorkspaceConfig) -> Result<Arc<Workspace>> {
  let manifest = WorkspaceManifest::from_file(manifest)?;

  let mut registry = StepRegistry::new();
  register_builtin_steps(&mut registry);

  let workspace = Workspace::new(config, registry);
  workspace
    .apply_manifest(&manifest)
    .context("Failed to apply workspace manifest")?;
  debug!(projects = manifest.projects.len(), "workspace loaded");
  Ok(workspace)
}

/// Turn command-line unit names into unit ids.
pub fn resolve_units(workspace: &Workspace, names: &[String]) -> Result<Vec<UnitId>> {
  if names.is_empty() {
    return Ok(workspace.active_units());
  }

  names
    .iter()
    .map(|name| match name.split_once('/') {
      Some((project, config)) => Ok(UnitId::new(project, config)),
      None => workspace
        .with_model(|model| model.project(name).map(|p| p.active_unit()))
        .with_context(|| format!("Unknown project '{}'", name)),
    })
    .collect()
}
