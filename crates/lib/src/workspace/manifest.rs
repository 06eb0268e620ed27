//! JSON workspace manifests.
//!
//! A manifest declares projects, their configurations, per-configuration
//! references and build specs:
//!
//! ```json
//! {
//!   "projects": [
//!     {
//!       "name": "app",
//!       "configs": ["debug", "release"],
//!       "references": { "debug": [{ "active": "core" }] },
//!       "build": [{ "step_id": "cmd", "args": { "cmd": "make" } }]
//!     },
//!     { "name": "core", "configs": ["debug"] }
//!   ]
//! }
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::model::{ModelError, StepBinding, WorkspaceModel};
use crate::unit::{UnitId, UnitRef};

#[derive(Debug, Error)]
pub enum ManifestError {
  #[error("failed to read manifest {path}: {source}")]
  Read {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid manifest {path}: {source}")]
  Parse {
    path: String,
    #[source]
    source: serde_json::Error,
  },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkspaceManifest {
  #[serde(default)]
  pub projects: Vec<ProjectManifest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectManifest {
  pub name: String,
  pub configs: Vec<String>,
  /// Defaults to the first configuration.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub active: Option<String>,
  #[serde(default = "default_open")]
  pub open: bool,
  #[serde(default)]
  pub references: BTreeMap<String, Vec<UnitRef>>,
  #[serde(default)]
  pub build: Vec<StepBinding>,
}

fn default_open() -> bool {
  true
}

impl WorkspaceManifest {
  pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
    let text = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
      path: path.display().to_string(),
      source,
    })?;
    Self::parse(&text, &path.display().to_string())
  }

  pub fn parse(text: &str, origin: &str) -> Result<Self, ManifestError> {
    serde_json::from_str(text).map_err(|source| ManifestError::Parse {
      path: origin.to_string(),
      source,
    })
  }

  /// Declare every project of the manifest in `model`.
  ///
  /// Projects are created first so references may point forward.
  pub fn apply_to(&self, model: &mut WorkspaceModel) -> Result<(), ModelError> {
    for project in &self.projects {
      let configs: Vec<&str> = project.configs.iter().map(String::as_str).collect();
      model.create_project(&project.name, &configs)?;
    }

    for project in &self.projects {
      if let Some(active) = &project.active {
        model.set_active_config(&project.name, active)?;
      }
      for (config, refs) in &project.references {
        model.set_references(&UnitId::new(&project.name, config), refs.clone())?;
      }
      if !project.build.is_empty() {
        model.set_build_spec(&project.name, project.build.clone())?;
      }
      if !project.open {
        model.set_open(&project.name, false)?;
      }
    }

    debug!(projects = self.projects.len(), "manifest applied");
    Ok(())
  }
}
