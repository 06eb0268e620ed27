//! Workspace configuration: JSON file plus environment overrides.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::build::BuildConfig;
use crate::consts::{
  DEFAULT_AUTO_BUILD_DELAY_MS, DEFAULT_AUTO_BUILD_MAX_DELAY_MS, DEFAULT_MAX_ITERATIONS, ENV_AUTO_BUILD,
  ENV_MAX_ITERATIONS,
};

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read config {path}: {source}")]
  Read {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("invalid config {path}: {source}")]
  Parse {
    path: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("invalid value '{value}' for {var}")]
  InvalidEnv { var: &'static str, value: String },

  #[error("max_iterations must be at least 1")]
  ZeroIterations,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
  pub max_iterations: usize,
  pub auto_build: bool,
  pub auto_build_delay_ms: u64,
  pub auto_build_max_delay_ms: u64,
}

impl Default for WorkspaceConfig {
  fn default() -> Self {
    Self {
      max_iterations: DEFAULT_MAX_ITERATIONS,
      auto_build: false,
      auto_build_delay_ms: DEFAULT_AUTO_BUILD_DELAY_MS,
      auto_build_max_delay_ms: DEFAULT_AUTO_BUILD_MAX_DELAY_MS,
    }
  }
}

impl WorkspaceConfig {
  /// Load `path` (if given) and apply environment overrides.
  pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
    let config = match path {
      Some(path) => Self::from_file(path)?,
      None => Self::default(),
    };
    config.with_env_overrides()
  }

  pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
      path: path.display().to_string(),
      source,
    })?;
    let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
      path: path.display().to_string(),
      source,
    })?;
    debug!(path = %path.display(), "loaded workspace config");
    config.validate()
  }

  pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
    if let Ok(value) = std::env::var(ENV_MAX_ITERATIONS) {
      self.max_iterations = value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var: ENV_MAX_ITERATIONS,
        value: value.clone(),
      })?;
    }
    if let Ok(value) = std::env::var(ENV_AUTO_BUILD) {
      self.auto_build = parse_flag(&value).ok_or(ConfigError::InvalidEnv {
        var: ENV_AUTO_BUILD,
        value: value.clone(),
      })?;
    }
    self.validate()
  }

  fn validate(self) -> Result<Self, ConfigError> {
    if self.max_iterations == 0 {
      return Err(ConfigError::ZeroIterations);
    }
    Ok(self)
  }

  pub fn auto_build_delay(&self) -> Duration {
    Duration::from_millis(self.auto_build_delay_ms)
  }

  pub fn auto_build_max_delay(&self) -> Duration {
    Duration::from_millis(self.auto_build_max_delay_ms.max(self.auto_build_delay_ms))
  }

  pub fn build_config(&self) -> BuildConfig {
    BuildConfig {
      max_iterations: self.max_iterations,
    }
  }
}

fn parse_flag(value: &str) -> Option<bool> {
  match value.trim().to_ascii_lowercase().as_str() {
    "1" | "true" | "on" | "yes" => Some(true),
    "0" | "false" | "off" | "no" => Some(false),
    _ => None,
  }
}
