//! buildsched-lib: incremental build scheduling for a multi-project workspace
//!
//! This crate provides:
//! - `Workspace`: projects, configurations and references behind one shared handle
//! - `BuildManager`: the control loop that orders units, runs their steps and
//!   honours rebuild requests within an iteration bound
//! - `AutoBuildScheduler`: a debounced background trigger for builds
//! - `RuleLock`: conflict-aware mutual exclusion between builds and mutations

pub mod autobuild;
pub mod build;
pub mod config;
pub mod consts;
pub mod jobs;
pub mod unit;
pub mod workspace;

pub use autobuild::{AutoBuildEvent, AutoBuildOutcome, AutoBuildState};
pub use build::{
  BuildContext, BuildError, BuildStep, Delta, Iterations, PassOutcome, PassReport, RebuildOptions, StepContext,
  StepOutput, StepRegistry, UnitReport,
};
pub use config::WorkspaceConfig;
pub use unit::{TriggerKind, TriggerMask, UnitId, UnitRef};
pub use workspace::model::{ChangeKind, StepBinding};
pub use workspace::{Workspace, WorkspaceError};
