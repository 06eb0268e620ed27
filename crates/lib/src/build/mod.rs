//! Build passes: ordering, deltas, step execution and the control loop.
//!
//! # Submodules
//!
//! - [`graph`] - Build order resolution over unit references
//! - [`delta`] - Change deltas and the per-pass store
//! - [`context`] - Per-unit build context
//! - [`step`] - The `BuildStep` contract and step registry
//! - [`runner`] - Runs one unit's steps for one sweep
//! - [`manager`] - The control loop driving a pass
//! - [`steps`] - Built-in `cmd` and `log` steps

pub mod context;
pub mod delta;
pub mod graph;
pub mod manager;
pub mod runner;
pub mod step;
pub mod steps;
mod types;

pub use context::BuildContext;
pub use delta::{Delta, PassStore};
pub use graph::BuildGraph;
pub use manager::{BuildManager, effective_trigger};
pub use runner::StepSelection;
pub use step::{BuildStep, Iterations, RebuildOptions, RebuildRequest, StepContext, StepOutput, StepRegistry};
pub use steps::register_builtin_steps;
pub use types::*;
