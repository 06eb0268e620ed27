//! Events published by the auto-build scheduler.

use std::sync::Arc;

use crate::build::{BuildError, PassOutcome, PassReport};

/// How an auto-build run ended.
#[derive(Debug, Clone)]
pub enum AutoBuildOutcome {
  /// The pass ran; see the report for its outcome and step failures.
  Finished(Arc<PassReport>),
  /// The pass could not run at all.
  Failed(String),
}

impl AutoBuildOutcome {
  pub(crate) fn from_result(result: Result<PassReport, BuildError>) -> Self {
    match result {
      Ok(report) => AutoBuildOutcome::Finished(Arc::new(report)),
      Err(err) => AutoBuildOutcome::Failed(err.to_string()),
    }
  }

  pub fn report(&self) -> Option<&PassReport> {
    match self {
      AutoBuildOutcome::Finished(report) => Some(report),
      AutoBuildOutcome::Failed(_) => None,
    }
  }

  pub fn is_cancelled(&self) -> bool {
    self.report().is_some_and(|r| r.outcome == PassOutcome::Cancelled)
  }
}

/// State transitions of the scheduler.
#[derive(Debug, Clone)]
pub enum AutoBuildEvent {
  /// A run is pending and will start once the debounce delay elapses.
  Scheduled,
  /// A run started.
  Running,
  /// A run ended.
  Done(AutoBuildOutcome),
}
