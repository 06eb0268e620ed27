//! Implementation of the `bsched watch` command.
//!
//! Runs the auto-build scheduler while reading `<project> <path>` lines from
//! stdin. Every line records a change, which schedules an auto-build. Once
//! stdin closes the command waits for the last build and exits.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use buildsched_lib::{AutoBuildEvent, AutoBuildOutcome, WorkspaceConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::load_workspace_with;
use crate::output::{OutputFormat, print_error, print_info, print_json, print_report, print_warning};

pub fn cmd_watch(manifest: &Path, config: Option<&Path>, settle: Duration, output: OutputFormat) -> Result<()> {
  let config = WorkspaceConfig {
    auto_build: true,
    ..WorkspaceConfig::load(config).context("Failed to load scheduler configuration")?
  };

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  rt.block_on(watch(manifest, config, settle, output))
}

async fn watch(manifest: &Path, config: WorkspaceConfig, settle: Duration, output: OutputFormat) -> Result<()> {
  let workspace = load_workspace_with(manifest, config)?;
  let events = workspace.subscribe();
  let printer = tokio::spawn(print_events(events, output));

  workspace.start_auto_build()?;
  workspace.request_auto_build();
  if !output.is_json() {
    print_info("Watching stdin for changes (`<project> <path>` per line)");
  }

  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
      continue;
    }
    let Some((project, path)) = line.split_once(char::is_whitespace) else {
      print_warning(&format!("Ignoring malformed line: {}", line));
      continue;
    };
    match workspace.touch(project, path.trim()) {
      Ok(stamp) => debug!(project, path, stamp, "change recorded"),
      Err(err) => print_error(&format!("Cannot record change: {}", err)),
    }
  }

  let settled = workspace.wait_for_auto_build(settle).await;
  workspace.shutdown().await;
  // Dropping the last handle closes the event bus and ends the printer.
  drop(workspace);
  let failures = printer.await.context("Event printer failed")?;

  settled.context("Auto-build did not settle")?;
  if failures > 0 {
    bail!("{} auto-build(s) had failures", failures);
  }
  Ok(())
}

/// Print scheduler events until the bus closes. Returns how many runs failed.
async fn print_events(mut events: broadcast::Receiver<AutoBuildEvent>, output: OutputFormat) -> usize {
  let mut failures = 0;
  loop {
    let event = match events.recv().await {
      Ok(event) => event,
      Err(broadcast::error::RecvError::Lagged(missed)) => {
        warn!(missed, "event printer lagged behind");
        continue;
      }
      Err(broadcast::error::RecvError::Closed) => return failures,
    };

    match event {
      AutoBuildEvent::Scheduled => debug!("auto-build scheduled"),
      AutoBuildEvent::Running if !output.is_json() => print_info("Auto-build running"),
      AutoBuildEvent::Running => {}
      AutoBuildEvent::Done(AutoBuildOutcome::Finished(report)) => {
        if !report.is_success() {
          failures += 1;
        }
        if output.is_json() {
          if let Err(err) = print_json(report.as_ref()) {
            warn!(error = %err, "cannot print report");
          }
        } else {
          print_report(&report);
          println!();
        }
      }
      AutoBuildEvent::Done(AutoBuildOutcome::Failed(message)) => {
        failures += 1;
        print_error(&format!("Auto-build failed: {}", message));
      }
    }
  }
}
