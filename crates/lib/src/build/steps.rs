//! Built-in build steps.
//!
//! - `cmd`: runs a shell command for the unit
//! - `log`: logs the trigger and delta it was called with
//!
//! Both only lock their own project, so units of different projects may build
//! concurrently.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use anyhow::{Context, bail};
use tracing::{debug, info};

use super::step::{BuildStep, StepContext, StepOutput, StepRegistry};
use crate::jobs::{ResourceRule, SchedulingRule};
use crate::unit::{TriggerKind, UnitId};
use crate::workspace::model::StepBinding;

pub const CMD_STEP: &str = "cmd";
pub const LOG_STEP: &str = "log";

/// Register the built-in steps into `registry`.
pub fn register_builtin_steps(registry: &mut StepRegistry) {
  registry.register(CMD_STEP, |binding| Ok(Box::new(CmdStep::from_binding(binding)?)));
  registry.register(LOG_STEP, |binding| Ok(Box::new(LogStep::from_binding(binding))));
}

fn project_rule(unit: &UnitId) -> Option<Arc<dyn SchedulingRule>> {
  Some(Arc::new(ResourceRule::project(unit.project.clone())))
}

/// Runs `args.cmd` through the platform shell.
///
/// The command sees `BSCHED_UNIT`, `BSCHED_TRIGGER` and `BSCHED_CHANGES`
/// (changed paths, one per line). Arguments named `env.NAME` become extra
/// environment variables. `args.clean`, if present, runs on CLEAN.
#[derive(Debug)]
pub struct CmdStep {
  cmd: String,
  clean: Option<String>,
  cwd: Option<String>,
  shell: Option<String>,
  env: BTreeMap<String, String>,
}

impl CmdStep {
  pub fn from_binding(binding: &StepBinding) -> anyhow::Result<Self> {
    let Some(cmd) = binding.args.get("cmd") else {
      bail!("cmd step requires a 'cmd' argument");
    };
    let env = binding
      .args
      .iter()
      .filter_map(|(key, value)| key.strip_prefix("env.").map(|name| (name.to_string(), value.clone())))
      .collect();
    Ok(Self {
      cmd: cmd.clone(),
      clean: binding.args.get("clean").cloned(),
      cwd: binding.args.get("cwd").cloned(),
      shell: binding.args.get("shell").cloned(),
      env,
    })
  }

  fn run(&self, script: &str, ctx: &StepContext<'_>) -> anyhow::Result<String> {
    let (shell, shell_args) = shell_for(self.shell.as_deref());
    let changes = ctx
      .delta()
      .changes()
      .iter()
      .map(|change| change.path.as_str())
      .collect::<Vec<_>>()
      .join("\n");

    let mut command = Command::new(&shell);
    command
      .args(&shell_args)
      .arg(script)
      .env("BSCHED_UNIT", ctx.unit().to_string())
      .env("BSCHED_TRIGGER", ctx.trigger().to_string())
      .env("BSCHED_CHANGES", changes)
      .envs(&self.env);
    if let Some(cwd) = &self.cwd {
      command.current_dir(Path::new(cwd));
    }

    info!(unit = %ctx.unit(), cmd = %script, "executing command");
    let output = command
      .output()
      .with_context(|| format!("failed to spawn {shell}"))?;

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if !output.status.success() {
      let stderr = String::from_utf8_lossy(&output.stderr);
      if !stderr.is_empty() {
        debug!(stderr = %stderr, "command stderr");
      }
      bail!("command failed with exit code {:?}: {}", output.status.code(), script);
    }
    if !stdout.is_empty() {
      debug!(stdout = %stdout, "command output");
    }
    Ok(stdout)
  }
}

impl BuildStep for CmdStep {
  fn build(&mut self, ctx: &mut StepContext<'_>) -> anyhow::Result<StepOutput> {
    self.run(&self.cmd, ctx)?;
    Ok(StepOutput::default())
  }

  fn clean(&mut self, ctx: &mut StepContext<'_>) -> anyhow::Result<()> {
    if let Some(script) = &self.clean {
      self.run(script, ctx)?;
    }
    Ok(())
  }

  fn scheduling_rule(
    &self,
    unit: &UnitId,
    _trigger: TriggerKind,
    _args: &BTreeMap<String, String>,
  ) -> Option<Arc<dyn SchedulingRule>> {
    project_rule(unit)
  }
}

/// Default shell and the flag that passes it a script.
fn shell_for(override_shell: Option<&str>) -> (String, Vec<String>) {
  if let Some(shell) = override_shell {
    let args = if shell.contains("powershell") || shell.contains("pwsh") {
      vec!["-NoProfile".to_string(), "-Command".to_string()]
    } else if shell.contains("cmd") {
      vec!["/C".to_string()]
    } else {
      vec!["-c".to_string()]
    };
    return (shell.to_string(), args);
  }

  if cfg!(windows) {
    ("cmd.exe".to_string(), vec!["/C".to_string()])
  } else {
    ("/bin/sh".to_string(), vec!["-c".to_string()])
  }
}

/// Logs what it was called with. `args.message` is included when set.
#[derive(Debug, Default)]
pub struct LogStep {
  message: Option<String>,
  calls: usize,
}

impl LogStep {
  pub fn from_binding(binding: &StepBinding) -> Self {
    Self {
      message: binding.args.get("message").cloned(),
      calls: 0,
    }
  }
}

impl BuildStep for LogStep {
  fn build(&mut self, ctx: &mut StepContext<'_>) -> anyhow::Result<StepOutput> {
    self.calls += 1;
    let delta = ctx.delta();
    info!(
      unit = %ctx.unit(),
      trigger = %ctx.trigger(),
      changes = delta.len(),
      call = self.calls,
      message = self.message.as_deref().unwrap_or(""),
      "build step invoked"
    );
    Ok(StepOutput::default())
  }

  fn clean(&mut self, ctx: &mut StepContext<'_>) -> anyhow::Result<()> {
    info!(unit = %ctx.unit(), "clean requested");
    Ok(())
  }

  fn scheduling_rule(
    &self,
    unit: &UnitId,
    _trigger: TriggerKind,
    _args: &BTreeMap<String, String>,
  ) -> Option<Arc<dyn SchedulingRule>> {
    project_rule(unit)
  }
}
