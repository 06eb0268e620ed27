//! CLI output formatting utilities.
//!
//! Provides consistent formatting for terminal output: colored status
//! messages, human-readable durations and pass summaries.

use std::time::Duration;

use anyhow::Context;
use buildsched_lib::{PassReport, UnitReport};
use clap::ValueEnum;
use owo_colors::{OwoColorize, Stream};

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    matches!(self, OutputFormat::Json)
  }
}

pub mod symbols {
  pub const SUCCESS: &str = "✓";
  pub const ERROR: &str = "✗";
  pub const WARNING: &str = "⚠";
  pub const INFO: &str = "•";
  pub const ARROW: &str = "→";
  pub const SKIP: &str = "-";
}

/// Millisecond-precision human duration, e.g. `1s 250ms`.
pub fn format_duration(duration: Duration) -> String {
  let rounded = Duration::from_millis(duration.as_millis() as u64);
  if rounded.is_zero() {
    return "0ms".to_string();
  }
  humantime::format_duration(rounded).to_string()
}

pub fn print_success(message: &str) {
  println!(
    "{} {}",
    symbols::SUCCESS.if_supports_color(Stream::Stdout, |s| s.green()),
    message
  );
}

pub fn print_error(message: &str) {
  eprintln!(
    "{} {}",
    symbols::ERROR.if_supports_color(Stream::Stderr, |s| s.red()),
    message.if_supports_color(Stream::Stderr, |s| s.red())
  );
}

pub fn print_warning(message: &str) {
  eprintln!(
    "{} {}",
    symbols::WARNING.if_supports_color(Stream::Stderr, |s| s.yellow()),
    message.if_supports_color(Stream::Stderr, |s| s.yellow())
  );
}

pub fn print_info(message: &str) {
  println!(
    "{} {}",
    symbols::INFO.if_supports_color(Stream::Stdout, |s| s.blue()),
    message
  );
}

pub fn print_stat(label: &str, value: &str) {
  println!(
    "  {}: {}",
    label.if_supports_color(Stream::Stdout, |s| s.dimmed()),
    value
  );
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{}", json);
  Ok(())
}

fn print_unit(unit: &UnitReport) {
  if !unit.failures.is_empty() {
    for failure in &unit.failures {
      println!(
        "{} {} {} {}",
        symbols::ERROR.if_supports_color(Stream::Stdout, |s| s.red()),
        unit.unit,
        symbols::ARROW,
        format!("{}: {}", failure.step_id, failure.message).if_supports_color(Stream::Stdout, |s| s.red())
      );
    }
    return;
  }

  if unit.invocations.is_empty() {
    println!(
      "{} {} {}",
      symbols::SKIP.if_supports_color(Stream::Stdout, |s| s.dimmed()),
      unit.unit,
      "(nothing to do)".if_supports_color(Stream::Stdout, |s| s.dimmed())
    );
    return;
  }

  let steps: Vec<String> = unit
    .invocations
    .iter()
    .map(|inv| format!("{}[{}]", inv.step_id, inv.trigger))
    .collect();
  println!(
    "{} {} {} {}",
    symbols::SUCCESS.if_supports_color(Stream::Stdout, |s| s.green()),
    unit.unit,
    symbols::ARROW,
    steps.join(" ")
  );
}

/// Per-unit lines followed by pass statistics.
pub fn print_report(report: &PassReport) {
  for unit in &report.units {
    print_unit(unit);
  }
  println!();
  print_stat("Trigger", &report.trigger.to_string());
  print_stat("Outcome", &report.outcome.to_string());
  print_stat("Units", &report.order.len().to_string());
  print_stat("Step invocations", &report.invocation_total().to_string());
  print_stat("Iterations", &report.iterations.to_string());
  print_stat("Duration", &format_duration(report.duration));
}
