//! Implementation of the `stackrun run` command.
//!
//! Discovers the unit at the working directory (or every unit below it with `--all`), then runs
//! the requested action across the dependency graph. Ctrl-C stops new units from starting and
//! waits for running ones to finish.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Args;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use stackrun_lib::config::{EngineConfig, RunOptions};
use stackrun_lib::discovery::{Discoverer, DiscoveryOptions};
use stackrun_lib::graph::GraphBuilder;
use stackrun_lib::runner::{ProcessExecutor, RunSummary, StackRunner};
use stackrun_lib::util::path::relative_slash;
use stackrun_lib::{UnitStatus, find_stack_in_subfolders};

use crate::output::{format_duration, print_info, print_stat, print_success, print_warning, status_symbol};
use crate::prompts::confirm;

#[derive(Debug, Args)]
pub struct RunArgs {
  /// Action to run in each unit (e.g. plan, apply, destroy)
  pub action: String,

  /// Run every unit below the working directory
  #[arg(long)]
  pub all: bool,

  /// Validate each unit without running the action
  #[arg(long)]
  pub dry_run: bool,

  /// Never prompt; pass non-interactive flags to the IaC binary
  #[arg(long)]
  pub non_interactive: bool,

  /// Directory to run from (default: current directory)
  #[arg(long)]
  pub working_dir: Option<std::path::PathBuf>,

  /// Maximum number of units running at once
  #[arg(long)]
  pub parallelism: Option<usize>,

  /// Run dependents even when a dependency failed
  #[arg(long)]
  pub ignore_dependency_errors: bool,

  /// Only target units matching this glob (repeatable)
  #[arg(long = "include-dir", value_name = "GLOB")]
  pub include_dirs: Vec<String>,

  /// Do not target units matching this glob (repeatable)
  #[arg(long = "exclude-dir", value_name = "GLOB")]
  pub exclude_dirs: Vec<String>,

  /// Fail any unit still running after this long (e.g. 30m, 90s)
  #[arg(long, value_parser = humantime::parse_duration)]
  pub timeout: Option<Duration>,

  /// Arguments passed through to the IaC binary
  #[arg(last = true)]
  pub extra: Vec<String>,
}

impl RunArgs {
  fn options(&self) -> RunOptions {
    RunOptions {
      max_concurrency: self.parallelism,
      dry_run: self.dry_run.then_some(true),
      ignore_dependency_errors: self.ignore_dependency_errors.then_some(true),
      include: self.include_dirs.clone(),
      exclude: self.exclude_dirs.clone(),
      per_unit_timeout: self.timeout,
      non_interactive: self.non_interactive,
      ..Default::default()
    }
  }
}

fn is_mutating(action: &str) -> bool {
  matches!(action, "apply" | "destroy")
}

/// Execute the run command. The exit code is non-zero if any unit failed or the run was canceled.
pub fn cmd_run(args: RunArgs) -> Result<ExitCode> {
  let config = EngineConfig::from_env().context("Invalid environment configuration")?;
  let dir = super::working_dir(args.working_dir.clone())?;
  let executor = Arc::new(ProcessExecutor::from_config(&config));
  debug!(dir = %dir.display(), all = args.all, program = executor.program(), "loading units");

  let runner = if args.all {
    find_stack_in_subfolders(&dir, &DiscoveryOptions::default(), executor, config)
  } else {
    let discoverer = Discoverer::new(DiscoveryOptions {
      max_depth: Some(0),
      ..Default::default()
    });
    StackRunner::discover(&dir, &discoverer, GraphBuilder::new().allow_external(true), executor, config)
  };
  let mut runner = runner.with_context(|| format!("Failed to load units from {}", dir.display()))?;

  if runner.graph().is_empty() {
    if args.all {
      bail!("No units found under {}", dir.display());
    }
    bail!("No unit found in {} (use --all to run every unit below it)", dir.display());
  }

  let options = args.options();
  let settings = options.resolve(runner.config()).context("Invalid run options")?;

  if args.all && is_mutating(&args.action) {
    let message = format!(
      "Run '{}' on {} unit(s) under {}?",
      args.action,
      runner.graph().len(),
      runner.root().display()
    );
    if !confirm(&message, args.non_interactive || settings.dry_run)? {
      print_warning("Aborted");
      return Ok(ExitCode::FAILURE);
    }
  }

  let rt = tokio::runtime::Runtime::new().context("Failed to create async runtime")?;
  let cancel = CancellationToken::new();
  let summary = rt
    .block_on(async {
      let signal = cancel.clone();
      tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
          print_warning("Interrupt received, waiting for running units to finish");
          signal.cancel();
        }
      });
      runner.run(cancel.clone(), &args.action, &args.extra, &options).await
    })
    .context("Run failed")?;

  print_summary(&summary, runner.root());

  Ok(if summary.is_success() {
    ExitCode::SUCCESS
  } else {
    ExitCode::FAILURE
  })
}

fn print_summary(summary: &RunSummary, root: &Path) {
  println!();
  for unit in &summary.units {
    let mut line = format!("{} {}", status_symbol(unit.status), relative_slash(root, &unit.path));
    if let Some(duration) = unit.duration {
      line.push_str(&format!(" ({})", format_duration(duration)));
    }
    match (&unit.status, &unit.error) {
      (UnitStatus::Failed | UnitStatus::Skipped, Some(e)) => line.push_str(&format!(": {}", e)),
      (UnitStatus::Canceled, _) => line.push_str(": canceled"),
      _ => {}
    }
    println!("{}", line);
  }

  println!();
  let counts = summary.counts();
  print_stat("Succeeded", &counts.succeeded.to_string());
  print_stat("Failed", &counts.failed.to_string());
  print_stat("Skipped", &counts.skipped.to_string());
  print_stat("Canceled", &counts.canceled.to_string());
  println!();

  if summary.is_success() {
    print_success(&format!(
      "{} complete: {} unit(s) in {}",
      summary.action,
      summary.total(),
      format_duration(summary.duration)
    ));
  } else if let Some(failure) = summary.error() {
    for (path, error) in &failure.failures {
      print_warning(&format!("{}: {}", relative_slash(root, path), error));
    }
    if failure.canceled {
      print_info("Run canceled before all units started");
    }
  }
}
