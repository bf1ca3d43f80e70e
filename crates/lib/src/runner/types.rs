//! Error and result types for running an action across a stack.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::component::UnitStatus;
use crate::config::ConfigError;
use crate::discovery::DiscoveryError;
use crate::graph::GraphError;

/// Failure reported by the execution collaborator itself.
#[derive(Debug, Clone, Error)]
pub enum ExecuteError {
  /// The IaC binary could not be started.
  #[error("failed to run {program}: {source}")]
  Spawn {
    program: String,
    #[source]
    source: Arc<std::io::Error>,
  },

  /// I/O error while talking to a child process.
  #[error("io error: {0}")]
  Io(Arc<std::io::Error>),

  /// Output values could not be decoded.
  #[error("invalid outputs: {0}")]
  InvalidOutputs(String),

  /// Any other collaborator failure.
  #[error("{0}")]
  Failed(String),
}

impl From<std::io::Error> for ExecuteError {
  fn from(e: std::io::Error) -> Self {
    ExecuteError::Io(Arc::new(e))
  }
}

/// Why a unit ended Failed or Skipped.
#[derive(Debug, Clone, Error)]
pub enum UnitError {
  #[error(transparent)]
  Execution(#[from] ExecuteError),

  #[error("{action} exited with status {code}")]
  ExitStatus { action: String, code: i32 },

  #[error("timed out after {0:?}")]
  Timeout(Duration),

  #[error("dependency {} has no output named '{output}'", dependency.display())]
  MissingOutput { dependency: PathBuf, output: String },

  #[error("dependency {} did not succeed", .0.display())]
  DependencyFailed(PathBuf),

  #[error("execution task panicked: {0}")]
  Panicked(String),
}

/// Structural errors that abort a run before any unit is scheduled.
#[derive(Debug, Error)]
pub enum StackError {
  #[error(transparent)]
  Discovery(#[from] DiscoveryError),

  #[error(transparent)]
  Graph(#[from] GraphError),

  #[error(transparent)]
  Config(#[from] ConfigError),

  #[error("invalid run options: {0}")]
  InvalidOptions(String),
}

/// Final record of one unit after a run.
#[derive(Debug, Clone)]
pub struct UnitReport {
  pub path: PathBuf,
  pub status: UnitStatus,
  pub error: Option<UnitError>,
  pub duration: Option<Duration>,
}

/// Outcome of [`StackRunner::run`](super::StackRunner::run).
#[derive(Debug, Clone)]
pub struct RunSummary {
  pub action: String,
  /// Every scheduled unit, in discovery order.
  pub units: Vec<UnitReport>,
  /// Whether cancellation was observed before every unit had started.
  pub canceled: bool,
  pub duration: Duration,
}

impl RunSummary {
  pub fn count(&self, status: UnitStatus) -> usize {
    self.units.iter().filter(|u| u.status == status).count()
  }

  pub fn succeeded(&self) -> usize {
    self.count(UnitStatus::Succeeded)
  }

  pub fn failed(&self) -> usize {
    self.count(UnitStatus::Failed)
  }

  pub fn skipped(&self) -> usize {
    self.count(UnitStatus::Skipped)
  }

  pub fn canceled_units(&self) -> usize {
    self.count(UnitStatus::Canceled)
  }

  pub fn total(&self) -> usize {
    self.units.len()
  }

  /// True when no unit failed and the run was not canceled.
  pub fn is_success(&self) -> bool {
    self.failed() == 0 && !self.canceled
  }

  pub fn unit(&self, path: &std::path::Path) -> Option<&UnitReport> {
    self.units.iter().find(|u| u.path == path)
  }

  /// The aggregate error, present iff a unit failed or the run was canceled.
  pub fn error(&self) -> Option<RunFailure> {
    if self.is_success() {
      return None;
    }
    let failures = self
      .units
      .iter()
      .filter(|u| u.status == UnitStatus::Failed)
      .map(|u| {
        let error = u
          .error
          .clone()
          .unwrap_or_else(|| UnitError::Execution(ExecuteError::Failed("unknown error".to_string())));
        (u.path.clone(), error)
      })
      .collect();
    Some(RunFailure {
      failures,
      counts: self.counts(),
      canceled: self.canceled,
    })
  }

  pub fn counts(&self) -> StatusCounts {
    StatusCounts {
      succeeded: self.succeeded(),
      failed: self.failed(),
      skipped: self.skipped(),
      canceled: self.canceled_units(),
    }
  }
}

/// Number of units per terminal state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
  pub succeeded: usize,
  pub failed: usize,
  pub skipped: usize,
  pub canceled: usize,
}

impl fmt::Display for StatusCounts {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "Succeeded: {}, Failed: {}, Skipped: {}, Canceled: {}",
      self.succeeded, self.failed, self.skipped, self.canceled
    )
  }
}

/// Aggregate error of a run: every failed unit with its error, plus counts.
#[derive(Debug, Clone)]
pub struct RunFailure {
  pub failures: Vec<(PathBuf, UnitError)>,
  pub counts: StatusCounts,
  pub canceled: bool,
}

impl fmt::Display for RunFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.canceled {
      writeln!(f, "run canceled")?;
    }
    for (path, error) in &self.failures {
      writeln!(f, "{}: {}", path.display(), error)?;
    }
    write!(f, "{}", self.counts)
  }
}

impl std::error::Error for RunFailure {}
