//! The execution collaborator seam.
//!
//! The runner never spawns processes itself. It hands each unit to an [`Executor`] and maps the
//! returned [`ExecutionOutcome`] onto the unit's terminal state.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::info;

use crate::component::Outputs;
use crate::consts::DRY_RUN_MESSAGE;

use super::events::{Events, RunEvent};
use super::locks::PathLocks;
use super::types::ExecuteError;

/// Everything an executor needs to run one unit's action.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
  pub unit: PathBuf,
  pub working_dir: PathBuf,
  pub action: String,
  pub extra_args: Vec<String>,
  /// Run environment plus resolved inputs.
  pub environment: BTreeMap<String, String>,
  pub dry_run: bool,
  pub non_interactive: bool,
  /// Emits this unit's dry-run marker at most once.
  pub marker: DryRunMarker,
  /// Shared per-path locks for on-disk artifacts several units may touch.
  pub locks: PathLocks,
}

/// What an executor reports back for one unit.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
  pub outputs: Outputs,
  /// Exit code of the failing step, or `0` on success.
  pub exit_code: i32,
  /// Combined output of every step, for diagnostics.
  pub logs: String,
}

impl ExecutionOutcome {
  pub fn success(outputs: Outputs) -> Self {
    Self {
      outputs,
      ..Default::default()
    }
  }

  pub fn is_success(&self) -> bool {
    self.exit_code == 0
  }
}

/// Runs a single unit's action.
#[async_trait]
pub trait Executor: Send + Sync {
  async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutcome, ExecuteError>;

  /// Outputs a unit recorded in an earlier run.
  ///
  /// Called for dependencies that inputs reference but that are not part of the current run. The default
  /// implementation has no state to read and reports no outputs.
  async fn read_outputs(&self, _unit: &Path, _environment: &BTreeMap<String, String>) -> Result<Outputs, ExecuteError> {
    Ok(Outputs::new())
  }
}

/// The once-per-unit dry-run marker.
///
/// Executors may call [`DryRunMarker::emit`] from any validation step; only the first call per
/// unit logs and publishes the marker.
#[derive(Debug, Clone)]
pub struct DryRunMarker {
  flag: Arc<AtomicBool>,
  unit: PathBuf,
  events: Events,
}

impl DryRunMarker {
  pub(crate) fn new(flag: Arc<AtomicBool>, unit: PathBuf, events: Events) -> Self {
    Self { flag, unit, events }
  }

  /// A marker not tied to any run, for driving executors directly.
  pub fn detached(unit: impl Into<PathBuf>) -> Self {
    Self::new(Arc::new(AtomicBool::new(false)), unit.into(), Events::none())
  }

  /// Emit the marker unless it was already emitted. Returns whether this call emitted it.
  pub fn emit(&self) -> bool {
    if self
      .flag
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      return false;
    }
    info!(unit = %self.unit.display(), "{}", DRY_RUN_MESSAGE);
    self.events.send(RunEvent::DryRun {
      unit: self.unit.clone(),
    });
    true
  }

  pub fn is_emitted(&self) -> bool {
    self.flag.load(Ordering::SeqCst)
  }
}
