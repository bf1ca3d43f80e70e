//! Run progress events.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use crate::component::UnitStatus;

use super::types::StatusCounts;

/// A status change observed during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
  UnitStarted {
    unit: PathBuf,
  },
  UnitFinished {
    unit: PathBuf,
    status: UnitStatus,
    duration: Option<Duration>,
  },
  /// The dry-run marker for a unit. Sent at most once per unit per run.
  DryRun {
    unit: PathBuf,
  },
  RunFinished {
    counts: StatusCounts,
    canceled: bool,
  },
}

/// Optional event sink. Sending never fails; a dropped receiver is ignored.
#[derive(Debug, Clone, Default)]
pub struct Events(Option<UnboundedSender<RunEvent>>);

impl Events {
  pub fn new(sender: UnboundedSender<RunEvent>) -> Self {
    Self(Some(sender))
  }

  pub fn none() -> Self {
    Self(None)
  }

  pub fn send(&self, event: RunEvent) {
    if let Some(tx) = &self.0 {
      let _ = tx.send(event);
    }
  }
}
