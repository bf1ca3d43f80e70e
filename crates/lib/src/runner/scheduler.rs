//! The run coordinator.
//!
//! A single loop owns every unit's status and the readiness bookkeeping. Workers are tasks in a
//! [`JoinSet`] that only call the executor and hand their result back; the coordinator applies the
//! terminal state and releases dependents before it looks at the next completion. The join set
//! never holds more than `max_concurrency` tasks.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::component::{ComponentId, Components, Outputs, UnitStatus};
use crate::config::RunSettings;
use crate::consts::INPUT_ENV_PREFIX;
use crate::graph::DependencyGraph;
use crate::parser::Expression;

use super::events::{Events, RunEvent};
use super::executor::{DryRunMarker, ExecutionOutcome, ExecutionRequest, Executor};
use super::locks::PathLocks;
use super::types::{UnitError, UnitReport};

type TaskResult = (ComponentId, Result<ExecutionOutcome, UnitError>);

pub(crate) struct Scheduler<'a> {
  components: &'a mut Components,
  graph: &'a DependencyGraph,
  executor: Arc<dyn Executor>,
  settings: &'a RunSettings,
  events: &'a Events,
  locks: &'a PathLocks,
  scheduled: BTreeSet<ComponentId>,
  /// Dependencies of each pending unit not yet terminal.
  remaining: HashMap<ComponentId, usize>,
  ready: BTreeSet<ComponentId>,
  started: HashMap<ComponentId, Instant>,
  /// Outputs of referenced units that are not part of this run.
  external: BTreeMap<PathBuf, Outputs>,
}

impl<'a> Scheduler<'a> {
  pub(crate) fn new(
    components: &'a mut Components,
    graph: &'a DependencyGraph,
    executor: Arc<dyn Executor>,
    settings: &'a RunSettings,
    events: &'a Events,
    locks: &'a PathLocks,
    scheduled: BTreeSet<ComponentId>,
  ) -> Self {
    Self {
      components,
      graph,
      executor,
      settings,
      events,
      locks,
      scheduled,
      remaining: HashMap::new(),
      ready: BTreeSet::new(),
      started: HashMap::new(),
      external: BTreeMap::new(),
    }
  }

  pub(crate) fn with_external_outputs(mut self, external: BTreeMap<PathBuf, Outputs>) -> Self {
    self.external = external;
    self
  }

  /// Drive every scheduled unit to a terminal state. Returns whether cancellation left units unstarted.
  pub(crate) async fn run(&mut self, cancel: &CancellationToken) -> bool {
    let ids: Vec<ComponentId> = self.scheduled.iter().copied().collect();
    for id in ids {
      let pending = self
        .graph
        .dependencies_of(id)
        .into_iter()
        .filter(|dep| self.scheduled.contains(dep))
        .count();
      self.remaining.insert(id, pending);
      if pending == 0 {
        self.mark_ready(id);
      }
    }

    let mut tasks: JoinSet<TaskResult> = JoinSet::new();
    let mut task_units: HashMap<Id, ComponentId> = HashMap::new();
    let mut canceled = false;

    loop {
      if !canceled && cancel.is_cancelled() {
        canceled = true;
        self.cancel_unstarted();
      }
      if !canceled {
        self.dispatch(&mut tasks, &mut task_units);
      }
      if tasks.is_empty() {
        break;
      }

      tokio::select! {
        biased;
        _ = cancel.cancelled(), if !canceled => {
          canceled = true;
          self.cancel_unstarted();
        }
        Some(joined) = tasks.join_next_with_id() => {
          let (id, result) = match joined {
            Ok((task, result)) => {
              task_units.remove(&task);
              result
            }
            Err(e) => match task_units.remove(&e.id()) {
              Some(id) => (id, Err(UnitError::Panicked(panic_message(e)))),
              None => {
                error!(error = %e, "unknown execution task failed");
                continue;
              }
            },
          };
          self.complete(id, result);
        }
        else => break,
      }
    }

    canceled && self.scheduled_with(UnitStatus::Canceled) > 0
  }

  /// Per-unit reports in discovery order.
  pub(crate) fn reports(&self) -> Vec<UnitReport> {
    self
      .scheduled
      .iter()
      .filter_map(|&id| self.components.unit(id))
      .map(|unit| UnitReport {
        path: unit.path.clone(),
        status: unit.execution.status,
        error: unit.execution.error.clone(),
        duration: unit.execution.duration,
      })
      .collect()
  }

  fn scheduled_with(&self, status: UnitStatus) -> usize {
    self
      .scheduled
      .iter()
      .filter(|&&id| self.status(id) == Some(status))
      .count()
  }

  fn status(&self, id: ComponentId) -> Option<UnitStatus> {
    self.components.unit(id).map(|u| u.execution.status)
  }

  fn mark_ready(&mut self, id: ComponentId) {
    if let Some(unit) = self.components.unit_mut(id) {
      unit.execution.status = UnitStatus::Ready;
      self.ready.insert(id);
    }
  }

  fn dispatch(&mut self, tasks: &mut JoinSet<TaskResult>, task_units: &mut HashMap<Id, ComponentId>) {
    while tasks.len() < self.settings.max_concurrency {
      let Some(id) = self.ready.pop_first() else {
        return;
      };

      let inputs = match self.resolve_inputs(id) {
        Ok(inputs) => inputs,
        Err(e) => {
          self.finish(id, UnitStatus::Failed, Some(e));
          self.release_dependents(id);
          continue;
        }
      };

      let Some(unit) = self.components.unit_mut(id) else {
        continue;
      };
      let mut environment = self.settings.environment.clone();
      environment.extend(inputs);
      unit.execution.environment = environment.clone();
      unit.execution.status = UnitStatus::Running;

      let request = ExecutionRequest {
        unit: unit.path.clone(),
        working_dir: unit.execution.working_dir.clone(),
        action: unit.execution.action.clone(),
        extra_args: unit.execution.extra_args.clone(),
        environment,
        dry_run: self.settings.dry_run,
        non_interactive: self.settings.non_interactive,
        marker: DryRunMarker::new(
          unit.execution.dry_run_marker.clone(),
          unit.path.clone(),
          self.events.clone(),
        ),
        locks: self.locks.clone(),
      };

      info!(unit = %request.unit.display(), action = %request.action, "running unit");
      self.events.send(RunEvent::UnitStarted {
        unit: request.unit.clone(),
      });
      self.started.insert(id, Instant::now());

      let executor = self.executor.clone();
      let timeout = self.settings.per_unit_timeout;
      let handle = tasks.spawn(async move {
        let result = match timeout {
          Some(limit) => match tokio::time::timeout(limit, executor.execute(request)).await {
            Ok(result) => result.map_err(UnitError::from),
            Err(_) => Err(UnitError::Timeout(limit)),
          },
          None => executor.execute(request).await.map_err(UnitError::from),
        };
        (id, result)
      });
      task_units.insert(handle.id(), id);
    }
  }

  /// Input values as `TF_VAR_*` variables. Output references read the dependency's recorded outputs.
  fn resolve_inputs(&self, id: ComponentId) -> Result<BTreeMap<String, String>, UnitError> {
    let Some(unit) = self.components.unit(id) else {
      return Ok(BTreeMap::new());
    };

    let mut env = BTreeMap::new();
    for (name, expr) in &unit.inputs {
      let value = match expr {
        Expression::Literal(value) => Some(value),
        Expression::Output { dependency, name: output } => {
          let recorded = self
            .components
            .id_of(dependency)
            .and_then(|dep| self.components.unit(dep))
            .and_then(|dep| dep.execution.outputs.get(output))
            .or_else(|| self.external.get(dependency).and_then(|outputs| outputs.get(output)));
          match recorded {
            Some(value) => Some(value),
            None if self.settings.dry_run => {
              debug!(unit = %unit.path.display(), input = %name, dependency = %dependency.display(), "output unavailable in dry-run, leaving input unset");
              None
            }
            None => {
              return Err(UnitError::MissingOutput {
                dependency: dependency.clone(),
                output: output.clone(),
              });
            }
          }
        }
      };
      if let Some(value) = value {
        env.insert(format!("{}{}", INPUT_ENV_PREFIX, name), env_value(value));
      }
    }
    Ok(env)
  }

  fn complete(&mut self, id: ComponentId, result: Result<ExecutionOutcome, UnitError>) {
    let action = self
      .components
      .unit(id)
      .map(|u| u.execution.action.clone())
      .unwrap_or_default();

    match result {
      Ok(outcome) if outcome.is_success() => {
        if let Some(unit) = self.components.unit_mut(id) {
          if self.settings.dry_run {
            if !unit.execution.dry_run_marker_emitted() {
              DryRunMarker::new(unit.execution.dry_run_marker.clone(), unit.path.clone(), self.events.clone()).emit();
            }
          } else {
            unit.execution.outputs = outcome.outputs;
          }
        }
        self.finish(id, UnitStatus::Succeeded, None);
      }
      Ok(outcome) => {
        if !outcome.logs.is_empty() {
          debug!(unit = ?id, logs = %outcome.logs, "unit output");
        }
        self.finish(
          id,
          UnitStatus::Failed,
          Some(UnitError::ExitStatus {
            action,
            code: outcome.exit_code,
          }),
        );
      }
      Err(e) => self.finish(id, UnitStatus::Failed, Some(e)),
    }

    self.release_dependents(id);
  }

  fn finish(&mut self, id: ComponentId, status: UnitStatus, error: Option<UnitError>) {
    let duration = self.started.remove(&id).map(|t| t.elapsed());
    let Some(unit) = self.components.unit_mut(id) else {
      return;
    };

    match (&status, &error) {
      (UnitStatus::Succeeded, _) => info!(unit = %unit.path.display(), "unit succeeded"),
      (UnitStatus::Failed, Some(e)) => error!(unit = %unit.path.display(), error = %e, "unit failed"),
      (UnitStatus::Skipped, Some(e)) => warn!(unit = %unit.path.display(), reason = %e, "skipping unit"),
      _ => debug!(unit = %unit.path.display(), status = %status, "unit finished"),
    }

    unit.execution.status = status;
    unit.execution.error = error;
    unit.execution.duration = duration;
    self.events.send(RunEvent::UnitFinished {
      unit: unit.path.clone(),
      status,
      duration,
    });
  }

  /// Apply a terminal unit's result to its direct dependents.
  fn release_dependents(&mut self, id: ComponentId) {
    let Some(unit) = self.components.unit(id) else {
      return;
    };
    let satisfied = unit.execution.status.satisfies_dependents() || self.settings.ignore_dependency_errors;
    let path = unit.path.clone();

    for dependent in self.graph.dependents_of(id) {
      if !self.scheduled.contains(&dependent) {
        continue;
      }
      match self.status(dependent) {
        Some(status) if !status.is_terminal() => {}
        _ => continue,
      }

      if satisfied {
        let Some(count) = self.remaining.get_mut(&dependent) else {
          continue;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
          self.mark_ready(dependent);
        }
      } else {
        self.finish(
          dependent,
          UnitStatus::Skipped,
          Some(UnitError::DependencyFailed(path.clone())),
        );
        self.release_dependents(dependent);
      }
    }
  }

  fn cancel_unstarted(&mut self) {
    let unstarted: Vec<ComponentId> = self
      .scheduled
      .iter()
      .copied()
      .filter(|&id| matches!(self.status(id), Some(UnitStatus::Pending | UnitStatus::Ready)))
      .collect();
    info!(count = unstarted.len(), "cancellation requested, not starting remaining units");

    self.ready.clear();
    for id in unstarted {
      self.finish(id, UnitStatus::Canceled, None);
    }
  }
}

fn env_value(value: &serde_json::Value) -> String {
  match value {
    serde_json::Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

fn panic_message(e: JoinError) -> String {
  if e.is_panic() {
    let payload = e.into_panic();
    payload
      .downcast_ref::<&str>()
      .map(|s| s.to_string())
      .or_else(|| payload.downcast_ref::<String>().cloned())
      .unwrap_or_else(|| "unknown panic".to_string())
  } else {
    e.to_string()
  }
}
