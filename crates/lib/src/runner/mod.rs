//! Running an action across a discovered stack.
//!
//! [`find_stack_in_subfolders`] discovers components under a root and validates their dependency
//! graph, producing a [`StackRunner`]. [`StackRunner::run`] then drives every targeted unit (and
//! whatever it depends on) through its lifecycle:
//!
//! ```text
//! Pending ──> Ready ──> Running ──> Succeeded | Failed
//!    │          │
//!    │          └──────> Canceled      (cancellation before start)
//!    └──> Skipped | Canceled           (failed dependency / cancellation)
//! ```
//!
//! A unit starts as soon as its own dependencies are terminal; there are no global levels.

pub mod events;
pub mod executor;
pub mod locks;
pub mod process;
mod scheduler;
pub mod types;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::component::{ComponentId, Components, Outputs};
use crate::config::{EngineConfig, RunOptions, RunSettings};
use crate::discovery::{Discoverer, DiscoveryOptions, PathFilter};
use crate::graph::{DependencyGraph, GraphBuilder};
use crate::parser::Expression;
use crate::util::path::relative_slash;

pub use events::{Events, RunEvent};
pub use executor::{DryRunMarker, ExecutionOutcome, ExecutionRequest, Executor};
pub use locks::PathLocks;
pub use process::ProcessExecutor;
pub use types::{ExecuteError, RunFailure, RunSummary, StackError, StatusCounts, UnitError, UnitReport};

use scheduler::Scheduler;

/// Discover every component under `root` and build a runner over the validated graph.
///
/// # Errors
///
/// Any discovery, parse, unresolved-dependency, or cycle error. Nothing is executed.
pub fn find_stack_in_subfolders(
  root: &Path,
  options: &DiscoveryOptions,
  executor: Arc<dyn Executor>,
  config: EngineConfig,
) -> Result<StackRunner, StackError> {
  StackRunner::discover(root, &Discoverer::new(options.clone()), GraphBuilder::new(), executor, config)
}

/// Executes an action across a dependency graph of units.
pub struct StackRunner {
  root: PathBuf,
  components: Components,
  graph: DependencyGraph,
  executor: Arc<dyn Executor>,
  config: EngineConfig,
  events: Events,
  locks: PathLocks,
}

impl StackRunner {
  pub fn new(
    root: impl Into<PathBuf>,
    components: Components,
    graph: DependencyGraph,
    executor: Arc<dyn Executor>,
    config: EngineConfig,
  ) -> Self {
    Self {
      root: root.into(),
      components,
      graph,
      executor,
      config,
      events: Events::none(),
      locks: PathLocks::new(),
    }
  }

  /// Discover with `discoverer`, build the graph with `builder`, and wrap the result.
  pub fn discover(
    root: &Path,
    discoverer: &Discoverer,
    builder: GraphBuilder,
    executor: Arc<dyn Executor>,
    config: EngineConfig,
  ) -> Result<Self, StackError> {
    let components = discoverer.discover(root)?;
    let graph = builder.build(&components)?;
    let root = dunce::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    Ok(Self::new(root, components, graph, executor, config))
  }

  /// Publish [`RunEvent`]s to `sender` during runs.
  pub fn with_events(mut self, sender: UnboundedSender<RunEvent>) -> Self {
    self.events = Events::new(sender);
    self
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn components(&self) -> &Components {
    &self.components
  }

  pub fn graph(&self) -> &DependencyGraph {
    &self.graph
  }

  pub fn config(&self) -> &EngineConfig {
    &self.config
  }

  /// Run `action` across the targeted units.
  ///
  /// Returns once every scheduled unit is terminal, including after cancellation. The summary's
  /// [`RunSummary::error`] carries per-unit failures; `Err` is reserved for invalid options.
  pub async fn run(
    &mut self,
    cancel: CancellationToken,
    action: &str,
    extra_args: &[String],
    options: &RunOptions,
  ) -> Result<RunSummary, StackError> {
    if action.trim().is_empty() {
      return Err(StackError::InvalidOptions("action must not be empty".to_string()));
    }
    let settings = options.resolve(&self.config)?;
    let filter = PathFilter::new(&settings.include, &settings.exclude)?;

    let targets = self.graph.units().into_iter().filter(|&id| {
      self.components.get(id).is_some_and(|c| {
        let rel = relative_slash(&self.root, c.path());
        filter.is_included(&rel) && !filter.is_excluded(&rel)
      })
    });
    let scheduled = self.graph.with_dependencies(targets.collect::<Vec<_>>());

    for &id in &scheduled {
      if let Some(unit) = self.components.unit_mut(id) {
        unit.execution.prepare(action, extra_args);
      }
    }

    info!(
      action,
      units = scheduled.len(),
      max_concurrency = settings.max_concurrency,
      dry_run = settings.dry_run,
      "starting run"
    );
    let start = Instant::now();
    let external = self.external_outputs(&scheduled, &settings).await;

    let mut scheduler = Scheduler::new(
      &mut self.components,
      &self.graph,
      self.executor.clone(),
      &settings,
      &self.events,
      &self.locks,
      scheduled,
    )
    .with_external_outputs(external);
    let canceled = scheduler.run(&cancel).await;
    let units = scheduler.reports();

    let summary = RunSummary {
      action: action.to_string(),
      units,
      canceled,
      duration: start.elapsed(),
    };
    let counts = summary.counts();
    info!(
      succeeded = counts.succeeded,
      failed = counts.failed,
      skipped = counts.skipped,
      canceled = counts.canceled,
      "run complete"
    );
    self.events.send(RunEvent::RunFinished {
      counts,
      canceled: summary.canceled,
    });
    Ok(summary)
  }

  /// Outputs of units that scheduled inputs reference but that are not scheduled themselves.
  ///
  /// Single-unit runs drop dependencies outside the discovered tree; their outputs are read through
  /// the executor instead. A failed read leaves the outputs missing.
  async fn external_outputs(
    &self,
    scheduled: &BTreeSet<ComponentId>,
    settings: &RunSettings,
  ) -> BTreeMap<PathBuf, Outputs> {
    let mut referenced = BTreeSet::new();
    for unit in scheduled.iter().filter_map(|&id| self.components.unit(id)) {
      for expr in unit.inputs.values() {
        if let Expression::Output { dependency, .. } = expr {
          let in_run = self
            .components
            .id_of(dependency)
            .is_some_and(|id| scheduled.contains(&id));
          if !in_run {
            referenced.insert(dependency.clone());
          }
        }
      }
    }

    let mut outputs = BTreeMap::new();
    for dependency in referenced {
      match self.executor.read_outputs(&dependency, &settings.environment).await {
        Ok(values) => {
          debug!(dependency = %dependency.display(), count = values.len(), "read outputs from outside the run");
          outputs.insert(dependency, values);
        }
        Err(e) => warn!(dependency = %dependency.display(), error = %e, "failed to read dependency outputs"),
      }
    }
    outputs
  }
}
