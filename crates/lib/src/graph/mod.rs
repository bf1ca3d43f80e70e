//! Dependency graph over discovered units.
//!
//! [`GraphBuilder::build`] resolves every unit's declared dependency paths against the
//! [`Components`] collection, expands stacks into the units they contain, and rejects unresolved
//! references and cycles. The resulting [`DependencyGraph`] is immutable; edges point from a
//! dependency to its dependent.

use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use thiserror::Error;
use tracing::{debug, warn};

use crate::component::{ComponentId, Components};
use crate::util::path::relative_slash;

#[derive(Debug, Clone, Error)]
pub enum GraphError {
  #[error("unit {} depends on {}, which is not a discovered component", unit.display(), missing.display())]
  UnresolvedDependency { unit: PathBuf, missing: PathBuf },

  #[error("dependency cycle detected: {}", render_cycle(cycle))]
  CyclicDependency { cycle: Vec<PathBuf> },
}

fn render_cycle(cycle: &[PathBuf]) -> String {
  cycle
    .iter()
    .map(|p| p.display().to_string())
    .collect::<Vec<_>>()
    .join(" -> ")
}

/// Resolves declared dependencies into a validated [`DependencyGraph`].
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphBuilder {
  allow_external: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
  Unvisited,
  InProgress,
  Done,
}

impl GraphBuilder {
  pub fn new() -> Self {
    Self::default()
  }

  /// Drop dependencies that resolve to no discovered component instead of failing.
  ///
  /// Used when only part of a tree was discovered and the rest is assumed to exist already.
  pub fn allow_external(mut self, allow: bool) -> Self {
    self.allow_external = allow;
    self
  }

  /// Build the unit dependency graph.
  ///
  /// # Errors
  ///
  /// Returns [`GraphError::UnresolvedDependency`] for the first dependency (in discovery order) that
  /// matches no component, and [`GraphError::CyclicDependency`] naming the full loop when the
  /// dependencies are not acyclic. No partial graph is ever returned.
  pub fn build(&self, components: &Components) -> Result<DependencyGraph, GraphError> {
    let units = components.unit_ids();
    let mut deps: HashMap<ComponentId, BTreeSet<ComponentId>> = HashMap::with_capacity(units.len());

    for &id in &units {
      deps.insert(id, self.resolve_unit(components, id)?);
    }

    detect_cycle(components, &units, &deps)?;

    let mut graph = DiGraph::with_capacity(units.len(), 0);
    let mut nodes = HashMap::with_capacity(units.len());
    for &id in &units {
      nodes.insert(id, graph.add_node(id));
    }
    for &id in &units {
      for dep in &deps[&id] {
        graph.add_edge(nodes[dep], nodes[&id], ());
      }
    }

    debug!(units = units.len(), edges = graph.edge_count(), "dependency graph built");
    Ok(DependencyGraph { graph, nodes })
  }

  /// Effective unit dependencies: the unit's own plus those of every enclosing stack.
  fn resolve_unit(&self, components: &Components, id: ComponentId) -> Result<BTreeSet<ComponentId>, GraphError> {
    let mut out = BTreeSet::new();
    let Some(component) = components.get(id) else {
      return Ok(out);
    };

    let declared = std::iter::once(id)
      .chain(components.ancestors(id))
      .filter_map(|c| components.get(c))
      .flat_map(|c| c.dependencies().iter());

    for path in declared {
      match components.id_of(path) {
        Some(target) => out.extend(components.descendant_units(target)),
        None if self.allow_external => {
          warn!(unit = %component.path().display(), dependency = %path.display(), "ignoring external dependency");
        }
        None => {
          return Err(GraphError::UnresolvedDependency {
            unit: component.path().to_path_buf(),
            missing: path.clone(),
          });
        }
      }
    }
    Ok(out)
  }
}

fn detect_cycle(
  components: &Components,
  units: &[ComponentId],
  deps: &HashMap<ComponentId, BTreeSet<ComponentId>>,
) -> Result<(), GraphError> {
  let mut marks: HashMap<ComponentId, Mark> = units.iter().map(|&id| (id, Mark::Unvisited)).collect();
  let mut path = Vec::new();

  for &id in units {
    if marks[&id] == Mark::Unvisited
      && let Some(cycle) = visit(id, deps, &mut marks, &mut path)
    {
      let cycle = cycle
        .into_iter()
        .filter_map(|c| components.get(c).map(|c| c.path().to_path_buf()))
        .collect();
      return Err(GraphError::CyclicDependency { cycle });
    }
  }
  Ok(())
}

fn visit(
  id: ComponentId,
  deps: &HashMap<ComponentId, BTreeSet<ComponentId>>,
  marks: &mut HashMap<ComponentId, Mark>,
  path: &mut Vec<ComponentId>,
) -> Option<Vec<ComponentId>> {
  marks.insert(id, Mark::InProgress);
  path.push(id);

  for &dep in deps.get(&id).into_iter().flatten() {
    match marks.get(&dep).copied().unwrap_or(Mark::Done) {
      Mark::InProgress => {
        let start = path.iter().position(|&p| p == dep).unwrap_or(0);
        let mut cycle = path[start..].to_vec();
        cycle.push(dep);
        return Some(cycle);
      }
      Mark::Unvisited => {
        if let Some(cycle) = visit(dep, deps, marks, path) {
          return Some(cycle);
        }
      }
      Mark::Done => {}
    }
  }

  path.pop();
  marks.insert(id, Mark::Done);
  None
}

/// An acyclic unit dependency graph.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
  graph: DiGraph<ComponentId, ()>,
  nodes: HashMap<ComponentId, NodeIndex>,
}

impl DependencyGraph {
  /// All units in discovery order.
  pub fn units(&self) -> Vec<ComponentId> {
    self.graph.node_weights().copied().collect()
  }

  pub fn contains(&self, id: ComponentId) -> bool {
    self.nodes.contains_key(&id)
  }

  pub fn len(&self) -> usize {
    self.graph.node_count()
  }

  pub fn is_empty(&self) -> bool {
    self.graph.node_count() == 0
  }

  pub fn edge_count(&self) -> usize {
    self.graph.edge_count()
  }

  /// Direct dependencies of a unit, in discovery order.
  pub fn dependencies_of(&self, id: ComponentId) -> Vec<ComponentId> {
    self.neighbors(id, Direction::Incoming)
  }

  /// Direct dependents of a unit, in discovery order.
  pub fn dependents_of(&self, id: ComponentId) -> Vec<ComponentId> {
    self.neighbors(id, Direction::Outgoing)
  }

  fn neighbors(&self, id: ComponentId, direction: Direction) -> Vec<ComponentId> {
    let Some(&idx) = self.nodes.get(&id) else {
      return Vec::new();
    };
    let mut out: Vec<ComponentId> = self
      .graph
      .neighbors_directed(idx, direction)
      .map(|n| self.graph[n])
      .collect();
    out.sort();
    out.dedup();
    out
  }

  /// `targets` plus everything they transitively depend on.
  pub fn with_dependencies(&self, targets: impl IntoIterator<Item = ComponentId>) -> BTreeSet<ComponentId> {
    let mut seen = BTreeSet::new();
    let mut stack: Vec<ComponentId> = targets.into_iter().filter(|id| self.contains(*id)).collect();
    while let Some(id) = stack.pop() {
      if seen.insert(id) {
        stack.extend(self.dependencies_of(id));
      }
    }
    seen
  }

  /// Units ordered so every dependency precedes its dependents; ties broken by discovery order.
  pub fn topological_order(&self) -> Vec<ComponentId> {
    let mut remaining: HashMap<ComponentId, usize> = self
      .nodes
      .iter()
      .map(|(&id, &idx)| (id, self.graph.neighbors_directed(idx, Direction::Incoming).count()))
      .collect();
    let mut ready: BTreeSet<ComponentId> = remaining.iter().filter(|(_, n)| **n == 0).map(|(&id, _)| id).collect();
    let mut order = Vec::with_capacity(self.len());

    while let Some(id) = ready.pop_first() {
      order.push(id);
      for dependent in self.dependents_of(id) {
        if let Some(count) = remaining.get_mut(&dependent) {
          *count = count.saturating_sub(1);
          if *count == 0 {
            ready.insert(dependent);
          }
        }
      }
    }
    order
  }

  /// Render as Graphviz DOT, edges pointing from dependent to dependency.
  pub fn to_dot(&self, components: &Components, root: &Path) -> String {
    let label = |id: ComponentId| {
      components
        .get(id)
        .map(|c| relative_slash(root, c.path()))
        .unwrap_or_else(|| id.to_string())
    };

    let mut out = String::from("digraph {\n");
    for id in self.units() {
      let _ = writeln!(out, "  \"{}\" ;", label(id));
      for dep in self.dependencies_of(id) {
        let _ = writeln!(out, "  \"{}\" -> \"{}\";", label(id), label(dep));
      }
    }
    out.push_str("}\n");
    out
  }
}
