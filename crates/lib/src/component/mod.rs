//! Discovered components: units, stacks, and the flat collection that owns them.
//!
//! Components live in a flat arena ([`Components`]) addressed by [`ComponentId`]. A stack owns
//! the ordered ids of its children; a child's `parent` is a lookup relation back into the same
//! arena and implies no ownership. Identity across a run is the canonical directory path.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::parser::Expression;
use crate::runner::types::UnitError;

/// Named values a unit records after it succeeds.
pub type Outputs = BTreeMap<String, serde_json::Value>;

/// The two component variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
  Unit,
  Stack,
}

impl fmt::Display for Kind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(match self {
      Kind::Unit => "unit",
      Kind::Stack => "stack",
    })
  }
}

/// Index of a component in its [`Components`] collection.
///
/// Ids follow discovery order, so ordering by id is ordering by discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ComponentId(pub usize);

impl fmt::Display for ComponentId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}

/// Lifecycle of a unit within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
  Pending,
  Ready,
  Running,
  Succeeded,
  Failed,
  Skipped,
  Canceled,
}

impl UnitStatus {
  /// Terminal states admit no further transition.
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      UnitStatus::Succeeded | UnitStatus::Failed | UnitStatus::Skipped | UnitStatus::Canceled
    )
  }

  /// Whether dependents of a unit in this state may still run under the default policy.
  pub fn satisfies_dependents(self) -> bool {
    self == UnitStatus::Succeeded
  }
}

impl fmt::Display for UnitStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      UnitStatus::Pending => "pending",
      UnitStatus::Ready => "ready",
      UnitStatus::Running => "running",
      UnitStatus::Succeeded => "succeeded",
      UnitStatus::Failed => "failed",
      UnitStatus::Skipped => "skipped",
      UnitStatus::Canceled => "canceled",
    };
    f.pad(s)
  }
}

/// Execution record of a unit, owned and mutated only by the runner.
#[derive(Debug, Clone)]
pub struct UnitExecution {
  pub working_dir: PathBuf,
  pub action: String,
  pub extra_args: Vec<String>,
  pub environment: BTreeMap<String, String>,
  /// Populated only after the unit succeeds.
  pub outputs: Outputs,
  pub status: UnitStatus,
  pub error: Option<UnitError>,
  pub duration: Option<Duration>,
  /// Set once the dry-run marker has been emitted for this unit.
  pub(crate) dry_run_marker: Arc<AtomicBool>,
}

impl UnitExecution {
  fn new(working_dir: PathBuf) -> Self {
    Self {
      working_dir,
      action: String::new(),
      extra_args: Vec::new(),
      environment: BTreeMap::new(),
      outputs: Outputs::new(),
      status: UnitStatus::Pending,
      error: None,
      duration: None,
      dry_run_marker: Arc::new(AtomicBool::new(false)),
    }
  }

  /// Reset for a new run of `action`.
  pub(crate) fn prepare(&mut self, action: &str, extra_args: &[String]) {
    *self = Self::new(std::mem::take(&mut self.working_dir));
    self.action = action.to_string();
    self.extra_args = extra_args.to_vec();
  }

  pub fn dry_run_marker_emitted(&self) -> bool {
    self.dry_run_marker.load(Ordering::SeqCst)
  }
}

/// A leaf deployable configuration directory.
#[derive(Debug, Clone)]
pub struct Unit {
  pub path: PathBuf,
  /// Resolved dependency paths, as declared (stacks not yet expanded).
  pub dependencies: Vec<PathBuf>,
  pub inputs: BTreeMap<String, Expression>,
  pub parent: Option<ComponentId>,
  pub execution: UnitExecution,
}

impl Unit {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    let path = path.into();
    Self {
      execution: UnitExecution::new(path.clone()),
      path,
      dependencies: Vec::new(),
      inputs: BTreeMap::new(),
      parent: None,
    }
  }
}

/// A grouping of units and nested stacks. Not itself schedulable.
#[derive(Debug, Clone)]
pub struct Stack {
  pub path: PathBuf,
  pub dependencies: Vec<PathBuf>,
  pub parent: Option<ComponentId>,
  /// Owned children in discovery order.
  pub children: Vec<ComponentId>,
}

impl Stack {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      dependencies: Vec::new(),
      parent: None,
      children: Vec::new(),
    }
  }
}

#[derive(Debug, Clone)]
pub enum Component {
  Unit(Unit),
  Stack(Stack),
}

impl Component {
  pub fn path(&self) -> &Path {
    match self {
      Component::Unit(u) => &u.path,
      Component::Stack(s) => &s.path,
    }
  }

  pub fn kind(&self) -> Kind {
    match self {
      Component::Unit(_) => Kind::Unit,
      Component::Stack(_) => Kind::Stack,
    }
  }

  pub fn dependencies(&self) -> &[PathBuf] {
    match self {
      Component::Unit(u) => &u.dependencies,
      Component::Stack(s) => &s.dependencies,
    }
  }

  pub fn parent(&self) -> Option<ComponentId> {
    match self {
      Component::Unit(u) => u.parent,
      Component::Stack(s) => s.parent,
    }
  }

  fn set_parent(&mut self, parent: ComponentId) {
    match self {
      Component::Unit(u) => u.parent = Some(parent),
      Component::Stack(s) => s.parent = Some(parent),
    }
  }

  pub fn as_unit(&self) -> Option<&Unit> {
    match self {
      Component::Unit(u) => Some(u),
      Component::Stack(_) => None,
    }
  }

  pub fn as_stack(&self) -> Option<&Stack> {
    match self {
      Component::Stack(s) => Some(s),
      Component::Unit(_) => None,
    }
  }
}

impl From<Unit> for Component {
  fn from(unit: Unit) -> Self {
    Component::Unit(unit)
  }
}

impl From<Stack> for Component {
  fn from(stack: Stack) -> Self {
    Component::Stack(stack)
  }
}

#[derive(Debug, Error)]
pub enum ComponentError {
  #[error("duplicate component path: {}", .0.display())]
  DuplicatePath(PathBuf),

  #[error("component {0} is not a stack")]
  NotAStack(ComponentId),

  #[error("unknown component {0}")]
  Unknown(ComponentId),
}

/// Ordered, path-unique collection of components. Insertion order is discovery order.
#[derive(Debug, Clone, Default)]
pub struct Components {
  items: Vec<Component>,
  by_path: HashMap<PathBuf, ComponentId>,
}

impl Components {
  pub fn new() -> Self {
    Self::default()
  }

  /// Append a component, rejecting a path already present.
  pub fn push(&mut self, component: impl Into<Component>) -> Result<ComponentId, ComponentError> {
    let component = component.into();
    let path = component.path().to_path_buf();
    if self.by_path.contains_key(&path) {
      return Err(ComponentError::DuplicatePath(path));
    }
    let id = ComponentId(self.items.len());
    self.items.push(component);
    self.by_path.insert(path, id);
    Ok(id)
  }

  /// Record `child` as owned by the stack `parent`, in call order.
  pub fn adopt(&mut self, parent: ComponentId, child: ComponentId) -> Result<(), ComponentError> {
    if child.0 >= self.items.len() {
      return Err(ComponentError::Unknown(child));
    }
    match self.items.get_mut(parent.0) {
      Some(Component::Stack(stack)) => stack.children.push(child),
      Some(Component::Unit(_)) => return Err(ComponentError::NotAStack(parent)),
      None => return Err(ComponentError::Unknown(parent)),
    }
    self.items[child.0].set_parent(parent);
    Ok(())
  }

  pub fn get(&self, id: ComponentId) -> Option<&Component> {
    self.items.get(id.0)
  }

  pub fn unit(&self, id: ComponentId) -> Option<&Unit> {
    self.get(id).and_then(Component::as_unit)
  }

  pub(crate) fn unit_mut(&mut self, id: ComponentId) -> Option<&mut Unit> {
    match self.items.get_mut(id.0) {
      Some(Component::Unit(u)) => Some(u),
      _ => None,
    }
  }

  pub fn id_of(&self, path: &Path) -> Option<ComponentId> {
    self.by_path.get(path).copied()
  }

  pub fn by_path(&self, path: &Path) -> Option<&Component> {
    self.id_of(path).and_then(|id| self.get(id))
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (ComponentId, &Component)> {
    self.items.iter().enumerate().map(|(i, c)| (ComponentId(i), c))
  }

  /// Ids of all units, in discovery order.
  pub fn unit_ids(&self) -> Vec<ComponentId> {
    self
      .iter()
      .filter(|(_, c)| c.kind() == Kind::Unit)
      .map(|(id, _)| id)
      .collect()
  }

  /// All units transitively contained in `id`. A unit yields itself.
  pub fn descendant_units(&self, id: ComponentId) -> Vec<ComponentId> {
    let mut out = Vec::new();
    self.collect_units(id, &mut out);
    out
  }

  fn collect_units(&self, id: ComponentId, out: &mut Vec<ComponentId>) {
    match self.get(id) {
      Some(Component::Unit(_)) => out.push(id),
      Some(Component::Stack(stack)) => {
        for &child in &stack.children {
          self.collect_units(child, out);
        }
      }
      None => {}
    }
  }

  /// Ancestor stacks of `id`, nearest first.
  pub fn ancestors(&self, id: ComponentId) -> Vec<ComponentId> {
    let mut out = Vec::new();
    let mut current = self.get(id).and_then(Component::parent);
    while let Some(parent) = current {
      out.push(parent);
      current = self.get(parent).and_then(Component::parent);
    }
    out
  }
}
