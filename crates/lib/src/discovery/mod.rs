//! Filesystem discovery of units and stacks.
//!
//! [`Discoverer::discover`] walks a root directory in file-name order, turns every directory
//! carrying a marker file into a [`Component`](crate::component::Component), and links each one to
//! its nearest enclosing stack. The walk is read-only and deterministic: the same tree always
//! produces the same [`Components`] in the same order.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use glob::{MatchOptions, Pattern};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::component::{Component, ComponentError, ComponentId, Components, Kind, Stack, Unit};
use crate::consts::{DEFAULT_EXCLUDES, STACK_MARKER, UNIT_MARKER};
use crate::parser::{ConfigParser, Expression, ParseError, TomlConfigParser};
use crate::util::path::{relative_slash, resolve_relative};

/// What to do when a marker fails to parse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ParseErrorPolicy {
  /// Abort on the first malformed marker.
  #[default]
  FailFast,
  /// Walk the whole tree, then fail with every malformed marker.
  Collect,
}

/// Filters and policies for one discovery pass.
#[derive(Debug, Clone)]
pub struct DiscoveryOptions {
  /// Root-relative globs; when non-empty, only components at or under a match are kept.
  pub include: Vec<String>,
  /// Root-relative globs; matching directories are not traversed.
  pub exclude: Vec<String>,
  /// Component kinds to discover.
  pub kinds: Vec<Kind>,
  pub parse_errors: ParseErrorPolicy,
  /// Maximum traversal depth below the root (`0` = the root only).
  pub max_depth: Option<usize>,
}

impl Default for DiscoveryOptions {
  fn default() -> Self {
    Self {
      include: Vec::new(),
      exclude: Vec::new(),
      kinds: vec![Kind::Unit, Kind::Stack],
      parse_errors: ParseErrorPolicy::FailFast,
      max_depth: None,
    }
  }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
  #[error("root path does not exist: {}", .0.display())]
  RootNotFound(PathBuf),

  #[error("root path is not a directory: {}", .0.display())]
  NotADirectory(PathBuf),

  #[error("failed to resolve {}: {source}", path.display())]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to walk directory tree: {0}")]
  Walk(#[from] walkdir::Error),

  #[error("invalid glob pattern '{pattern}': {source}")]
  InvalidPattern {
    pattern: String,
    #[source]
    source: glob::PatternError,
  },

  #[error(transparent)]
  Parse(#[from] ParseError),

  #[error("{} configuration file(s) failed to parse:\n{}", .0.len(), render_parse_errors(.0))]
  ParseErrors(Vec<ParseError>),

  #[error(transparent)]
  Component(#[from] ComponentError),
}

fn render_parse_errors(errors: &[ParseError]) -> String {
  errors.iter().map(|e| format!("  {}", e)).collect::<Vec<_>>().join("\n")
}

/// Compiled glob filters, matched against root-relative `/`-separated paths.
#[derive(Debug, Clone, Default)]
pub(crate) struct PathFilter {
  include: Vec<Pattern>,
  exclude: Vec<Pattern>,
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
  case_sensitive: true,
  require_literal_separator: true,
  require_literal_leading_dot: false,
};

impl PathFilter {
  pub(crate) fn new(include: &[String], exclude: &[String]) -> Result<Self, DiscoveryError> {
    Ok(Self {
      include: compile(include)?,
      exclude: compile(exclude)?,
    })
  }

  /// True when `rel` or one of its ancestors matches an exclude pattern.
  pub(crate) fn is_excluded(&self, rel: &str) -> bool {
    matches_prefix(&self.exclude, rel)
  }

  /// True when there are no include patterns, or `rel` or one of its ancestors matches one.
  pub(crate) fn is_included(&self, rel: &str) -> bool {
    self.include.is_empty() || matches_prefix(&self.include, rel)
  }
}

fn compile(patterns: &[String]) -> Result<Vec<Pattern>, DiscoveryError> {
  patterns
    .iter()
    .map(|p| {
      let trimmed = p.trim_end_matches('/');
      let trimmed = trimmed.strip_prefix("./").unwrap_or(trimmed);
      Pattern::new(if trimmed.is_empty() { "." } else { trimmed }).map_err(|source| {
        DiscoveryError::InvalidPattern {
          pattern: p.clone(),
          source,
        }
      })
    })
    .collect()
}

fn matches_prefix(patterns: &[Pattern], rel: &str) -> bool {
  if patterns.iter().any(|p| p.matches_with(rel, MATCH_OPTIONS)) {
    return true;
  }
  if rel == "." {
    return false;
  }
  // Walk ancestors: "a/b/c" -> "a/b" -> "a".
  let mut end = rel.len();
  while let Some(idx) = rel[..end].rfind('/') {
    end = idx;
    if patterns.iter().any(|p| p.matches_with(&rel[..end], MATCH_OPTIONS)) {
      return true;
    }
  }
  false
}

/// Walks a directory tree and builds the [`Components`] collection.
pub struct Discoverer {
  options: DiscoveryOptions,
  parser: Arc<dyn ConfigParser>,
}

impl Discoverer {
  /// A discoverer using the TOML marker parser.
  pub fn new(options: DiscoveryOptions) -> Self {
    Self {
      options,
      parser: Arc::new(TomlConfigParser),
    }
  }

  /// Replace the configuration-parser collaborator.
  pub fn with_parser(mut self, parser: Arc<dyn ConfigParser>) -> Self {
    self.parser = parser;
    self
  }

  /// Discover every component under `root`.
  ///
  /// # Errors
  ///
  /// Returns [`DiscoveryError::RootNotFound`] / [`DiscoveryError::NotADirectory`] for a bad root,
  /// and a parse error (or all of them, under [`ParseErrorPolicy::Collect`]) for malformed markers.
  pub fn discover(&self, root: &Path) -> Result<Components, DiscoveryError> {
    if !root.exists() {
      return Err(DiscoveryError::RootNotFound(root.to_path_buf()));
    }
    if !root.is_dir() {
      return Err(DiscoveryError::NotADirectory(root.to_path_buf()));
    }
    let root = dunce::canonicalize(root).map_err(|source| DiscoveryError::Io {
      path: root.to_path_buf(),
      source,
    })?;

    let filter = PathFilter::new(&self.options.include, &self.options.exclude)?;

    let mut walker = WalkDir::new(&root).sort_by_file_name();
    if let Some(depth) = self.options.max_depth {
      walker = walker.max_depth(depth);
    }

    let mut components = Components::new();
    let mut open_stacks: Vec<(PathBuf, ComponentId)> = Vec::new();
    let mut errors = Vec::new();

    let entries = walker.into_iter().filter_entry(|entry| keep_entry(&root, &filter, entry));
    for entry in entries {
      let entry = entry?;
      let dir = entry.path();

      let kind = match self.marker_kind(dir) {
        Ok(Some(kind)) => kind,
        Ok(None) => continue,
        Err(e) => {
          self.record_parse_error(e, &mut errors)?;
          continue;
        }
      };

      if !filter.is_included(&relative_slash(&root, dir)) {
        debug!(path = %dir.display(), "component outside include filters");
        continue;
      }

      let marker = dir.join(match kind {
        Kind::Unit => UNIT_MARKER,
        Kind::Stack => STACK_MARKER,
      });
      let config = match self.parser.parse(kind, &marker) {
        Ok(config) => config,
        Err(e) => {
          self.record_parse_error(e, &mut errors)?;
          continue;
        }
      };

      let dependencies = dedup(config.dependencies.iter().map(|d| resolve_relative(dir, d)));
      let component: Component = match kind {
        Kind::Unit => {
          let mut unit = Unit::new(dir);
          unit.dependencies = dependencies;
          unit.inputs = config
            .inputs
            .into_iter()
            .map(|(name, expr)| (name, resolve_expression(dir, expr)))
            .collect();
          unit.into()
        }
        Kind::Stack => {
          let mut stack = Stack::new(dir);
          stack.dependencies = dependencies;
          stack.into()
        }
      };

      let id = components.push(component)?;
      debug!(path = %dir.display(), kind = %kind, "discovered component");

      while let Some((stack_path, _)) = open_stacks.last() {
        if dir.starts_with(stack_path) {
          break;
        }
        open_stacks.pop();
      }
      if let Some(&(_, parent)) = open_stacks.last() {
        components.adopt(parent, id)?;
      }
      if kind == Kind::Stack {
        open_stacks.push((dir.to_path_buf(), id));
      }
    }

    if !errors.is_empty() {
      warn!(count = errors.len(), "discovery found malformed configuration");
      return Err(DiscoveryError::ParseErrors(errors));
    }

    info!(root = %root.display(), count = components.len(), "discovery complete");
    Ok(components)
  }

  /// Which enabled marker `dir` carries, if any.
  fn marker_kind(&self, dir: &Path) -> Result<Option<Kind>, ParseError> {
    let unit = dir.join(UNIT_MARKER).is_file();
    let stack = dir.join(STACK_MARKER).is_file();
    let kind = match (unit, stack) {
      (true, true) => {
        return Err(ParseError::new(
          dir,
          format!("directory contains both {} and {}", UNIT_MARKER, STACK_MARKER),
        ));
      }
      (true, false) => Kind::Unit,
      (false, true) => Kind::Stack,
      (false, false) => return Ok(None),
    };
    Ok(self.options.kinds.contains(&kind).then_some(kind))
  }

  fn record_parse_error(&self, error: ParseError, errors: &mut Vec<ParseError>) -> Result<(), DiscoveryError> {
    match self.options.parse_errors {
      ParseErrorPolicy::FailFast => Err(error.into()),
      ParseErrorPolicy::Collect => {
        debug!(path = %error.path.display(), "collected parse error");
        errors.push(error);
        Ok(())
      }
    }
  }
}

fn keep_entry(root: &Path, filter: &PathFilter, entry: &DirEntry) -> bool {
  if !entry.file_type().is_dir() {
    return false;
  }
  if entry.depth() == 0 {
    return !filter.is_excluded(".");
  }
  let name = entry.file_name().to_string_lossy();
  if name.starts_with('.') || DEFAULT_EXCLUDES.contains(&name.as_ref()) {
    return false;
  }
  !filter.is_excluded(&relative_slash(root, entry.path()))
}

fn resolve_expression(dir: &Path, expr: Expression) -> Expression {
  match expr {
    Expression::Output { dependency, name } => Expression::Output {
      dependency: resolve_relative(dir, &dependency),
      name,
    },
    literal => literal,
  }
}

fn dedup(paths: impl Iterator<Item = PathBuf>) -> Vec<PathBuf> {
  let mut out: Vec<PathBuf> = Vec::new();
  for path in paths {
    if !out.contains(&path) {
      out.push(path);
    }
  }
  out
}
