//! Configuration-parser collaborator.
//!
//! The engine never evaluates configuration itself. It asks a [`ConfigParser`] for two things per
//! component: the dependency paths it declares and its input expressions. The only property of an
//! [`Expression`] the engine looks at is whether it references another unit's recorded outputs.
//!
//! [`TomlConfigParser`] is the default implementation, reading the `unit.toml` / `stack.toml`
//! marker files:
//!
//! ```toml
//! dependencies = ["../vpc"]
//!
//! [inputs]
//! region = "eu-west-1"
//! vpc_id = { from = "../vpc", output = "vpc_id" }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::component::Kind;

/// An input value as declared in a component's configuration.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
  /// A value known at parse time.
  Literal(serde_json::Value),
  /// A named output recorded by another unit after it succeeds.
  Output {
    /// Dependency path, as declared (relative to the declaring component).
    dependency: PathBuf,
    /// Output name.
    name: String,
  },
}

impl Expression {
  /// Returns the `(dependency, output)` pair if this expression reads another unit's outputs.
  pub fn output_reference(&self) -> Option<(&Path, &str)> {
    match self {
      Expression::Output { dependency, name } => Some((dependency.as_path(), name.as_str())),
      Expression::Literal(_) => None,
    }
  }
}

/// What a parser extracts from one component's configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComponentConfig {
  /// Declared dependency paths, relative to the component's directory unless absolute.
  pub dependencies: Vec<PathBuf>,
  /// Named input expressions.
  pub inputs: BTreeMap<String, Expression>,
}

/// A malformed configuration marker.
#[derive(Debug, Clone, Error)]
#[error("failed to parse {}: {message}", path.display())]
pub struct ParseError {
  /// The marker file (or directory) the error is attributed to.
  pub path: PathBuf,
  pub message: String,
}

impl ParseError {
  pub fn new(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
    Self {
      path: path.into(),
      message: message.into(),
    }
  }
}

/// Reads a component's declared dependencies and inputs from its marker file.
pub trait ConfigParser: Send + Sync {
  /// Parse the marker file at `marker` for a component of the given kind.
  fn parse(&self, kind: Kind, marker: &Path) -> Result<ComponentConfig, ParseError>;
}

/// Default parser for the TOML marker format.
#[derive(Debug, Clone, Copy, Default)]
pub struct TomlConfigParser;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
  #[serde(default)]
  dependencies: Vec<PathBuf>,
  #[serde(default)]
  inputs: BTreeMap<String, RawInput>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawInput {
  Output(RawOutputRef),
  Literal(toml::Value),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawOutputRef {
  from: PathBuf,
  output: String,
}

impl TomlConfigParser {
  /// Parse marker content directly. `marker` is only used for error attribution.
  pub fn parse_str(&self, kind: Kind, marker: &Path, content: &str) -> Result<ComponentConfig, ParseError> {
    let raw: RawConfig = toml::from_str(content).map_err(|e| ParseError::new(marker, e.message()))?;

    if kind == Kind::Stack && !raw.inputs.is_empty() {
      return Err(ParseError::new(marker, "stacks cannot declare inputs"));
    }

    let mut dependencies = raw.dependencies;
    let mut inputs = BTreeMap::new();

    for (name, raw_input) in raw.inputs {
      let expr = match raw_input {
        RawInput::Output(reference) => {
          if !dependencies.contains(&reference.from) {
            dependencies.push(reference.from.clone());
          }
          Expression::Output {
            dependency: reference.from,
            name: reference.output,
          }
        }
        RawInput::Literal(value) => {
          let json = serde_json::to_value(&value)
            .map_err(|e| ParseError::new(marker, format!("input '{}': {}", name, e)))?;
          Expression::Literal(json)
        }
      };
      inputs.insert(name, expr);
    }

    Ok(ComponentConfig { dependencies, inputs })
  }
}

impl ConfigParser for TomlConfigParser {
  fn parse(&self, kind: Kind, marker: &Path) -> Result<ComponentConfig, ParseError> {
    let content = std::fs::read_to_string(marker).map_err(|e| ParseError::new(marker, e.to_string()))?;
    self.parse_str(kind, marker, &content)
  }
}
