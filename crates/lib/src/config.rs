//! Engine configuration.
//!
//! [`EngineConfig`] captures environment-style overrides once, as an explicit value. Per-run
//! [`RunOptions`] are resolved against it with the precedence explicit option > environment >
//! built-in default.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::consts::{
  DEFAULT_TF_PATH, ENV_DRY_RUN, ENV_IGNORE_DEPENDENCY_ERRORS, ENV_PARALLELISM, ENV_PLUGIN_CACHE_DIR, ENV_TF_PATH,
};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
  #[error("invalid value for {var}: '{value}' ({expected})")]
  InvalidValue {
    var: &'static str,
    value: String,
    expected: &'static str,
  },

  #[error("max concurrency must be at least 1")]
  ZeroConcurrency,
}

/// Overrides read from the environment. `None` means the variable was not set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
  pub dry_run: Option<bool>,
  pub parallelism: Option<usize>,
  pub ignore_dependency_errors: Option<bool>,
  /// Path of the IaC binary used by the process executor.
  pub tf_path: String,
  /// Shared plugin cache; `init` runs against it are serialized.
  pub plugin_cache_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      dry_run: None,
      parallelism: None,
      ignore_dependency_errors: None,
      tf_path: DEFAULT_TF_PATH.to_string(),
      plugin_cache_dir: None,
    }
  }
}

impl EngineConfig {
  /// Read overrides from the process environment.
  pub fn from_env() -> Result<Self, ConfigError> {
    Self::from_lookup(|var| std::env::var(var).ok())
  }

  /// Read overrides from an arbitrary lookup function. Empty values count as unset.
  pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
  where
    F: Fn(&str) -> Option<String>,
  {
    let get = |var: &str| lookup(var).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    let dry_run = get(ENV_DRY_RUN).map(|v| parse_bool(ENV_DRY_RUN, &v)).transpose()?;
    let ignore_dependency_errors = get(ENV_IGNORE_DEPENDENCY_ERRORS)
      .map(|v| parse_bool(ENV_IGNORE_DEPENDENCY_ERRORS, &v))
      .transpose()?;
    let parallelism = get(ENV_PARALLELISM)
      .map(|v| match v.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidValue {
          var: ENV_PARALLELISM,
          value: v,
          expected: "a positive integer",
        }),
      })
      .transpose()?;
    let tf_path = get(ENV_TF_PATH).unwrap_or_else(|| DEFAULT_TF_PATH.to_string());
    let plugin_cache_dir = get(ENV_PLUGIN_CACHE_DIR).map(PathBuf::from);

    Ok(Self {
      dry_run,
      parallelism,
      ignore_dependency_errors,
      tf_path,
      plugin_cache_dir,
    })
  }
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
  match value.to_ascii_lowercase().as_str() {
    "1" | "true" | "yes" | "on" => Ok(true),
    "0" | "false" | "no" | "off" => Ok(false),
    _ => Err(ConfigError::InvalidValue {
      var,
      value: value.to_string(),
      expected: "a boolean",
    }),
  }
}

/// Explicit options for one run. Unset fields fall back to [`EngineConfig`], then defaults.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
  pub max_concurrency: Option<usize>,
  pub dry_run: Option<bool>,
  pub ignore_dependency_errors: Option<bool>,
  /// Root-relative globs selecting target units. Empty means every unit.
  pub include: Vec<String>,
  /// Root-relative globs removing units from the target set.
  pub exclude: Vec<String>,
  pub per_unit_timeout: Option<Duration>,
  /// Extra environment passed to every unit.
  pub environment: BTreeMap<String, String>,
  pub non_interactive: bool,
}

/// Fully resolved run settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSettings {
  pub max_concurrency: usize,
  pub dry_run: bool,
  pub ignore_dependency_errors: bool,
  pub include: Vec<String>,
  pub exclude: Vec<String>,
  pub per_unit_timeout: Option<Duration>,
  pub environment: BTreeMap<String, String>,
  pub non_interactive: bool,
}

impl RunOptions {
  pub fn resolve(&self, config: &EngineConfig) -> Result<RunSettings, ConfigError> {
    let max_concurrency = self
      .max_concurrency
      .or(config.parallelism)
      .unwrap_or_else(default_parallelism);
    if max_concurrency == 0 {
      return Err(ConfigError::ZeroConcurrency);
    }

    Ok(RunSettings {
      max_concurrency,
      dry_run: self.dry_run.or(config.dry_run).unwrap_or(false),
      ignore_dependency_errors: self
        .ignore_dependency_errors
        .or(config.ignore_dependency_errors)
        .unwrap_or(false),
      include: self.include.clone(),
      exclude: self.exclude.clone(),
      per_unit_timeout: self.per_unit_timeout,
      environment: self.environment.clone(),
      non_interactive: self.non_interactive,
    })
  }
}

fn default_parallelism() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}
