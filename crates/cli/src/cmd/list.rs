//! List command implementation.
//!
//! Shows every discovered unit and stack with its parent stack and declared dependencies.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;

use stackrun_lib::Kind;
use stackrun_lib::discovery::{Discoverer, DiscoveryOptions};
use stackrun_lib::util::path::relative_slash;

use crate::output::{OutputFormat, print_info, print_json, print_stat, symbols};

#[derive(Debug, Serialize)]
struct ListEntry {
  path: String,
  kind: Kind,
  parent: Option<String>,
  dependencies: Vec<String>,
}

pub fn cmd_list(working_dir: Option<PathBuf>, format: OutputFormat) -> Result<()> {
  let dir = super::working_dir(working_dir)?;
  let components = Discoverer::new(DiscoveryOptions::default())
    .discover(&dir)
    .with_context(|| format!("Failed to discover units in {}", dir.display()))?;
  let root = dunce::canonicalize(&dir).unwrap_or(dir);

  let entries: Vec<ListEntry> = components
    .iter()
    .map(|(_, component)| ListEntry {
      path: relative_slash(&root, component.path()),
      kind: component.kind(),
      parent: component
        .parent()
        .and_then(|id| components.get(id))
        .map(|p| relative_slash(&root, p.path())),
      dependencies: component
        .dependencies()
        .iter()
        .map(|d| relative_slash(&root, d))
        .collect(),
    })
    .collect();

  if format.is_json() {
    return print_json(&entries);
  }

  if entries.is_empty() {
    print_info(&format!("No units found under {}", root.display()));
    return Ok(());
  }

  for entry in &entries {
    println!("{} {:<5} {}", symbols::INFO, entry.kind, entry.path);
    if !entry.dependencies.is_empty() {
      print_stat(symbols::ARROW, &entry.dependencies.join(", "));
    }
  }
  Ok(())
}
