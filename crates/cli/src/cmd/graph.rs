//! Graph command implementation.
//!
//! Prints the validated unit dependency graph as Graphviz DOT, edges pointing at dependencies.

use std::path::PathBuf;

use anyhow::{Context, Result};

use stackrun_lib::discovery::{Discoverer, DiscoveryOptions};
use stackrun_lib::graph::GraphBuilder;

pub fn cmd_graph(working_dir: Option<PathBuf>) -> Result<()> {
  let dir = super::working_dir(working_dir)?;
  let components = Discoverer::new(DiscoveryOptions::default())
    .discover(&dir)
    .with_context(|| format!("Failed to discover units in {}", dir.display()))?;
  let graph = GraphBuilder::new()
    .build(&components)
    .context("Invalid dependency graph")?;

  let root = dunce::canonicalize(&dir).unwrap_or(dir);
  print!("{}", graph.to_dot(&components, &root));
  Ok(())
}
