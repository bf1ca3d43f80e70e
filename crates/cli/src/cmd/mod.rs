mod graph;
mod info;
mod list;
mod run;

use std::path::PathBuf;

use anyhow::{Context, Result};

pub use graph::cmd_graph;
pub use info::cmd_info;
pub use list::cmd_list;
pub use run::{RunArgs, cmd_run};

/// The given directory, or the current one.
fn working_dir(dir: Option<PathBuf>) -> Result<PathBuf> {
  match dir {
    Some(dir) => Ok(dir),
    None => std::env::current_dir().context("Failed to determine current directory"),
  }
}
