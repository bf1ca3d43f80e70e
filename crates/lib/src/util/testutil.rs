//! Test utilities for stackrun-lib.
//!
//! Helpers for laying out unit/stack fixture trees on disk and for writing a fake IaC binary.

use std::path::{Path, PathBuf};

use crate::consts::{STACK_MARKER, UNIT_MARKER};

/// Create `root/rel` and write a `unit.toml` with `content` into it.
pub fn write_unit(root: &Path, rel: &str, content: &str) -> PathBuf {
  write_marker(root, rel, UNIT_MARKER, content)
}

/// Create `root/rel` and write a `stack.toml` with `content` into it.
pub fn write_stack(root: &Path, rel: &str, content: &str) -> PathBuf {
  write_marker(root, rel, STACK_MARKER, content)
}

fn write_marker(root: &Path, rel: &str, marker: &str, content: &str) -> PathBuf {
  let dir = if rel == "." { root.to_path_buf() } else { root.join(rel) };
  std::fs::create_dir_all(&dir).unwrap();
  std::fs::write(dir.join(marker), content).unwrap();
  dir
}

/// Canonical path of a temp directory, so expectations match discovered paths.
pub fn canonical(path: &Path) -> PathBuf {
  dunce::canonicalize(path).unwrap()
}

/// Write an executable shell script standing in for the IaC binary.
///
/// Every invocation appends `<cwd> <args...>` to `calls.log` next to the script, then runs `body`.
#[cfg(unix)]
pub fn fake_tf(dir: &Path, body: &str) -> PathBuf {
  use std::os::unix::fs::PermissionsExt;

  let script = dir.join("fake-tf");
  let log = dir.join("calls.log");
  let content = format!(
    "#!/bin/sh\necho \"$(pwd) $*\" >> \"{}\"\n{}\n",
    log.display(),
    body
  );
  std::fs::write(&script, content).unwrap();
  std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
  script
}

/// Lines recorded by [`fake_tf`].
#[cfg(unix)]
pub fn fake_tf_calls(dir: &Path) -> Vec<String> {
  std::fs::read_to_string(dir.join("calls.log"))
    .unwrap_or_default()
    .lines()
    .map(str::to_string)
    .collect()
}
