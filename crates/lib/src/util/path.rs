//! Path helpers shared by discovery and dependency resolution.

use std::path::{Component, Path, PathBuf};

/// Lexically normalize a path, folding `.` and `..` without touching the filesystem.
///
/// A `..` that would climb above the root is dropped.
pub fn normalize(path: &Path) -> PathBuf {
  let mut out = PathBuf::new();
  for component in path.components() {
    match component {
      Component::CurDir => {}
      Component::ParentDir => {
        let last_is_parent = matches!(out.components().next_back(), Some(Component::ParentDir));
        // Relative paths keep leading `..` segments.
        if (last_is_parent || !out.pop()) && !path.is_absolute() {
          out.push("..");
        }
      }
      other => out.push(other.as_os_str()),
    }
  }
  out
}

/// Resolve `target` relative to `base`, canonicalizing when it exists on disk.
pub fn resolve_relative(base: &Path, target: &Path) -> PathBuf {
  let joined = if target.is_absolute() {
    target.to_path_buf()
  } else {
    base.join(target)
  };
  dunce::canonicalize(&joined).unwrap_or_else(|_| normalize(&joined))
}

/// Render `path` relative to `root` with `/` separators, `.` for the root itself.
pub fn relative_slash(root: &Path, path: &Path) -> String {
  match path.strip_prefix(root) {
    Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
    Ok(rel) => rel
      .components()
      .map(|c| c.as_os_str().to_string_lossy())
      .collect::<Vec<_>>()
      .join("/"),
    Err(_) => path.to_string_lossy().replace('\\', "/"),
  }
}
