//! Keyed async locks serializing access to shared on-disk paths.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

/// One async mutex per distinct path. Clones share the same lock table.
#[derive(Debug, Clone, Default)]
pub struct PathLocks {
  inner: Arc<Mutex<HashMap<PathBuf, Arc<AsyncMutex<()>>>>>,
}

impl PathLocks {
  pub fn new() -> Self {
    Self::default()
  }

  /// Wait for exclusive access to `path`. Released when the guard drops.
  pub async fn lock(&self, path: &Path) -> OwnedMutexGuard<()> {
    let mutex = {
      let mut table = self.inner.lock().unwrap_or_else(|e| e.into_inner());
      table.entry(path.to_path_buf()).or_default().clone()
    };
    debug!(path = %path.display(), "waiting for path lock");
    mutex.lock_owned().await
  }
}
