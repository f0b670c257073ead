use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Tracks paths that need cleanup on interruption
#[derive(Default)]
pub struct CleanupContext {
    #[cfg(test)]
    pub paths: Vec<PathBuf>,
    #[cfg(not(test))]
    paths: Vec<PathBuf>,
}

impl CleanupContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a path to be cleaned up on interruption
    pub fn add(&mut self, path: PathBuf) {
        self.paths.push(path);
    }

    /// Remove a path from cleanup list (e.g., when it has already been removed)
    pub fn remove(&mut self, path: &Path) {
        self.paths.retain(|p| p != path);
    }

    /// Clean up all registered paths
    pub fn cleanup(&self) {
        for path in &self.paths {
            debug!("Cleaning up: {:?}", path);
            remove_path(path);
        }
    }
}

/// Type alias for shared cleanup context
pub type SharedCleanupContext = Arc<Mutex<CleanupContext>>;

/// Create a new shared cleanup context
pub fn new_shared() -> SharedCleanupContext {
    Arc::new(Mutex::new(CleanupContext::new()))
}

/// Lock the shared context, recovering the list if a holder panicked.
pub fn lock(ctx: &SharedCleanupContext) -> MutexGuard<'_, CleanupContext> {
    ctx.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn remove_path(path: &Path) {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else if path.exists() {
        std::fs::remove_file(path)
    } else {
        Ok(())
    };
    if let Err(e) = result {
        warn!("Failed to remove temporary path {:?}: {}", path, e);
    }
}

/// Temporary files and directories owned by one operation.
///
/// Every tracked path is registered with the shared context (so Ctrl-C can
/// remove it) and deleted when the guard drops, whether the operation
/// succeeded, failed or was cancelled.
pub struct TempArtifacts {
    ctx: SharedCleanupContext,
    paths: Vec<PathBuf>,
}

impl TempArtifacts {
    pub fn new(ctx: SharedCleanupContext) -> Self {
        Self {
            ctx,
            paths: Vec::new(),
        }
    }

    /// Register `path` and hand it back for use.
    pub fn track(&mut self, path: PathBuf) -> PathBuf {
        lock(&self.ctx).add(path.clone());
        self.paths.push(path.clone());
        path
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl Drop for TempArtifacts {
    fn drop(&mut self) {
        let mut ctx = lock(&self.ctx);
        for path in self.paths.iter().rev() {
            debug!("Removing temporary artifact {:?}", path);
            remove_path(path);
            ctx.remove(path);
        }
    }
}
