//! Scoped cleanup guard.

/// Guard that runs a cleanup closure when dropped.
///
/// Workspaces use it to remove the temporary files they create for raw
/// array inputs, whether the tool call succeeds or fails.
pub struct CleanupGuard {
    cleanup: Option<Box<dyn FnOnce() + Send>>,
}

impl CleanupGuard {
    /// Creates a new cleanup guard.
    pub fn new<F>(cleanup: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cleanup: Some(Box::new(cleanup)),
        }
    }

    /// Creates a guard that removes a file when dropped.
    ///
    /// A file that is already gone is not an error.
    pub fn remove_file(path: impl Into<std::path::PathBuf>) -> Self {
        let path = path.into();
        Self::new(move || {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove temporary file");
                }
            }
        })
    }

    /// Disarms the guard, preventing cleanup from running.
    pub fn disarm(&mut self) {
        self.cleanup = None;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

impl std::fmt::Debug for CleanupGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupGuard")
            .field("armed", &self.cleanup.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_cleanup_guard_runs_on_drop() {
        let cleaned = Arc::new(AtomicBool::new(false));
        let cleaned_clone = cleaned.clone();

        {
            let _guard = CleanupGuard::new(move || {
                cleaned_clone.store(true, Ordering::SeqCst);
            });
        }

        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[test]
    fn test_cleanup_guard_disarm() {
        let cleaned = Arc::new(AtomicBool::new(false));
        let cleaned_clone = cleaned.clone();

        {
            let mut guard = CleanupGuard::new(move || {
                cleaned_clone.store(true, Ordering::SeqCst);
            });
            guard.disarm();
        }

        assert!(!cleaned.load(Ordering::SeqCst));
    }

    #[test]
    fn test_remove_file_guard() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scratch.txt");
        std::fs::write(&path, "x").unwrap();

        drop(CleanupGuard::remove_file(&path));
        assert!(!path.exists());

        // Removing again is silent.
        drop(CleanupGuard::remove_file(&path));
    }
}
