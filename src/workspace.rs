//! Per-archive working directories and their cleanup on interrupt.

use std::collections::HashSet;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tempfile::TempDir;
use tracing::{debug, warn};

/// Tracks every working directory that is currently alive so that a signal
/// handler can remove them before the process exits.
#[derive(Clone, Default)]
pub struct WorkspaceRegistry {
    live: Arc<Mutex<HashSet<PathBuf>>>,
}

impl WorkspaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Creates a fresh working directory below `root` and registers it.
    pub fn create(&self, root: &Path, prefix: &str) -> io::Result<WorkingDir> {
        let dir = tempfile::Builder::new().prefix(prefix).tempdir_in(root)?;
        self.lock().insert(dir.path().to_path_buf());
        debug!("created working directory {}", dir.path().display());
        Ok(WorkingDir {
            dir: Some(dir),
            registry: self.clone(),
        })
    }

    /// Paths of the working directories that have not been released yet.
    #[cfg(test)]
    pub fn live(&self) -> Vec<PathBuf> {
        self.lock().iter().cloned().collect()
    }

    /// Removes every live working directory, returning how many were removed.
    pub fn purge(&self) -> usize {
        let paths: Vec<PathBuf> = self.lock().drain().collect();
        let mut removed = 0;
        for path in paths {
            match std::fs::remove_dir_all(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!("failed to remove {}: {}", path.display(), e),
            }
        }
        removed
    }

    fn release(&self, path: &Path) {
        self.lock().remove(path);
    }
}

/// Scoped working directory, removed on drop along every exit path.
pub struct WorkingDir {
    dir: Option<TempDir>,
    registry: WorkspaceRegistry,
}

impl WorkingDir {
    pub fn path(&self) -> &Path {
        match &self.dir {
            Some(dir) => dir.path(),
            None => Path::new(""),
        }
    }
}

impl Drop for WorkingDir {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                warn!("failed to remove working directory {}: {}", path.display(), e);
            }
            self.registry.release(&path);
        }
    }
}

/// Exit status after an interrupt.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// Spawns a task that purges the registry on SIGINT/SIGTERM and exits with status 130.
pub fn install_signal_cleanup(registry: WorkspaceRegistry) {
    tokio::spawn(async move {
        let removed = cleanup_on(wait_for_shutdown(), &registry).await;
        eprintln!(
            "Interrupted: removed {} working director{}",
            removed,
            if removed == 1 { "y" } else { "ies" }
        );
        std::process::exit(INTERRUPTED_EXIT_CODE);
    });
}

/// Waits for `shutdown`, then removes every live working directory.
pub async fn cleanup_on<F>(shutdown: F, registry: &WorkspaceRegistry) -> usize
where
    F: Future<Output = ()>,
{
    shutdown.await;
    warn!("shutdown requested, removing working directories");
    registry.purge()
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!("cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn working_dir_is_removed_and_released_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let registry = WorkspaceRegistry::new();

        let work = registry.create(root.path(), "unit_").unwrap();
        let path = work.path().to_path_buf();
        std::fs::write(path.join("IM1"), b"x").unwrap();
        assert!(path.is_dir());
        assert_eq!(registry.live(), vec![path.clone()]);

        drop(work);
        assert!(!path.exists());
        assert!(registry.live().is_empty());
    }

    #[test]
    fn purge_removes_live_directories() {
        let root = tempfile::tempdir().unwrap();
        let registry = WorkspaceRegistry::new();

        let a = registry.create(root.path(), "a_").unwrap();
        let b = registry.create(root.path(), "b_").unwrap();
        std::fs::create_dir(a.path().join("nested")).unwrap();

        assert_eq!(registry.purge(), 2);
        assert!(!a.path().exists());
        assert!(!b.path().exists());
        assert!(registry.live().is_empty());

        // dropping after a purge must not panic
        drop(a);
        drop(b);
    }

    #[test]
    fn create_fails_for_missing_root() {
        let registry = WorkspaceRegistry::new();
        assert!(registry
            .create(Path::new("/definitely/not/a/dir"), "x_")
            .is_err());
    }

    #[tokio::test]
    async fn shutdown_signal_purges_live_directories() {
        let root = tempfile::tempdir().unwrap();
        let registry = WorkspaceRegistry::new();
        let work = registry.create(root.path(), "unit_").unwrap();
        std::fs::write(work.path().join("IM1"), b"x").unwrap();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let handler = {
            let registry = registry.clone();
            tokio::spawn(async move {
                cleanup_on(
                    async move {
                        let _ = rx.await;
                    },
                    &registry,
                )
                .await
            })
        };

        tokio::task::yield_now().await;
        assert!(work.path().exists());

        tx.send(()).unwrap();
        assert_eq!(handler.await.unwrap(), 1);
        assert!(!work.path().exists());
        assert!(registry.live().is_empty());
        assert_eq!(INTERRUPTED_EXIT_CODE, 130);
    }
}
