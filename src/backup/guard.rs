// dumpvault/src/backup/guard.rs
//! Tracks in-progress artifacts so a termination signal can remove them.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backup::metadata::manifest_tmp_path;

/// How long the listener waits for cooperative shutdown before forcing the exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);
pub const SIGNAL_EXIT_CODE: i32 = 130;

/// Shared list of files that must not survive an abrupt termination.
#[derive(Debug, Clone, Default)]
pub struct CleanupRegistry {
    paths: Arc<Mutex<Vec<PathBuf>>>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<PathBuf>> {
        self.paths.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `path` until the returned guard is dropped.
    pub fn register(&self, path: &Path) -> ResourceGuard {
        self.lock().push(path.to_path_buf());
        ResourceGuard { registry: self.clone(), path: path.to_path_buf() }
    }

    pub fn registered(&self) -> Vec<PathBuf> {
        self.lock().clone()
    }

    /// Removes every registered artifact and its pending manifest temp file.
    /// Synchronous and local-only; returns how many files were removed.
    pub fn critical_cleanup(&self) -> usize {
        let paths = std::mem::take(&mut *self.lock());
        let mut removed = 0;
        for path in paths {
            for candidate in [path.clone(), manifest_tmp_path(&path)] {
                match fs::remove_file(&candidate) {
                    Ok(()) => {
                        info!("Removed partial file: {}", candidate.display());
                        removed += 1;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => warn!("Failed to remove partial file {}: {}", candidate.display(), e),
                }
            }
        }
        removed
    }
}

/// Keeps one path registered for the lifetime of one dump attempt.
#[derive(Debug)]
pub struct ResourceGuard {
    registry: CleanupRegistry,
    path: PathBuf,
}

impl ResourceGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        let mut paths = self.registry.lock();
        if let Some(pos) = paths.iter().position(|p| p == &self.path) {
            paths.remove(pos);
        }
    }
}

async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Waits for SIGINT/SIGTERM, cancels `cancel`, and runs the critical cleanup.
///
/// The run is then given a grace period to unwind on its own; a second signal or an
/// expired grace period exits the process with status 130.
pub fn spawn_signal_listener(cancel: CancellationToken, registry: CleanupRegistry) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = wait_for_termination() => {}
            _ = cancel.cancelled() => return,
        }

        warn!("Termination signal received, cancelling backup");
        cancel.cancel();
        let removed = registry.critical_cleanup();
        if removed > 0 {
            info!("Critical cleanup removed {} file(s)", removed);
        }

        tokio::select! {
            _ = wait_for_termination() => warn!("Second signal received, exiting immediately"),
            _ = tokio::time::sleep(SHUTDOWN_GRACE) => warn!("Backup did not stop within {:?}, exiting", SHUTDOWN_GRACE),
        }
        registry.critical_cleanup();
        std::process::exit(SIGNAL_EXIT_CODE);
    })
}
