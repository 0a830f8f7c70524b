//! Backend liveness detection
//!
//! There is no heartbeat protocol. Before announcing itself, a backend takes
//! an exclusive advisory lock on `<run-dir>/<pid>` and holds it for as long
//! as the process lives; the kernel releases the lock when the process
//! exits, however it exits. Blocking on our own exclusive acquisition of the
//! same lock is therefore a death signal: the call returns when, and only
//! when, the backend is gone.
//!
//! The signal sits behind [`LivenessMonitor`] so the registry and the proxy
//! never learn how death is detected.

use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

/// Liveness wait errors
#[derive(Debug, Error)]
pub enum LivenessError {
    #[error("failed to open liveness lock file {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to acquire liveness lock on {path}: {source}")]
    Lock {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("liveness wait task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Source of the per-backend death signal
#[async_trait]
pub trait LivenessMonitor: Send + Sync {
    /// Block until the backend owning `pid` is dead.
    ///
    /// An error means the wait could not be performed at all; the caller
    /// must treat the backend as untrackable and take it out of rotation.
    async fn wait_released(&self, pid: u32) -> Result<(), LivenessError>;
}

/// Advisory-lock liveness monitor over the shared run directory
#[cfg(unix)]
#[derive(Debug, Clone)]
pub struct LockFileMonitor {
    run_dir: PathBuf,
}

#[cfg(unix)]
impl LockFileMonitor {
    pub fn new(run_dir: impl Into<PathBuf>) -> Self {
        Self {
            run_dir: run_dir.into(),
        }
    }
}

#[cfg(unix)]
#[async_trait]
impl LivenessMonitor for LockFileMonitor {
    async fn wait_released(&self, pid: u32) -> Result<(), LivenessError> {
        let path = backhaul_proto::liveness_lock_path(&self.run_dir, pid);
        let file = std::fs::OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(|source| LivenessError::Open {
                path: path.clone(),
                source,
            })?;

        // flock parks the calling thread until the holder exits, so the wait
        // lives on the blocking pool.
        tokio::task::spawn_blocking(move || {
            use std::os::unix::io::AsRawFd;

            let fd = file.as_raw_fd();
            loop {
                let rc = unsafe { libc::flock(fd, libc::LOCK_EX) };
                if rc == 0 {
                    // Acquisition means the holder is gone. The lock itself
                    // is not wanted; let it go immediately.
                    unsafe { libc::flock(fd, libc::LOCK_UN) };
                    return Ok(());
                }
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EINTR) {
                    return Err(LivenessError::Lock {
                        path: path.clone(),
                        source: err,
                    });
                }
            }
        })
        .await?
    }
}
