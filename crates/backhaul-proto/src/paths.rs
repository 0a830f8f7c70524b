//! Run-directory path conventions
//!
//! The gateway and the tunnel-side tooling rendezvous through two kinds of
//! files in a shared run directory: a control socket per logical service,
//! and an advisory lock file per backend process. Both sides must derive
//! the same paths, so the naming lives here.

use std::path::{Path, PathBuf};

/// Default run directory when none is configured.
pub const DEFAULT_RUN_DIR: &str = "/var/run/backhaul";

/// Control socket for a logical service: `<run-dir>/<service>.sock`.
pub fn control_socket_path(run_dir: &Path, service: &str) -> PathBuf {
    run_dir.join(format!("{}.sock", service))
}

/// Liveness lock file for a backend process: `<run-dir>/<pid>`.
///
/// The backend holds an exclusive advisory lock on this file for its whole
/// lifetime; the OS drops the lock when the process exits.
pub fn liveness_lock_path(run_dir: &Path, pid: u32) -> PathBuf {
    run_dir.join(pid.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_path_uses_service_name() {
        let path = control_socket_path(Path::new("/var/run/backhaul"), "web");
        assert_eq!(path, PathBuf::from("/var/run/backhaul/web.sock"));
    }

    #[test]
    fn lock_path_is_bare_pid() {
        let path = liveness_lock_path(Path::new("/var/run/backhaul"), 31337);
        assert_eq!(path, PathBuf::from("/var/run/backhaul/31337"));
    }
}
