//! Single instance lock using Unix socket.
//!
//! Two bridge processes sharing a storage profile would fight over the
//! Matter port and the endpoint-number persistence. The lock is a Unix
//! socket which the OS releases when the process dies, avoiding stale lock
//! files.

use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstanceLockError {
    /// Another bridge with the same profile is already running.
    #[error("another matterbridge instance is already running")]
    AlreadyRunning,

    /// I/O error during lock acquisition.
    #[error("failed to acquire instance lock: {0}")]
    Io(#[from] io::Error),
}

/// Held as long as the struct exists; dropped on normal exit.
pub struct InstanceLock {
    _listener: UnixListener,
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire the lock for the given profile (None = default profile).
    pub fn acquire(profile: Option<&str>) -> Result<Self, InstanceLockError> {
        let path = Self::socket_path(profile);

        // A leftover socket from a SIGKILL'd process is stale when nothing
        // answers on it.
        if path.exists() {
            match UnixStream::connect(&path) {
                Ok(_) => return Err(InstanceLockError::AlreadyRunning),
                Err(_) => {
                    let _ = std::fs::remove_file(&path);
                }
            }
        }

        match UnixListener::bind(&path) {
            Ok(listener) => Ok(Self {
                _listener: listener,
                path,
            }),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                // Another instance bound between our check and bind
                Err(InstanceLockError::AlreadyRunning)
            }
            Err(e) => Err(InstanceLockError::Io(e)),
        }
    }

    /// Socket path for a profile, under `XDG_RUNTIME_DIR` when available.
    pub fn socket_path(profile: Option<&str>) -> PathBuf {
        let name = match profile {
            Some(profile) => format!("matterbridge.{profile}.sock"),
            None => "matterbridge.sock".to_string(),
        };
        std::env::var("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
            .join(name)
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
