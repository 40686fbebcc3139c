//! Control socket server.

use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use veil_common::error::{Result, VeilError};

use crate::daemon::Daemon;

const ACCEPT_POLL: Duration = Duration::from_millis(100);

/// Accepts control connections and serves each on its own thread.
#[derive(Debug)]
pub struct Server {
    listener: UnixListener,
    path: PathBuf,
    daemon: Arc<Daemon>,
}

fn io_error(path: &Path, e: std::io::Error) -> VeilError {
    VeilError::Io {
        path: path.to_path_buf(),
        source: e,
    }
}

impl Server {
    /// Binds the control socket, replacing a stale one left behind.
    ///
    /// # Errors
    ///
    /// Returns [`VeilError::Io`] if the socket cannot be created.
    pub fn bind(path: &Path, daemon: Arc<Daemon>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }
        match std::fs::remove_file(path) {
            Ok(()) => tracing::debug!(path = %path.display(), "removed stale socket"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(io_error(path, e)),
        }
        let listener = UnixListener::bind(path).map_err(|e| io_error(path, e))?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| io_error(path, e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| io_error(path, e))?;
        tracing::info!(path = %path.display(), "control socket listening");
        Ok(Self {
            listener,
            path: path.to_path_buf(),
            daemon,
        })
    }

    /// Serves connections until `running` is cleared.
    ///
    /// # Errors
    ///
    /// Returns [`VeilError::Io`] if accepting fails for a reason other than
    /// no pending connection.
    pub fn run(&self, running: &AtomicBool) -> Result<()> {
        while running.load(Ordering::SeqCst) {
            match self.listener.accept() {
                Ok((stream, _)) => self.dispatch(stream),
                Err(e) if e.kind() == ErrorKind::WouldBlock => std::thread::sleep(ACCEPT_POLL),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => return Err(io_error(&self.path, e)),
            }
        }
        tracing::info!("control socket closed");
        Ok(())
    }

    fn dispatch(&self, mut stream: UnixStream) {
        let daemon = Arc::clone(&self.daemon);
        let spawned = std::thread::Builder::new()
            .name("veil-client".to_owned())
            .spawn(move || {
                if let Err(e) = stream.set_nonblocking(false) {
                    tracing::warn!(error = %e, "cannot configure client stream");
                    return;
                }
                if let Err(e) = daemon.serve(&mut stream) {
                    tracing::debug!(error = %e, "client request failed");
                }
            });
        if let Err(e) = spawned {
            tracing::warn!(error = %e, "cannot spawn client thread");
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}
