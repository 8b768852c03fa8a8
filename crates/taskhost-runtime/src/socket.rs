//! Per-invocation Unix sockets inside one scratch directory.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use tempfile::TempDir;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Hands out uniquely named, already bound sockets.
///
/// The scratch directory is removed when the lifetime token is cancelled or
/// the allocator is dropped, taking every socket in it along.
pub struct SocketAllocator {
    root: PathBuf,
    dir: Mutex<Option<TempDir>>,
    next: AtomicU64,
    cancel: CancellationToken,
}

impl SocketAllocator {
    /// Create the scratch directory and tie its removal to `cancel`.
    pub fn new(cancel: CancellationToken) -> io::Result<Arc<Self>> {
        let dir = tempfile::Builder::new().prefix("taskhost-").tempdir()?;
        let root = dir.path().to_path_buf();
        info!(dir = %root.display(), "Socket directory created");

        let allocator = Arc::new(Self {
            root,
            dir: Mutex::new(Some(dir)),
            next: AtomicU64::new(1),
            cancel: cancel.clone(),
        });

        let weak: Weak<Self> = Arc::downgrade(&allocator);
        tokio::spawn(async move {
            cancel.cancelled().await;
            if let Some(allocator) = weak.upgrade() {
                allocator.cleanup();
            }
        });

        Ok(allocator)
    }

    pub fn dir(&self) -> &Path {
        &self.root
    }

    /// Bind a fresh socket.
    pub fn new_socket(&self) -> io::Result<Socket> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "socket allocator has shut down",
            ));
        }

        let n = self.next.fetch_add(1, Ordering::Relaxed);
        let path = self.root.join(format!("worker-{n}.sock"));
        let listener = UnixListener::bind(&path)?;
        debug!(path = %path.display(), "Socket bound");

        Ok(Socket { path, listener })
    }

    fn cleanup(&self) {
        let dir = self
            .dir
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(dir) = dir {
            match dir.close() {
                Ok(()) => info!(dir = %self.root.display(), "Socket directory removed"),
                Err(e) => warn!(dir = %self.root.display(), error = %e, "Failed to remove socket directory"),
            }
        }
    }
}

impl Drop for SocketAllocator {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// A bound listening socket. The socket file is removed on drop.
pub struct Socket {
    path: PathBuf,
    listener: UnixListener,
}

impl Socket {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn accept(&self) -> io::Result<UnixStream> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(stream)
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                debug!(path = %self.path.display(), error = %e, "Failed to remove socket");
            }
        }
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket").field("path", &self.path).finish()
    }
}
