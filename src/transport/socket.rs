//! Unix domain socket links.
//!
//! Lets a ring of nodes run as ordinary host processes: every node listens
//! on one socket per plane for its upstream neighbour and connects to the
//! downstream neighbour's sockets.
//!
//! ```text
//!  node 10                       node 1
//!  ┌───────────┐ control.sock  ┌───────────┐
//!  │ downstream├──────────────►│ listener  │
//!  │ downstream├──────────────►│ listener  │
//!  └───────────┘  data.sock    └───────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use blueteeth::transport::{link_path, LinkListener, Plane};
//!
//! let dir = std::env::temp_dir();
//! let listener = LinkListener::bind(link_path(&dir, 1, Plane::Control)).await?;
//! let upstream = listener.accept().await?;
//! ```

use std::path::{Path, PathBuf};

use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};

use super::Plane;
use crate::error::Result;
use crate::protocol::NodeAddress;

/// Socket path of `node`'s listener for `plane` inside `dir`.
///
/// Format: `{dir}/blueteeth-{node}-{plane}.sock`
pub fn link_path(dir: &Path, node: NodeAddress, plane: Plane) -> PathBuf {
    dir.join(format!("blueteeth-{}-{}.sock", node, plane.name()))
}

/// Listener accepting the upstream neighbour on one plane.
///
/// The socket file is removed when the listener is dropped.
pub struct LinkListener {
    listener: UnixListener,
    path: PathBuf,
}

impl LinkListener {
    /// Bind to a socket path, replacing a stale socket file.
    pub async fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }

        let listener = UnixListener::bind(&path)?;
        tracing::debug!("Listening for upstream link on {}", path.display());

        Ok(Self { listener, path })
    }

    /// Accept the upstream neighbour.
    pub async fn accept(&self) -> Result<LinkStream> {
        let (stream, _addr) = self.listener.accept().await?;
        tracing::debug!("Upstream link connected on {}", self.path.display());
        Ok(LinkStream { stream })
    }

    /// Socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LinkListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Connect to the downstream neighbour's listener.
pub async fn connect_link(path: impl AsRef<Path>) -> Result<LinkStream> {
    let stream = UnixStream::connect(path.as_ref()).await?;
    Ok(LinkStream { stream })
}

/// A connected link.
pub struct LinkStream {
    stream: UnixStream,
}

impl LinkStream {
    /// Split into read and write halves.
    pub fn into_split(self) -> (OwnedReadHalf, OwnedWriteHalf) {
        self.stream.into_split()
    }

    /// Get a reference to the underlying stream.
    pub fn inner(&self) -> &UnixStream {
        &self.stream
    }
}
