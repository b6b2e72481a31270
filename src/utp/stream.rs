//! Stream handle for one UTP connection

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Application handle to a live UTP connection
///
/// Dropping the handle closes both directions; `close` shuts down the write
/// side only, leaving reads open until the remote finishes.
pub struct UtpStream {
    pub(super) read_rx: mpsc::Receiver<Bytes>,
    pub(super) write_tx: Option<mpsc::Sender<Bytes>>,
    pub(super) remote: SocketAddr,
}

impl UtpStream {
    /// Receive the next chunk of bytes, in order. `None` means the remote
    /// closed or the connection died.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.read_rx.recv().await
    }

    /// Queue bytes for ordered delivery. Blocks while the send window and
    /// the write queue are full, which is the backpressure path.
    pub async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        let tx = self.write_tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(data).await.map_err(|_| TransportError::Closed)
    }

    /// Close the write side; a FIN goes out once queued data drains
    pub fn close(&mut self) {
        self.write_tx = None;
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
}

impl std::fmt::Debug for UtpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UtpStream")
            .field("remote", &self.remote)
            .field("write_open", &self.write_tx.is_some())
            .finish()
    }
}
