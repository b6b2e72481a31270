//! UTP endpoint over one shared UDP socket
//!
//! The daemon binds a single UDP socket for all peer traffic. A dispatcher
//! task reads datagrams and routes UTP packets to per-connection tasks by
//! `(remote, connection_id)`; inbound SYNs become accepted streams. The
//! same socket sends raw datagrams for hole punching and for framed
//! tracker `AddressResponse` messages, so NAT mappings stay consistent
//! across all of them.

pub mod connection;
pub mod packet;
pub mod stream;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};

use crate::error::TransportError;

use connection::{ConnTable, Connection, ConnectionParams, Role};
use packet::{Packet, PacketType};
pub use stream::UtpStream;

/// Bound on a connect handshake, retransmissions included
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(6);

/// Queue depths for per-connection channels
const PACKET_QUEUE: usize = 256;
const READ_QUEUE: usize = 64;
const WRITE_QUEUE: usize = 64;

/// Shared UTP endpoint
pub struct UtpEndpoint {
    socket: Arc<UdpSocket>,
    table: ConnTable,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<UtpStream>>,
    local_addr: SocketAddr,
    epoch: Instant,
}

impl UtpEndpoint {
    /// Bind the shared socket and start the dispatcher
    pub async fn bind(addr: SocketAddr) -> Result<Arc<Self>, TransportError> {
        let socket = bind_udp(addr).map_err(|e| TransportError::BindFailed {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;
        let socket = Arc::new(socket);
        let local_addr = socket.local_addr().map_err(TransportError::Io)?;

        let table: ConnTable = Arc::new(Mutex::new(HashMap::new()));
        let (accept_tx, accept_rx) = mpsc::channel(16);

        let endpoint = Arc::new(UtpEndpoint {
            socket: socket.clone(),
            table: table.clone(),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            local_addr,
            epoch: Instant::now(),
        });

        let dispatcher = endpoint.clone();
        tokio::spawn(async move {
            dispatcher.dispatch(accept_tx).await;
        });

        tracing::info!(target: "utp", "endpoint bound on {}", local_addr);
        Ok(endpoint)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Send a raw datagram on the shared socket (hole punch probes,
    /// tracker address responses)
    pub async fn send_raw(&self, addr: SocketAddr, data: &[u8]) -> Result<(), TransportError> {
        self.socket
            .send_to(data, addr)
            .await
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed {
                reason: e.to_string(),
            })
    }

    /// Open an outbound connection
    pub async fn connect(self: &Arc<Self>, remote: SocketAddr) -> Result<UtpStream, TransportError> {
        let recv_id = self.alloc_id(remote);
        let send_id = recv_id.wrapping_add(1);

        let (packet_tx, packet_rx) = mpsc::channel(PACKET_QUEUE);
        let (read_tx, read_rx) = mpsc::channel(READ_QUEUE);
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE);
        let (established_tx, established_rx) = oneshot::channel();

        self.table
            .lock()
            .unwrap()
            .insert((remote, recv_id), packet_tx);

        let conn = Connection::new(ConnectionParams {
            socket: self.socket.clone(),
            remote,
            recv_id,
            send_id,
            role: Role::Initiator,
            epoch: self.epoch,
            table: self.table.clone(),
            packet_rx,
            write_rx,
            read_tx,
            established_tx: Some(established_tx),
            syn: None,
        });
        tokio::spawn(conn.run());

        match tokio::time::timeout(CONNECT_TIMEOUT, established_rx).await {
            Ok(Ok(Ok(()))) => Ok(UtpStream {
                read_rx,
                write_tx: Some(write_tx),
                remote,
            }),
            Ok(Ok(Err(e))) => Err(e),
            // Connection task died or the timer fired first
            _ => Err(TransportError::HandshakeTimeout {
                addr: remote.to_string(),
            }),
        }
    }

    /// Wait for the next inbound connection
    pub async fn accept(&self) -> Option<UtpStream> {
        self.accept_rx.lock().await.recv().await
    }

    /// Pick an unused receive id for a remote
    fn alloc_id(&self, remote: SocketAddr) -> u16 {
        let table = self.table.lock().unwrap();
        let mut rng = rand::thread_rng();
        loop {
            let id: u16 = rng.gen();
            if !table.contains_key(&(remote, id)) && !table.contains_key(&(remote, id.wrapping_add(1)))
            {
                return id;
            }
        }
    }

    /// Dispatcher: route datagrams to connections, accept SYNs
    async fn dispatch(self: Arc<Self>, accept_tx: mpsc::Sender<UtpStream>) {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(ok) => ok,
                Err(e) => {
                    tracing::warn!(target: "utp", "socket receive error: {}", e);
                    continue;
                }
            };

            let packet = match Packet::decode(&buf[..len]) {
                Ok(packet) => packet,
                Err(_) => {
                    // Hole-punch probes and stray datagrams land here
                    tracing::trace!(target: "utp", "non-UTP datagram from {}", from);
                    continue;
                }
            };

            if packet.ty == PacketType::Syn {
                self.handle_syn(packet, from, &accept_tx).await;
                continue;
            }

            let routed = {
                let table = self.table.lock().unwrap();
                table
                    .get(&(from, packet.connection_id))
                    .or_else(|| {
                        // Resets echo the id the remote saw, which is our
                        // send id on one side
                        if packet.ty == PacketType::Reset {
                            table
                                .get(&(from, packet.connection_id.wrapping_add(1)))
                                .or_else(|| {
                                    table.get(&(from, packet.connection_id.wrapping_sub(1)))
                                })
                        } else {
                            None
                        }
                    })
                    .cloned()
            };

            match routed {
                Some(tx) => {
                    let _ = tx.send(packet).await;
                }
                None if packet.ty != PacketType::Reset => {
                    // Tell the remote this connection is gone
                    let reset =
                        Packet::new(PacketType::Reset, packet.connection_id, 0, packet.seq_nr);
                    let _ = self.socket.send_to(&reset.encode(), from).await;
                }
                None => {}
            }
        }
    }

    async fn handle_syn(
        &self,
        syn: Packet,
        from: SocketAddr,
        accept_tx: &mpsc::Sender<UtpStream>,
    ) {
        // We receive on syn.id + 1 and send with syn.id
        let recv_id = syn.connection_id.wrapping_add(1);
        let send_id = syn.connection_id;

        let existing = {
            let table = self.table.lock().unwrap();
            if table.contains_key(&(from, recv_id)) {
                Some(table.get(&(from, recv_id)).cloned())
            } else {
                None
            }
        };
        if let Some(tx) = existing {
            // Retransmitted SYN: forward to the existing connection
            if let Some(tx) = tx {
                let _ = tx.send(syn).await;
            }
            return;
        }

        let (packet_tx, packet_rx) = mpsc::channel(PACKET_QUEUE);
        let (read_tx, read_rx) = mpsc::channel(READ_QUEUE);
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE);

        self.table
            .lock()
            .unwrap()
            .insert((from, recv_id), packet_tx);

        let conn = Connection::new(ConnectionParams {
            socket: self.socket.clone(),
            remote: from,
            recv_id,
            send_id,
            role: Role::Acceptor,
            epoch: self.epoch,
            table: self.table.clone(),
            packet_rx,
            write_rx,
            read_tx,
            established_tx: None,
            syn: Some(syn),
        });
        tokio::spawn(conn.run());

        let stream = UtpStream {
            read_rx,
            write_tx: Some(write_tx),
            remote: from,
        };
        if accept_tx.send(stream).await.is_err() {
            tracing::debug!(target: "utp", "accept queue closed, dropping connection from {}", from);
        }
    }
}

/// Bind the UDP socket with address reuse, so a restarting daemon can
/// reclaim its port while old sockets linger
fn bind_udp(addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    async fn pair() -> (Arc<UtpEndpoint>, Arc<UtpEndpoint>) {
        let a = UtpEndpoint::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let b = UtpEndpoint::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn test_connect_accept_exchange() {
        let (a, b) = pair().await;

        let b_addr = b.local_addr();
        let accept = tokio::spawn(async move { b.accept().await.unwrap() });

        let client = a.connect(b_addr).await.unwrap();
        let mut server = accept.await.unwrap();

        client.send(Bytes::from_static(b"ping")).await.unwrap();
        let got = server.recv().await.unwrap();
        assert_eq!(&got[..], b"ping");

        server.send(Bytes::from_static(b"pong")).await.unwrap();
        let mut client = client;
        let got = client.recv().await.unwrap();
        assert_eq!(&got[..], b"pong");
    }

    #[tokio::test]
    async fn test_large_transfer_in_order() {
        let (a, b) = pair().await;
        let b_addr = b.local_addr();

        // 1 MiB in 16 KiB chunks, larger than the send window
        let total = 1024 * 1024;
        let chunk = 16 * 1024;

        let accept = tokio::spawn(async move {
            let mut server = b.accept().await.unwrap();
            let mut received = Vec::with_capacity(total);
            while received.len() < total {
                match server.recv().await {
                    Some(bytes) => received.extend_from_slice(&bytes),
                    None => break,
                }
            }
            received
        });

        let client = a.connect(b_addr).await.unwrap();
        let mut pattern = Vec::with_capacity(total);
        for i in 0..total {
            pattern.push((i % 251) as u8);
        }
        for piece in pattern.chunks(chunk) {
            client
                .send(Bytes::copy_from_slice(piece))
                .await
                .unwrap();
        }

        let received = accept.await.unwrap();
        assert_eq!(received.len(), total);
        assert_eq!(received, pattern);
    }

    #[tokio::test]
    async fn test_close_propagates_eof() {
        let (a, b) = pair().await;
        let b_addr = b.local_addr();
        let accept = tokio::spawn(async move { b.accept().await.unwrap() });

        let mut client = a.connect(b_addr).await.unwrap();
        let mut server = accept.await.unwrap();

        client.send(Bytes::from_static(b"bye")).await.unwrap();
        client.close();

        assert_eq!(&server.recv().await.unwrap()[..], b"bye");
        assert!(server.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_connect_to_dead_port_fails() {
        let a = UtpEndpoint::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        // A bound socket with no endpoint behind it answers nothing useful;
        // bind and drop to find a dead port
        let dead = {
            let tmp = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
            tmp.local_addr().unwrap()
        };

        let result = a.connect(dead).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_raw_datagrams_do_not_disturb_utp() {
        let (a, b) = pair().await;
        let b_addr = b.local_addr();
        let accept = tokio::spawn(async move { b.accept().await.unwrap() });

        // Hole-punch style probes before and after connecting
        a.send_raw(b_addr, &[0u8]).await.unwrap();
        let client = a.connect(b_addr).await.unwrap();
        a.send_raw(b_addr, b"\x00probe").await.unwrap();

        let mut server = accept.await.unwrap();
        client.send(Bytes::from_static(b"data")).await.unwrap();
        assert_eq!(&server.recv().await.unwrap()[..], b"data");
    }
}
