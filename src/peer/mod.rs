//! Peer subsystem
//!
//! Owns the shared UTP endpoint and every peer session. Inbound UTP
//! connections become unbound sessions that must identify themselves;
//! outbound ones are opened for client-role connections after a hole
//! punch. Channel traffic flows through `send_inner`/`PeerEvent::Inner`.

pub mod session;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::connections::Record;
use crate::error::TransportError;
use crate::proto::encode_frame;
use crate::proto::peer::InnerMessage;
use crate::proto::tracker::{client_message, AddressResponse, ClientMessage, PunchRequest};
use crate::registry::Registry;
use crate::utp::UtpEndpoint;

use session::Session;

/// Probes sent to open a NAT pinhole, and their spacing
const PUNCH_PROBES: u32 = 3;
const PUNCH_INTERVAL: Duration = Duration::from_millis(100);

/// Delay before the client side dials through the punched hole
const PUNCH_CONNECT_DELAY: Duration = Duration::from_millis(200);

/// Events Peer raises toward Front and the tracker status reporting
#[derive(Debug)]
pub enum PeerEvent {
    Established {
        session_id: Uuid,
        connection: String,
    },
    Closed {
        session_id: Uuid,
        connection: String,
        was_established: bool,
    },
    Inner {
        session_id: Uuid,
        connection: String,
        message: InnerMessage,
    },
}

/// Commands accepted by a session task
#[derive(Debug)]
pub enum SessionCmd {
    SendInner(InnerMessage),
    Bye,
}

pub(crate) struct SessionEntry {
    pub connection: Option<String>,
    pub established: bool,
    pub outbound: bool,
    pub cmd_tx: mpsc::Sender<SessionCmd>,
}

pub(crate) type SessionMap = Arc<Mutex<HashMap<Uuid, SessionEntry>>>;

/// Shared context handed to each session task
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub crypter: Arc<crate::crypto::Crypter>,
    pub connections: Arc<crate::connections::ConnectionsList>,
    pub registry: Arc<Registry>,
    pub sessions: SessionMap,
    pub events: mpsc::Sender<PeerEvent>,
}

pub struct Peer {
    endpoint: Arc<UtpEndpoint>,
    sessions: SessionMap,
    registry: Arc<Registry>,
    events: mpsc::Sender<PeerEvent>,
}

impl Peer {
    /// Bind the UTP endpoint and start accepting inbound sessions
    pub async fn start(
        registry: Arc<Registry>,
        bind: SocketAddr,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<Self>, TransportError> {
        let endpoint = UtpEndpoint::bind(bind).await?;
        let peer = Arc::new(Peer {
            endpoint,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            registry,
            events,
        });

        let acceptor = peer.clone();
        tokio::spawn(async move {
            acceptor.accept_loop().await;
        });

        Ok(peer)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.endpoint.local_addr()
    }

    fn context(&self) -> SessionContext {
        SessionContext {
            crypter: self.registry.crypter(),
            connections: self.registry.connections(),
            registry: self.registry.clone(),
            sessions: self.sessions.clone(),
            events: self.events.clone(),
        }
    }

    async fn accept_loop(self: Arc<Self>) {
        while let Some(stream) = self.endpoint.accept().await {
            let id = Uuid::new_v4();
            tracing::debug!(
                target: "peer",
                "inbound session {} from {}",
                id,
                stream.remote_addr()
            );
            let (cmd_tx, cmd_rx) = mpsc::channel(64);
            self.sessions.lock().unwrap().insert(
                id,
                SessionEntry {
                    connection: None,
                    established: false,
                    outbound: false,
                    cmd_tx,
                },
            );
            let session = Session::new(id, stream, cmd_rx, self.context(), None, false);
            tokio::spawn(session.run());
        }
    }

    /// Open an outbound session for a client-role connection
    pub async fn connect(&self, connection: &str, remote: SocketAddr) {
        if self.established_sessions(connection) > 0 {
            tracing::debug!(
                target: "peer",
                "{} already has a live session, skipping connect",
                connection
            );
            return;
        }

        let stream = match self.endpoint.connect(remote).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::info!(target: "peer", "connect to {} failed: {}", remote, e);
                return;
            }
        };

        let id = Uuid::new_v4();
        tracing::debug!(target: "peer", "outbound session {} to {}", id, remote);
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        self.sessions.lock().unwrap().insert(
            id,
            SessionEntry {
                connection: Some(connection.to_string()),
                established: false,
                outbound: true,
                cmd_tx,
            },
        );
        let session = Session::new(
            id,
            stream,
            cmd_rx,
            self.context(),
            Some(connection.to_string()),
            true,
        );
        tokio::spawn(session.run());
    }

    /// Handle a tracker punch request: open the pinhole from both sides,
    /// then dial from the client role
    pub async fn punch(self: &Arc<Self>, request: PunchRequest) {
        let record = self.registry.connections().find(&request.connection_name);
        let (is_server, target) = match (&record, &request.server, &request.client) {
            (Some(Record::Server(_)), _, Some(client)) => (true, client.clone()),
            (Some(Record::Client(_)), Some(server), _) => (false, server.clone()),
            _ => {
                tracing::debug!(
                    target: "peer",
                    "punch request for unknown connection {}",
                    request.connection_name
                );
                return;
            }
        };

        let Ok(ip) = target.address.parse() else {
            tracing::warn!(target: "peer", "punch request with bad address {}", target.address);
            return;
        };
        let remote = SocketAddr::new(ip, target.port as u16);
        let connection = request.connection_name.clone();
        let peer = self.clone();

        tokio::spawn(async move {
            for _ in 0..PUNCH_PROBES {
                let _ = peer.endpoint.send_raw(remote, &[0u8]).await;
                tokio::time::sleep(PUNCH_INTERVAL).await;
            }
            if !is_server {
                tokio::time::sleep(PUNCH_CONNECT_DELAY).await;
                peer.connect(&connection, remote).await;
            }
        });
    }

    /// Answer a tracker address request with a UDP datagram from the shared
    /// socket, revealing this daemon's NAT mapping to the tracker
    pub async fn send_address_response(&self, tracker_addr: SocketAddr, request_id: &str) {
        let message = ClientMessage {
            r#type: client_message::Type::AddressResponse as i32,
            message_id: Uuid::new_v4().to_string(),
            address_response: Some(AddressResponse {
                request_id: request_id.to_string(),
            }),
            ..Default::default()
        };
        if let Err(e) = self
            .endpoint
            .send_raw(tracker_addr, &encode_frame(&message))
            .await
        {
            tracing::warn!(target: "peer", "address response to {} failed: {}", tracker_addr, e);
        }
    }

    /// Queue an inner message onto a session; false if the session is gone
    pub async fn send_inner(&self, session_id: Uuid, message: InnerMessage) -> bool {
        let cmd_tx = {
            let sessions = self.sessions.lock().unwrap();
            sessions.get(&session_id).map(|e| e.cmd_tx.clone())
        };
        match cmd_tx {
            Some(tx) => tx.send(SessionCmd::SendInner(message)).await.is_ok(),
            None => false,
        }
    }

    /// Queue an inner message onto the first established session of a
    /// connection, returning the session used
    pub async fn send_to_connection(
        &self,
        connection: &str,
        message: InnerMessage,
    ) -> Option<Uuid> {
        let target = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .iter()
                .find(|(_, e)| e.established && e.connection.as_deref() == Some(connection))
                .map(|(id, e)| (*id, e.cmd_tx.clone()))
        };
        let (id, tx) = target?;
        tx.send(SessionCmd::SendInner(message)).await.ok()?;
        Some(id)
    }

    /// Connection a session is bound to, if any
    pub fn session_connection(&self, session_id: Uuid) -> Option<String> {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(&session_id)?.connection.clone()
    }

    /// Count of established sessions for a connection
    pub fn established_sessions(&self, connection: &str) -> u32 {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .values()
            .filter(|e| e.established && e.connection.as_deref() == Some(connection))
            .count() as u32
    }

    /// Gracefully close one session
    pub async fn bye(&self, session_id: Uuid) {
        let cmd_tx = {
            let sessions = self.sessions.lock().unwrap();
            sessions.get(&session_id).map(|e| e.cmd_tx.clone())
        };
        if let Some(tx) = cmd_tx {
            let _ = tx.send(SessionCmd::Bye).await;
        }
    }

    /// Close every session belonging to a connection (delete/detach)
    pub async fn close_connection(&self, connection: &str) {
        let targets: Vec<mpsc::Sender<SessionCmd>> = {
            let sessions = self.sessions.lock().unwrap();
            sessions
                .values()
                .filter(|e| e.connection.as_deref() == Some(connection))
                .map(|e| e.cmd_tx.clone())
                .collect()
        };
        for tx in targets {
            let _ = tx.send(SessionCmd::Bye).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use crate::config::{write_atomic, Config, ConfigFile, CONF_MODE};
    use crate::connections::ConnectionsList;
    use crate::crypto::identity::tests::test_identity;
    use crate::crypto::Crypter;
    use crate::proto::peer::{inner_message, InnerMessage};
    use crate::tracker::{Tokens, TrackerHandle};

    const CONN: &str = "t1#user@example.com/svc";

    struct TestDaemon {
        _dir: tempfile::TempDir,
        peer: Arc<Peer>,
        events: mpsc::Receiver<PeerEvent>,
    }

    /// Stand up one daemon with a seeded roster; `peers` pre-populates the
    /// key cache as (name, pem) pairs
    async fn daemon(
        conf: &str,
        identity: crate::crypto::identity::Identity,
        peers: &[(&str, &str)],
    ) -> TestDaemon {
        let dir = tempfile::tempdir().unwrap();
        write_atomic(&dir.path().join("bhid.conf"), conf.as_bytes(), CONF_MODE).unwrap();

        let cache = dir.path().join("peers").join("t1");
        std::fs::create_dir_all(&cache).unwrap();
        for (name, pem) in peers {
            std::fs::write(cache.join(format!("{}.rsa", name)), pem).unwrap();
        }

        let file = ConfigFile::load(dir.path()).unwrap();
        let config = Config::from_document(dir.path(), None, &file.document).unwrap();
        let file = Arc::new(StdMutex::new(file));

        let registry = Registry::new();
        registry.set_config(Arc::new(config));
        registry.set_crypter(Arc::new(Crypter::new(identity, dir.path().join("peers"))));
        registry.set_connections(Arc::new(ConnectionsList::load(file.clone()).unwrap()));
        let tokens = Tokens::new(file, dir.path().join("master"));
        registry.set_tracker(TrackerHandle::new(registry.clone(), tokens, &[]));

        let (events_tx, events) = mpsc::channel(64);
        let peer = Peer::start(registry.clone(), "127.0.0.1:0".parse().unwrap(), events_tx)
            .await
            .unwrap();
        registry.set_peer(peer.clone());

        TestDaemon {
            _dir: dir,
            peer,
            events,
        }
    }

    fn client_conf(fixed: bool) -> String {
        format!(
            "[t1]\n\n[{}]\ntype = client\nlisten_address = 127.0.0.1\nlisten_port = 0\n\
             encrypted = yes\nfixed = {}\nserver = user?b\n",
            CONN,
            if fixed { "yes" } else { "no" }
        )
    }

    fn server_conf(peers: &str) -> String {
        let fixed = if peers.is_empty() { "no" } else { "yes" };
        let peers_line = if peers.is_empty() {
            String::new()
        } else {
            format!("peers = {}\n", peers)
        };
        format!(
            "[t1]\n\n[{}]\ntype = server\nconnect_address = 127.0.0.1\nconnect_port = 9\n\
             encrypted = yes\nfixed = {}\n{}",
            CONN, fixed, peers_line
        )
    }

    async fn next_event(events: &mut mpsc::Receiver<PeerEvent>) -> PeerEvent {
        tokio::time::timeout(Duration::from_secs(15), events.recv())
            .await
            .expect("timed out waiting for peer event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_sessions_establish_and_carry_inner_messages() {
        let a_keys = tempfile::tempdir().unwrap();
        let b_keys = tempfile::tempdir().unwrap();
        let (a_identity, a_pem) = test_identity(a_keys.path());
        let (b_identity, b_pem) = test_identity(b_keys.path());

        let mut a = daemon(&client_conf(false), a_identity, &[("user?b", &b_pem)]).await;
        let mut b = daemon(&server_conf(""), b_identity, &[("user?a", &a_pem)]).await;

        a.peer.connect(CONN, b.peer.local_addr()).await;

        let established_a = next_event(&mut a.events).await;
        assert!(matches!(
            established_a,
            PeerEvent::Established { ref connection, .. } if connection == CONN
        ));
        let established_b = next_event(&mut b.events).await;
        assert!(matches!(
            established_b,
            PeerEvent::Established { ref connection, .. } if connection == CONN
        ));
        assert_eq!(a.peer.established_sessions(CONN), 1);
        assert_eq!(b.peer.established_sessions(CONN), 1);

        // Channel protocol flows through the encrypted envelope
        let channel = Uuid::new_v4().to_string();
        a.peer
            .send_to_connection(CONN, InnerMessage::open(channel.clone()))
            .await
            .expect("established session accepts inner messages");
        a.peer
            .send_to_connection(CONN, InnerMessage::data(channel.clone(), b"ping".to_vec()))
            .await
            .unwrap();

        match next_event(&mut b.events).await {
            PeerEvent::Inner { message, .. } => {
                assert_eq!(message.r#type, inner_message::Type::Open as i32);
                assert_eq!(message.id, channel);
            }
            other => panic!("expected OPEN, got {:?}", other),
        }
        match next_event(&mut b.events).await {
            PeerEvent::Inner { message, .. } => {
                assert_eq!(message.r#type, inner_message::Type::Data as i32);
                assert_eq!(message.data, b"ping");
            }
            other => panic!("expected DATA, got {:?}", other),
        }

        // Graceful teardown reaches both sides
        a.peer.close_connection(CONN).await;
        loop {
            if let PeerEvent::Closed {
                was_established, ..
            } = next_event(&mut a.events).await
            {
                assert!(was_established);
                break;
            }
        }
        loop {
            if let PeerEvent::Closed { .. } = next_event(&mut b.events).await {
                break;
            }
        }
        assert_eq!(b.peer.established_sessions(CONN), 0);
    }

    #[tokio::test]
    async fn test_fixed_connection_rejects_unlisted_peer() {
        let a_keys = tempfile::tempdir().unwrap();
        let b_keys = tempfile::tempdir().unwrap();
        let (a_identity, a_pem) = test_identity(a_keys.path());
        let (b_identity, b_pem) = test_identity(b_keys.path());

        // The server pins a different peer; the client's key is cached
        // under its real name which is not listed
        let mut a = daemon(&client_conf(false), a_identity, &[("user?b", &b_pem)]).await;
        let mut b = daemon(
            &server_conf("user?someone-else"),
            b_identity,
            &[("user?a", &a_pem)],
        )
        .await;

        a.peer.connect(CONN, b.peer.local_addr()).await;

        // The client learns it was rejected and closes unestablished
        loop {
            match next_event(&mut a.events).await {
                PeerEvent::Closed {
                    was_established, ..
                } => {
                    assert!(!was_established);
                    break;
                }
                PeerEvent::Established { .. } => panic!("rejected session established"),
                _ => {}
            }
        }
        assert_eq!(a.peer.established_sessions(CONN), 0);

        // The server never establishes either
        loop {
            match next_event(&mut b.events).await {
                PeerEvent::Closed {
                    was_established, ..
                } => {
                    assert!(!was_established);
                    break;
                }
                PeerEvent::Established { .. } => panic!("rejected session established"),
                _ => {}
            }
        }
        assert_eq!(b.peer.established_sessions(CONN), 0);
    }
}
