//! Front: local tunnel endpoints
//!
//! The client role listens on its configured local address and turns every
//! accepted socket into a tunneled channel; the server role dials the
//! downstream service when a channel opens. Bytes move as DATA inner
//! messages; bounded queues at every hop make a stalled consumer pause the
//! producing socket instead of buffering without limit.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::connections::ClientConnection;
use crate::proto::peer::{inner_message, InnerMessage};
use crate::registry::Registry;

/// Read chunk from local sockets
const READ_CHUNK: usize = 16 * 1024;

/// Per-channel in-flight cap; the writer queue holds this many chunks
const WRITE_QUEUE_CHUNKS: usize = 16;

/// Bytes buffered for a channel whose downstream is still connecting
pub const MAX_CHANNEL_BUFFER: usize = 256 * 1024;

/// Downstream dial retry cycle
const DIAL_ATTEMPTS: u32 = 10;
const DIAL_RETRY_DELAY: Duration = Duration::from_millis(500);

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Local socket of either family
enum LocalStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl LocalStream {
    fn into_split(self) -> (BoxReader, BoxWriter) {
        match self {
            LocalStream::Tcp(stream) => {
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
            LocalStream::Unix(stream) => {
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
        }
    }
}

/// Connector-side channels buffer until the downstream socket is up
enum ChannelState {
    Connecting { buffer: Vec<Bytes>, buffered: usize },
    Open { write_tx: mpsc::Sender<Bytes> },
}

struct Channel {
    session_id: Uuid,
    connection: String,
    state: ChannelState,
}

pub struct Front {
    registry: Arc<Registry>,
    channels: Arc<Mutex<HashMap<Uuid, Channel>>>,
    listeners: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Front {
    pub fn new(registry: Arc<Registry>) -> Arc<Self> {
        Arc::new(Front {
            registry,
            channels: Arc::new(Mutex::new(HashMap::new())),
            listeners: Mutex::new(HashMap::new()),
        })
    }

    /// Reconcile listeners with the current client-role roster. Called at
    /// startup, on roster updates, and on SIGHUP.
    pub async fn sync(self: &Arc<Self>) {
        let connections = self.registry.connections();
        let mut desired: HashMap<String, ClientConnection> = HashMap::new();
        for tracker in connections.trackers() {
            let (_, clients) = connections.get(&tracker);
            for client in clients {
                desired.insert(client.name.clone(), client);
            }
        }

        let mut listeners = self.listeners.lock().unwrap();

        let stale: Vec<String> = listeners
            .keys()
            .filter(|name| !desired.contains_key(*name))
            .cloned()
            .collect();
        for name in stale {
            if let Some(handle) = listeners.remove(&name) {
                tracing::info!(target: "front", "stopping listener for {}", name);
                handle.abort();
            }
        }

        for (name, record) in desired {
            if listeners.contains_key(&name) {
                continue;
            }
            let front = self.clone();
            let label = name.clone();
            tracing::info!(
                target: "front",
                "starting listener for {} on {}:{}",
                name,
                record.listen_address,
                record.listen_port
            );
            let handle = tokio::spawn(async move {
                front.listen(record).await;
            });
            listeners.insert(label, handle);
        }
    }

    /// Listener task for one client-role connection
    async fn listen(self: Arc<Self>, record: ClientConnection) {
        if record.listen_address.starts_with('/') {
            let path = record.listen_address.clone();
            let _ = std::fs::remove_file(&path);
            let listener = match UnixListener::bind(&path) {
                Ok(listener) => listener,
                Err(e) => {
                    tracing::error!(target: "front", "cannot listen on {}: {}", path, e);
                    return;
                }
            };
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        self.start_channel(&record, LocalStream::Unix(stream)).await;
                    }
                    Err(e) => {
                        tracing::warn!(target: "front", "accept on {} failed: {}", path, e);
                    }
                }
            }
        } else {
            let addr = format!(
                "{}:{}",
                normalize_listen_addr(&record.listen_address),
                record.listen_port
            );
            let listener = match TcpListener::bind(&addr).await {
                Ok(listener) => listener,
                Err(e) => {
                    tracing::error!(target: "front", "cannot listen on {}: {}", addr, e);
                    return;
                }
            };
            loop {
                match listener.accept().await {
                    Ok((stream, from)) => {
                        tracing::debug!(target: "front", "{}: accepted {}", record.name, from);
                        self.start_channel(&record, LocalStream::Tcp(stream)).await;
                    }
                    Err(e) => {
                        tracing::warn!(target: "front", "accept on {} failed: {}", addr, e);
                    }
                }
            }
        }
    }

    /// Turn an accepted local socket into a channel on the live session
    async fn start_channel(self: &Arc<Self>, record: &ClientConnection, stream: LocalStream) {
        let peer = self.registry.peer();
        let channel_id = Uuid::new_v4();

        let Some(session_id) = peer
            .send_to_connection(
                &record.name,
                InnerMessage::open(channel_id.to_string()),
            )
            .await
        else {
            tracing::debug!(
                target: "front",
                "{}: no established session, dropping local connection",
                record.name
            );
            return;
        };

        let (reader, writer) = stream.into_split();
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_CHUNKS);
        self.channels.lock().unwrap().insert(
            channel_id,
            Channel {
                session_id,
                connection: record.name.clone(),
                state: ChannelState::Open { write_tx },
            },
        );

        self.spawn_pumps(channel_id, session_id, reader, writer, write_rx);
    }

    fn spawn_pumps(
        self: &Arc<Self>,
        channel_id: Uuid,
        session_id: Uuid,
        mut reader: BoxReader,
        mut writer: BoxWriter,
        mut write_rx: mpsc::Receiver<Bytes>,
    ) {
        // Local socket -> peer
        let front = self.clone();
        tokio::spawn(async move {
            let peer = front.registry.peer();
            let mut buf = vec![0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if !front.channels.lock().unwrap().contains_key(&channel_id) {
                            break;
                        }
                        let message =
                            InnerMessage::data(channel_id.to_string(), buf[..n].to_vec());
                        if !peer.send_inner(session_id, message).await {
                            break;
                        }
                    }
                }
            }
            front.close_channel(channel_id, true).await;
        });

        // Peer -> local socket
        let front = self.clone();
        tokio::spawn(async move {
            while let Some(bytes) = write_rx.recv().await {
                if writer.write_all(&bytes).await.is_err() {
                    front.close_channel(channel_id, true).await;
                    break;
                }
            }
            let _ = writer.shutdown().await;
        });
    }

    /// Channel-level messages arriving from a peer session
    pub async fn handle_inner(self: &Arc<Self>, session_id: Uuid, message: InnerMessage) {
        let Ok(channel_id) = Uuid::parse_str(&message.id) else {
            tracing::debug!(target: "front", "inner message with bad channel id {}", message.id);
            return;
        };

        match inner_message::Type::try_from(message.r#type) {
            Ok(inner_message::Type::Open) => self.handle_open(session_id, channel_id).await,
            Ok(inner_message::Type::Data) => {
                self.handle_data(channel_id, Bytes::from(message.data)).await;
            }
            Ok(inner_message::Type::Close) => self.close_channel(channel_id, false).await,
            Err(_) => {
                tracing::warn!(
                    target: "front",
                    "unknown inner message type {} on channel {}",
                    message.r#type,
                    channel_id
                );
            }
        }
    }

    /// Connector side: a peer opened a channel, dial the downstream
    async fn handle_open(self: &Arc<Self>, session_id: Uuid, channel_id: Uuid) {
        // Channel ids are allocated by the originator; a repeat is a
        // protocol fault
        if self.channels.lock().unwrap().contains_key(&channel_id) {
            tracing::error!(target: "front", "duplicate channel id {}", channel_id);
            self.send_close(session_id, channel_id).await;
            return;
        }

        let Some(record) = self.server_record_for_session(session_id) else {
            tracing::debug!(
                target: "front",
                "open on session {} with no server-role record",
                session_id
            );
            self.send_close(session_id, channel_id).await;
            return;
        };

        self.channels.lock().unwrap().insert(
            channel_id,
            Channel {
                session_id,
                connection: record.name.clone(),
                state: ChannelState::Connecting {
                    buffer: Vec::new(),
                    buffered: 0,
                },
            },
        );

        let front = self.clone();
        tokio::spawn(async move {
            front
                .dial_downstream(channel_id, session_id, record.connect_address, record.connect_port)
                .await;
        });
    }

    /// Find the server-role record whose session this is
    fn server_record_for_session(
        &self,
        session_id: Uuid,
    ) -> Option<crate::connections::ServerConnection> {
        let peer = self.registry.peer();
        let connection = peer.session_connection(session_id)?;
        match self.registry.connections().find(&connection) {
            Some(crate::connections::Record::Server(record)) => Some(record),
            _ => None,
        }
    }

    async fn dial_downstream(
        self: Arc<Self>,
        channel_id: Uuid,
        session_id: Uuid,
        address: String,
        port: u16,
    ) {
        let stream = dial_with_retry(&address, port).await;

        let Some(stream) = stream else {
            tracing::info!(
                target: "front",
                "downstream {}:{} unreachable, closing channel {}",
                address,
                port,
                channel_id
            );
            self.channels.lock().unwrap().remove(&channel_id);
            self.send_close(session_id, channel_id).await;
            return;
        };

        let (reader, writer) = stream.into_split();
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_CHUNKS);

        // Flush bytes that arrived while connecting, then switch to the
        // writer queue in one step so ordering holds
        let buffered = {
            let mut channels = self.channels.lock().unwrap();
            match channels.get_mut(&channel_id) {
                Some(channel) => {
                    let buffered = match &mut channel.state {
                        ChannelState::Connecting { buffer, .. } => std::mem::take(buffer),
                        ChannelState::Open { .. } => Vec::new(),
                    };
                    channel.state = ChannelState::Open {
                        write_tx: write_tx.clone(),
                    };
                    Some(buffered)
                }
                // Closed while we were dialing
                None => None,
            }
        };

        let Some(buffered) = buffered else {
            return;
        };
        for bytes in buffered {
            if write_tx.send(bytes).await.is_err() {
                return;
            }
        }

        self.spawn_pumps(channel_id, session_id, reader, writer, write_rx);
    }

    async fn handle_data(self: &Arc<Self>, channel_id: Uuid, bytes: Bytes) {
        enum Action {
            Drop,
            Overflow(Uuid),
            Write(mpsc::Sender<Bytes>),
        }

        let action = {
            let mut channels = self.channels.lock().unwrap();
            match channels.get_mut(&channel_id) {
                // Unknown channel: silently dropped
                None => Action::Drop,
                Some(channel) => match &mut channel.state {
                    ChannelState::Connecting { buffer, buffered } => {
                        *buffered += bytes.len();
                        if *buffered > MAX_CHANNEL_BUFFER {
                            Action::Overflow(channel.session_id)
                        } else {
                            buffer.push(bytes.clone());
                            Action::Drop
                        }
                    }
                    ChannelState::Open { write_tx } => Action::Write(write_tx.clone()),
                },
            }
        };

        match action {
            Action::Drop => {}
            Action::Overflow(session_id) => {
                tracing::warn!(
                    target: "front",
                    "channel {} overflowed its connect buffer",
                    channel_id
                );
                self.channels.lock().unwrap().remove(&channel_id);
                self.send_close(session_id, channel_id).await;
            }
            Action::Write(write_tx) => {
                // Blocking here pauses the session read loop, which is the
                // backpressure path toward the remote
                let _ = write_tx.send(bytes).await;
            }
        }
    }

    /// Tear down a channel. Idempotent; `notify_peer` sends CLOSE upstream.
    pub async fn close_channel(self: &Arc<Self>, channel_id: Uuid, notify_peer: bool) {
        let removed = self.channels.lock().unwrap().remove(&channel_id);
        let Some(channel) = removed else {
            return;
        };
        tracing::debug!(target: "front", "channel {} closed", channel_id);
        // Dropping the writer sender ends the writer task and shuts the
        // local socket down
        drop(channel.state);
        if notify_peer {
            self.send_close(channel.session_id, channel_id).await;
        }
    }

    async fn send_close(self: &Arc<Self>, session_id: Uuid, channel_id: Uuid) {
        let peer = self.registry.peer();
        let _ = peer
            .send_inner(session_id, InnerMessage::close(channel_id.to_string()))
            .await;
    }

    /// A session went away: free every channel that lived on it
    pub async fn handle_session_closed(self: &Arc<Self>, session_id: Uuid) {
        let dead: Vec<Uuid> = {
            let channels = self.channels.lock().unwrap();
            channels
                .iter()
                .filter(|(_, c)| c.session_id == session_id)
                .map(|(id, _)| *id)
                .collect()
        };
        for channel_id in dead {
            self.close_channel(channel_id, false).await;
        }
    }

    /// Channels currently alive for a connection
    pub fn channel_count(&self, connection: &str) -> usize {
        let channels = self.channels.lock().unwrap();
        channels
            .values()
            .filter(|c| c.connection == connection)
            .count()
    }
}

/// Dial the downstream service, retrying transient failures. A refused
/// connection fails fast; the service simply is not there.
async fn dial_with_retry(address: &str, port: u16) -> Option<LocalStream> {
    for attempt in 1..=DIAL_ATTEMPTS {
        let result = if address.starts_with('/') {
            UnixStream::connect(address).await.map(LocalStream::Unix)
        } else {
            TcpStream::connect((address, port)).await.map(LocalStream::Tcp)
        };
        match result {
            Ok(stream) => return Some(stream),
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => return None,
            Err(e) => {
                tracing::debug!(
                    target: "front",
                    "dial {}:{} attempt {}/{} failed: {}",
                    address,
                    port,
                    attempt,
                    DIAL_ATTEMPTS,
                    e
                );
                if attempt < DIAL_ATTEMPTS {
                    tokio::time::sleep(DIAL_RETRY_DELAY).await;
                }
            }
        }
    }
    None
}

/// Wildcard spellings accepted in listen addresses; `::` is historic
pub fn normalize_listen_addr(address: &str) -> &str {
    match address {
        "" | "*" | "::" => "0.0.0.0",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    use crate::config::{write_atomic, Config, ConfigFile, CONF_MODE};
    use crate::connections::ConnectionsList;
    use crate::crypto::identity::tests::test_identity;
    use crate::crypto::Crypter;
    use crate::peer::{Peer, PeerEvent};
    use crate::tracker::{Tokens, TrackerHandle};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_normalize_listen_addr() {
        assert_eq!(normalize_listen_addr(""), "0.0.0.0");
        assert_eq!(normalize_listen_addr("*"), "0.0.0.0");
        assert_eq!(normalize_listen_addr("::"), "0.0.0.0");
        assert_eq!(normalize_listen_addr("127.0.0.1"), "127.0.0.1");
    }

    const CONN: &str = "t1#user@example.com/svc";

    struct TestDaemon {
        _dir: tempfile::TempDir,
        peer: Arc<crate::peer::Peer>,
        front: Arc<Front>,
    }

    /// Full daemon minus tracker: components wired through a registry plus
    /// an event router matching the runtime's
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
        let front = Front::new(registry.clone());
        registry.set_front(front.clone());
        let tokens = Tokens::new(file, dir.path().join("master"));
        registry.set_tracker(TrackerHandle::new(registry.clone(), tokens, &[]));

        let (events_tx, mut events_rx) = mpsc::channel(32);
        let peer = Peer::start(registry.clone(), "127.0.0.1:0".parse().unwrap(), events_tx)
            .await
            .unwrap();
        registry.set_peer(peer.clone());

        let router_front = front.clone();
        tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    PeerEvent::Inner {
                        session_id,
                        message,
                        ..
                    } => router_front.handle_inner(session_id, message).await,
                    PeerEvent::Closed { session_id, .. } => {
                        router_front.handle_session_closed(session_id).await;
                    }
                    PeerEvent::Established { .. } => {}
                }
            }
        });

        front.sync().await;

        TestDaemon {
            _dir: dir,
            peer,
            front,
        }
    }

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    #[tokio::test]
    async fn test_loopback_tunnel_round_trip() {
        let a_keys = tempfile::tempdir().unwrap();
        let b_keys = tempfile::tempdir().unwrap();
        let (a_identity, a_pem) = test_identity(a_keys.path());
        let (b_identity, b_pem) = test_identity(b_keys.path());

        // Downstream echo service behind daemon B
        let echo = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_port = echo.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = echo.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        let listen_port = free_port();
        let a_conf = format!(
            "[t1]\n\n[{}]\ntype = client\nlisten_address = 127.0.0.1\n\
             listen_port = {}\nencrypted = no\nfixed = no\nserver = user?b\n",
            CONN, listen_port
        );
        let b_conf = format!(
            "[t1]\n\n[{}]\ntype = server\nconnect_address = 127.0.0.1\n\
             connect_port = {}\nencrypted = no\nfixed = no\n",
            CONN, echo_port
        );

        let a = daemon(&a_conf, a_identity, &[("user?b", &b_pem)]).await;
        let b = daemon(&b_conf, b_identity, &[("user?a", &a_pem)]).await;

        a.peer.connect(CONN, b.peer.local_addr()).await;
        let a_peer = a.peer.clone();
        wait_until("session establishment", move || {
            a_peer.established_sessions(CONN) == 1
        })
        .await;

        // Dial the local endpoint and push bytes through the tunnel; the
        // listener task may still be binding on the first attempts
        let mut client = loop {
            match tokio::net::TcpStream::connect(("127.0.0.1", listen_port)).await {
                Ok(stream) => break stream,
                Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        };
        client.write_all(b"ping").await.unwrap();

        let mut reply = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(10), client.read_exact(&mut reply))
            .await
            .expect("tunnel echo timed out")
            .unwrap();
        assert_eq!(&reply, b"ping");

        // A second, larger exchange on the same channel stays ordered
        let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        client.write_all(&payload).await.unwrap();
        let mut echoed = vec![0u8; payload.len()];
        tokio::time::timeout(Duration::from_secs(20), client.read_exact(&mut echoed))
            .await
            .expect("bulk echo timed out")
            .unwrap();
        assert_eq!(echoed, payload);

        // Closing the local socket tears the channel down on both sides
        drop(client);
        let a_front = a.front.clone();
        wait_until("listener-side channel teardown", move || {
            a_front.channel_count(CONN) == 0
        })
        .await;
        let b_front = b.front.clone();
        wait_until("connector-side channel teardown", move || {
            b_front.channel_count(CONN) == 0
        })
        .await;
    }
}
