//! Tracker client
//!
//! One task per configured tracker holds a TCP connection with
//! exponential-backoff reconnect, registers the daemon, routes framed
//! requests to waiters keyed by `message_id`, and forwards
//! tracker-originated punch and address requests to Peer. A disconnected
//! tracker answers `NO_TRACKER` immediately; nothing is queued.

pub mod tokens;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::config::TrackerConfig;
use crate::error::TrackerError;
use crate::proto::tracker::{
    client_message, lookup_identity_response, server_message, ClientMessage,
    LookupIdentityRequest, RegisterDaemonRequest, ServerMessage, Status,
};
use crate::proto::{read_frame, write_frame, MessageResult};
use crate::registry::Registry;

pub use tokens::Tokens;

/// Bound on any tracker round-trip
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Reconnect backoff bounds
const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

struct ServerState {
    config: TrackerConfig,
    connected: bool,
    registered: bool,
    email: String,
    daemon_name: String,
    write_tx: Option<mpsc::Sender<ClientMessage>>,
    waiters: HashMap<String, oneshot::Sender<ServerMessage>>,
    remote_addr: Option<SocketAddr>,
}

impl ServerState {
    fn new(config: TrackerConfig) -> Self {
        ServerState {
            config,
            connected: false,
            registered: false,
            email: String::new(),
            daemon_name: String::new(),
            write_tx: None,
            waiters: HashMap::new(),
            remote_addr: None,
        }
    }
}

struct TrackerShared {
    registry: Arc<Registry>,
    tokens: Tokens,
    servers: Mutex<HashMap<String, ServerState>>,
}

/// Cloneable handle to the tracker subsystem
#[derive(Clone)]
pub struct TrackerHandle {
    shared: Arc<TrackerShared>,
}

impl TrackerHandle {
    pub fn new(registry: Arc<Registry>, tokens: Tokens, trackers: &[TrackerConfig]) -> Self {
        let mut servers = HashMap::new();
        for config in trackers {
            servers.insert(config.name.clone(), ServerState::new(config.clone()));
        }
        TrackerHandle {
            shared: Arc::new(TrackerShared {
                registry,
                tokens,
                servers: Mutex::new(servers),
            }),
        }
    }

    /// Start the per-tracker connection tasks
    pub fn spawn(&self) {
        let names: Vec<String> = {
            let servers = self.shared.servers.lock().unwrap();
            servers.keys().cloned().collect()
        };
        for name in names {
            let handle = self.clone();
            tokio::spawn(async move {
                handle.run_server(name).await;
            });
        }
    }

    pub fn tracker_names(&self) -> Vec<String> {
        let servers = self.shared.servers.lock().unwrap();
        servers.keys().cloned().collect()
    }

    pub fn is_connected(&self, tracker: &str) -> bool {
        let servers = self.shared.servers.lock().unwrap();
        servers.get(tracker).map(|s| s.connected).unwrap_or(false)
    }

    pub fn is_registered(&self, tracker: &str) -> bool {
        let servers = self.shared.servers.lock().unwrap();
        servers.get(tracker).map(|s| s.registered).unwrap_or(false)
    }

    /// Registered account email and daemon name, once known
    pub fn registration(&self, tracker: &str) -> Option<(String, String)> {
        let servers = self.shared.servers.lock().unwrap();
        let state = servers.get(tracker)?;
        state
            .registered
            .then(|| (state.email.clone(), state.daemon_name.clone()))
    }

    pub fn tokens(&self) -> &Tokens {
        &self.shared.tokens
    }

    /// Round-trip a request, bounded by [`REQUEST_TIMEOUT`]
    pub async fn request(
        &self,
        tracker: &str,
        message: ClientMessage,
    ) -> Result<ServerMessage, TrackerError> {
        self.request_with_timeout(tracker, message, REQUEST_TIMEOUT)
            .await
    }

    async fn request_with_timeout(
        &self,
        tracker: &str,
        message: ClientMessage,
        timeout: Duration,
    ) -> Result<ServerMessage, TrackerError> {
        let message_id = message.message_id.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        let write_tx = {
            let mut servers = self.shared.servers.lock().unwrap();
            let state = servers
                .get_mut(tracker)
                .ok_or(TrackerError::UnknownTracker)?;
            if !state.connected {
                return Err(TrackerError::NoTracker);
            }
            let write_tx = state.write_tx.clone().ok_or(TrackerError::NoTracker)?;
            state.waiters.insert(message_id.clone(), reply_tx);
            write_tx
        };

        if write_tx.send(message).await.is_err() {
            self.remove_waiter(tracker, &message_id);
            return Err(TrackerError::NoTracker);
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => Ok(reply),
            // Waiter dropped on disconnect
            Ok(Err(_)) => Err(TrackerError::Timeout),
            Err(_) => {
                self.remove_waiter(tracker, &message_id);
                Err(TrackerError::Timeout)
            }
        }
    }

    /// Queue a message without waiting for a reply
    pub async fn send(&self, tracker: &str, message: ClientMessage) -> Result<(), TrackerError> {
        let write_tx = {
            let servers = self.shared.servers.lock().unwrap();
            let state = servers.get(tracker).ok_or(TrackerError::UnknownTracker)?;
            if !state.connected {
                return Err(TrackerError::NoTracker);
            }
            state.write_tx.clone().ok_or(TrackerError::NoTracker)?
        };
        write_tx
            .send(message)
            .await
            .map_err(|_| TrackerError::NoTracker)
    }

    /// Resolve a peer identity to `(name, public key PEM)`
    pub async fn lookup_identity(
        &self,
        tracker: &str,
        identity: &str,
    ) -> Option<(String, String)> {
        let mut message = ClientMessage::new(
            client_message::Type::LookupIdentityRequest,
            Uuid::new_v4().to_string(),
        );
        message.lookup_identity_request = Some(LookupIdentityRequest {
            identity: identity.to_string(),
        });

        let reply = self
            .request_with_timeout(tracker, message, crate::crypto::LOOKUP_TIMEOUT)
            .await
            .ok()?;
        let response = reply.lookup_identity_response?;
        if response.response != lookup_identity_response::Response::Found as i32 {
            return None;
        }
        let key = BASE64.decode(&response.key).ok()?;
        let key = String::from_utf8(key).ok()?;
        Some((response.name, key))
    }

    /// Report the live session count for a connection to its tracker
    pub async fn send_status(&self, connection_name: &str) {
        let Some(tracker) = connection_name.split('#').next() else {
            return;
        };
        let sessions = self
            .shared
            .registry
            .peer()
            .established_sessions(connection_name);
        self.shared
            .registry
            .connections()
            .set_session_count(connection_name, sessions);

        let mut message =
            ClientMessage::new(client_message::Type::Status, Uuid::new_v4().to_string());
        message.status = Some(Status {
            connection_name: connection_name.to_string(),
            sessions,
        });
        if let Err(e) = self.send(tracker, message).await {
            tracing::debug!(target: "tracker", "status for {} not sent: {}", connection_name, e);
        }
    }

    fn remove_waiter(&self, tracker: &str, message_id: &str) {
        let mut servers = self.shared.servers.lock().unwrap();
        if let Some(state) = servers.get_mut(tracker) {
            state.waiters.remove(message_id);
        }
    }

    /// Connection loop for one tracker
    async fn run_server(self, name: String) {
        let config = {
            let servers = self.shared.servers.lock().unwrap();
            match servers.get(&name) {
                Some(state) => state.config.clone(),
                None => return,
            }
        };

        let mut backoff = INITIAL_BACKOFF;
        loop {
            let stream =
                match TcpStream::connect((config.address.as_str(), config.port)).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::debug!(
                            target: "tracker",
                            "{}: connect failed: {}, retrying in {:?}",
                            name,
                            e,
                            backoff
                        );
                        tokio::time::sleep(jittered(backoff)).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                        continue;
                    }
                };
            backoff = INITIAL_BACKOFF;

            let remote_addr = stream.peer_addr().ok();
            let (mut read_half, mut write_half) = stream.into_split();
            let (write_tx, mut write_rx) = mpsc::channel::<ClientMessage>(64);

            {
                let mut servers = self.shared.servers.lock().unwrap();
                if let Some(state) = servers.get_mut(&name) {
                    state.connected = true;
                    state.write_tx = Some(write_tx);
                    state.remote_addr = remote_addr;
                }
            }
            tracing::info!(target: "tracker", "{}: connected", name);

            let writer = tokio::spawn(async move {
                while let Some(message) = write_rx.recv().await {
                    if write_frame(&mut write_half, &message).await.is_err() {
                        break;
                    }
                }
            });

            // Register with the stored daemon token, if any
            let registrar = self.clone();
            let registrar_name = name.clone();
            tokio::spawn(async move {
                registrar.register(&registrar_name).await;
            });

            loop {
                match read_frame::<_, ServerMessage>(&mut read_half).await {
                    Ok(Ok(message)) => self.dispatch(&name, message).await,
                    Ok(Err(e)) => {
                        tracing::warn!(target: "tracker", "{}: protocol error: {}", name, e);
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(target: "tracker", "{}: read failed: {}", name, e);
                        break;
                    }
                }
            }

            writer.abort();
            self.mark_disconnected(&name);
            tokio::time::sleep(jittered(INITIAL_BACKOFF)).await;
        }
    }

    fn mark_disconnected(&self, name: &str) {
        let mut servers = self.shared.servers.lock().unwrap();
        if let Some(state) = servers.get_mut(name) {
            state.connected = false;
            state.registered = false;
            state.write_tx = None;
            state.remote_addr = None;
            // Dropping the senders wakes every pending waiter
            state.waiters.clear();
        }
        tracing::warn!(target: "tracker", "{}: disconnected", name);
    }

    /// Re-run registration after a token change
    pub async fn reregister(&self, tracker: &str) {
        if self.is_connected(tracker) {
            self.register(tracker).await;
        }
    }

    /// Register this daemon and push a status for every connection
    async fn register(&self, tracker: &str) {
        let Some(token) = self.shared.tokens.daemon_token(tracker) else {
            tracing::debug!(target: "tracker", "{}: no daemon token, staying unregistered", tracker);
            return;
        };
        let crypter = self.shared.registry.crypter();

        let mut message = ClientMessage::new(
            client_message::Type::RegisterDaemonRequest,
            Uuid::new_v4().to_string(),
        );
        message.register_daemon_request = Some(RegisterDaemonRequest {
            token,
            identity: crypter.identity().to_string(),
            key: BASE64.encode(crypter.public_pem().as_bytes()),
            version: env!("CARGO_PKG_VERSION").to_string(),
        });

        let reply = match self.request(tracker, message).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(target: "tracker", "{}: registration failed: {}", tracker, e);
                return;
            }
        };
        let Some(response) = reply.register_daemon_response else {
            return;
        };
        if response.response != MessageResult::Accepted as i32 {
            tracing::warn!(
                target: "tracker",
                "{}: registration rejected: {:?}",
                tracker,
                MessageResult::try_from(response.response).ok()
            );
            return;
        }

        {
            let mut servers = self.shared.servers.lock().unwrap();
            if let Some(state) = servers.get_mut(tracker) {
                state.registered = true;
                state.email = response.email.clone();
                state.daemon_name = response.name.clone();
            }
        }
        tracing::info!(
            target: "tracker",
            "{}: registered as {} ({})",
            tracker,
            response.name,
            response.email
        );

        // Initial status synchronization
        let connections = self.shared.registry.connections();
        let (servers, clients) = connections.get(tracker);
        for record in servers.iter().map(|c| c.name.clone()).chain(
            clients.iter().map(|c| c.name.clone()),
        ) {
            self.send_status(&record).await;
        }
    }

    /// Handle one tracker-originated message
    async fn dispatch(&self, tracker: &str, message: ServerMessage) {
        match server_message::Type::try_from(message.r#type) {
            Ok(server_message::Type::ConnectionsList) => {
                if let Some(list) = message.connections_list {
                    tracing::info!(
                        target: "tracker",
                        "{}: roster push with {} server / {} client connections",
                        tracker,
                        list.server_connections.len(),
                        list.client_connections.len()
                    );
                    let connections = self.shared.registry.connections();
                    let (old_servers, old_clients) = connections.get(tracker);
                    connections.replace(tracker, &list);
                    if let Err(e) = connections.save() {
                        tracing::warn!(target: "tracker", "roster save failed: {}", e);
                    }

                    // Sessions of connections the tracker dropped go away
                    let peer = self.shared.registry.peer();
                    for name in old_servers
                        .iter()
                        .map(|c| c.name.as_str())
                        .chain(old_clients.iter().map(|c| c.name.as_str()))
                    {
                        if connections.find(name).is_none() {
                            peer.close_connection(name).await;
                        }
                    }
                    self.shared.registry.front().sync().await;
                }
            }
            Ok(server_message::Type::AddressRequest) => {
                let Some(request) = message.address_request else {
                    return;
                };
                let Some(addr) = self.udp_addr(tracker) else {
                    return;
                };
                tracing::debug!(
                    target: "tracker",
                    "{}: address request {} for {}",
                    tracker,
                    request.request_id,
                    request.connection_name
                );
                self.shared
                    .registry
                    .peer()
                    .send_address_response(addr, &request.request_id)
                    .await;
            }
            Ok(server_message::Type::PunchRequest) => {
                if let Some(request) = message.punch_request {
                    tracing::debug!(
                        target: "tracker",
                        "{}: punch request for {}",
                        tracker,
                        request.connection_name
                    );
                    self.shared.registry.peer().punch(request).await;
                }
            }
            Ok(_) => {
                let mut servers = self.shared.servers.lock().unwrap();
                let Some(state) = servers.get_mut(tracker) else {
                    return;
                };
                match state.waiters.remove(&message.message_id) {
                    Some(waiter) => {
                        let _ = waiter.send(message);
                    }
                    // Out-of-order or expired: drop
                    None => {
                        tracing::trace!(
                            target: "tracker",
                            "{}: unmatched response {}",
                            tracker,
                            message.message_id
                        );
                    }
                }
            }
            Err(_) => {
                tracing::warn!(
                    target: "tracker",
                    "{}: unknown message type {}",
                    tracker,
                    message.r#type
                );
            }
        }
    }

    /// UDP-reachable tracker address for direct datagrams
    fn udp_addr(&self, tracker: &str) -> Option<SocketAddr> {
        let servers = self.shared.servers.lock().unwrap();
        servers.get(tracker)?.remote_addr
    }
}

/// Apply ±25% jitter so a fleet of daemons does not reconnect in lockstep
fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.75..1.25);
    base.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{write_atomic, ConfigFile, CONF_MODE};
    use crate::proto::tracker::ConnectionsListResponse;
    use tokio::net::TcpListener;

    fn test_tokens(dir: &std::path::Path) -> Tokens {
        write_atomic(&dir.join("bhid.conf"), b"[daemon]\n", CONF_MODE).unwrap();
        let file = Arc::new(Mutex::new(ConfigFile::load(dir).unwrap()));
        Tokens::new(file, dir.join("master"))
    }

    fn handle_with(trackers: &[TrackerConfig], dir: &std::path::Path) -> TrackerHandle {
        TrackerHandle::new(Registry::new(), test_tokens(dir), trackers)
    }

    #[tokio::test]
    async fn test_unknown_tracker() {
        let dir = tempfile::tempdir().unwrap();
        let handle = handle_with(&[], dir.path());
        let message =
            ClientMessage::new(client_message::Type::TreeRequest, "m1".to_string());
        assert_eq!(
            handle.request("nope", message).await.unwrap_err(),
            TrackerError::UnknownTracker
        );
    }

    #[tokio::test]
    async fn test_disconnected_is_no_tracker() {
        let dir = tempfile::tempdir().unwrap();
        let config = TrackerConfig {
            name: "t1".into(),
            address: "127.0.0.1".into(),
            port: 1,
            token: None,
        };
        let handle = handle_with(&[config], dir.path());
        let message =
            ClientMessage::new(client_message::Type::TreeRequest, "m1".to_string());
        assert_eq!(
            handle.request("t1", message).await.unwrap_err(),
            TrackerError::NoTracker
        );
    }

    #[tokio::test]
    async fn test_request_round_trip_with_mock_tracker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Mock tracker: echo every request's message id in a
        // ConnectionsListResponse
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            loop {
                let request: ClientMessage =
                    match read_frame(&mut stream).await {
                        Ok(Ok(request)) => request,
                        _ => break,
                    };
                let mut reply = ServerMessage {
                    r#type: server_message::Type::ConnectionsListResponse as i32,
                    message_id: request.message_id,
                    ..Default::default()
                };
                reply.connections_list_response = Some(ConnectionsListResponse {
                    response: MessageResult::Accepted as i32,
                    list: None,
                });
                if write_frame(&mut stream, &reply).await.is_err() {
                    break;
                }
            }
        });

        let dir = tempfile::tempdir().unwrap();
        let config = TrackerConfig {
            name: "t1".into(),
            address: "127.0.0.1".into(),
            port,
            token: None,
        };
        let handle = handle_with(&[config], dir.path());
        handle.spawn();

        // Wait for the connection task to come up
        for _ in 0..50 {
            if handle.is_connected("t1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(handle.is_connected("t1"));

        let message = ClientMessage::new(
            client_message::Type::ConnectionsListRequest,
            Uuid::new_v4().to_string(),
        );
        let reply = handle.request("t1", message).await.unwrap();
        let response = reply.connections_list_response.unwrap();
        assert_eq!(response.response, MessageResult::Accepted as i32);
    }

    #[tokio::test]
    async fn test_waiter_expires() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Mock tracker that never answers
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            // Keep the connection open
            std::mem::forget(stream);
            std::future::pending::<()>().await;
        });

        let dir = tempfile::tempdir().unwrap();
        let config = TrackerConfig {
            name: "t1".into(),
            address: "127.0.0.1".into(),
            port,
            token: None,
        };
        let handle = handle_with(&[config], dir.path());
        handle.spawn();
        for _ in 0..50 {
            if handle.is_connected("t1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let message =
            ClientMessage::new(client_message::Type::TreeRequest, "m-slow".to_string());
        let result = handle
            .request_with_timeout("t1", message, Duration::from_millis(100))
            .await;
        assert_eq!(result.unwrap_err(), TrackerError::Timeout);

        // The waiter is gone
        let servers = handle.shared.servers.lock().unwrap();
        assert!(servers.get("t1").unwrap().waiters.is_empty());
    }
}
