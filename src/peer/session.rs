//! Peer session state machine
//!
//! One task per UTP session. A session moves through handshake and
//! verification before Front may open channels on it:
//! `NEW → HANDSHAKING → VERIFYING → ESTABLISHED → CLOSING → CLOSED`.
//! Outbound sessions know their connection up front; inbound ones bind to
//! the name carried by the first ConnectRequest and are torn down if that
//! never happens.

use std::time::Duration;

use prost::Message;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::connections::Record;
use crate::proto::peer::{
    connect_response, outer_message, ConnectRequest, InnerMessage, OuterMessage,
};
use crate::proto::{encode_frame, FrameBuffer};
use crate::utp::UtpStream;

use super::{PeerEvent, SessionCmd, SessionContext};

/// An inbound session must bind and establish within this window
pub const ESTABLISH_TIMEOUT: Duration = Duration::from_secs(30);

/// Grace between a rejection and the BYE that closes the session, giving
/// the peer time to log the response
pub const REJECT_BYE_DELAY: Duration = Duration::from_secs(3);

/// Why a session left its main loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Close {
    /// Remote closed the UTP stream or sent BYE
    Remote,
    /// We rejected the peer
    Rejected,
    /// The peer rejected us
    RejectedByPeer,
    /// Never established in time
    Timeout,
    /// Framing or protocol violation, including decrypt failure
    Protocol,
    /// Session capacity exceeded for the connection
    Capacity,
    /// Asked to close from our side
    Bye,
}

pub(super) struct Session {
    pub id: Uuid,
    pub stream: UtpStream,
    pub cmd_rx: mpsc::Receiver<SessionCmd>,
    pub ctx: SessionContext,
    /// Bound connection full-name
    pub name: Option<String>,
    pub outbound: bool,
    pub encrypted: bool,
    verified: bool,
    accepted: bool,
    established: bool,
    bye_sent: bool,
    sent_connect_request: bool,
    framebuf: FrameBuffer,
}

impl Session {
    pub fn new(
        id: Uuid,
        stream: UtpStream,
        cmd_rx: mpsc::Receiver<SessionCmd>,
        ctx: SessionContext,
        name: Option<String>,
        outbound: bool,
    ) -> Self {
        Session {
            id,
            stream,
            cmd_rx,
            ctx,
            name,
            outbound,
            encrypted: false,
            verified: false,
            accepted: false,
            established: false,
            bye_sent: false,
            sent_connect_request: false,
            framebuf: FrameBuffer::new(),
        }
    }

    pub async fn run(mut self) {
        if self.outbound {
            let name = self.name.clone().unwrap_or_default();
            if let Some(Record::Client(record)) = self.ctx.connections.find(&name) {
                self.encrypted = record.encrypted;
            }
            self.ctx.crypter.create(self.id, &name);
            if self.send_connect_request().await.is_err() {
                self.finish(Close::Remote).await;
                return;
            }
        }

        let deadline = tokio::time::sleep(ESTABLISH_TIMEOUT);
        tokio::pin!(deadline);

        let reason = loop {
            enum Input {
                Chunk(Option<bytes::Bytes>),
                Cmd(Option<SessionCmd>),
                Deadline,
            }

            let waiting = !self.established;
            let input = tokio::select! {
                chunk = self.stream.recv() => Input::Chunk(chunk),
                cmd = self.cmd_rx.recv() => Input::Cmd(cmd),
                () = deadline.as_mut(), if waiting => Input::Deadline,
            };

            match input {
                Input::Chunk(Some(bytes)) => {
                    self.framebuf.extend(&bytes);
                    match self.pump_frames().await {
                        Ok(()) => {}
                        Err(reason) => break reason,
                    }
                }
                Input::Chunk(None) => break Close::Remote,
                Input::Cmd(Some(SessionCmd::SendInner(inner))) => {
                    if self.send_inner(&inner).await.is_err() {
                        break Close::Remote;
                    }
                }
                Input::Cmd(Some(SessionCmd::Bye)) | Input::Cmd(None) => break Close::Bye,
                Input::Deadline => {
                    tracing::debug!(
                        target: "peer",
                        "session {} not established within {:?}",
                        self.id,
                        ESTABLISH_TIMEOUT
                    );
                    break Close::Timeout;
                }
            }
        };

        self.finish(reason).await;
    }

    /// Decode and handle every complete frame buffered so far
    async fn pump_frames(&mut self) -> Result<(), Close> {
        loop {
            let frame = match self.framebuf.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(()),
                Err(e) => {
                    tracing::warn!(target: "peer", "session {}: bad frame: {}", self.id, e);
                    return Err(Close::Protocol);
                }
            };
            let outer = match OuterMessage::decode(&frame[..]) {
                Ok(outer) => outer,
                Err(e) => {
                    tracing::warn!(target: "peer", "session {}: undecodable frame: {}", self.id, e);
                    return Err(Close::Protocol);
                }
            };
            self.handle_outer(outer).await?;
        }
    }

    async fn handle_outer(&mut self, outer: OuterMessage) -> Result<(), Close> {
        match outer_message::Type::try_from(outer.r#type) {
            Ok(outer_message::Type::ConnectRequest) => {
                let Some(request) = outer.connect_request else {
                    return Err(Close::Protocol);
                };
                self.handle_connect_request(request).await
            }
            Ok(outer_message::Type::ConnectResponse) => {
                let Some(response) = outer.connect_response else {
                    return Err(Close::Protocol);
                };
                let accepted =
                    response.response == connect_response::Response::Accepted as i32;
                if !accepted {
                    tracing::info!(
                        target: "peer",
                        "session {} rejected by peer",
                        self.id
                    );
                    return Err(Close::RejectedByPeer);
                }
                self.accepted = true;
                self.try_establish().await
            }
            Ok(outer_message::Type::EncryptedMessage) => {
                let Some(sealed) = outer.encrypted_message else {
                    return Err(Close::Protocol);
                };
                if !self.established {
                    return Ok(());
                }
                let Some(plain) = self
                    .ctx
                    .crypter
                    .decrypt(self.id, &sealed.nonce, &sealed.payload)
                else {
                    tracing::warn!(target: "peer", "session {}: decrypt failed", self.id);
                    return Err(Close::Protocol);
                };
                self.handle_inner(&plain).await
            }
            Ok(outer_message::Type::Message) => {
                let Some(plain) = outer.message else {
                    return Err(Close::Protocol);
                };
                if !self.established {
                    return Ok(());
                }
                self.handle_inner(&plain.payload).await
            }
            Ok(outer_message::Type::Bye) => Err(Close::Remote),
            Err(_) => {
                tracing::warn!(
                    target: "peer",
                    "session {}: unknown outer type {}",
                    self.id,
                    outer.r#type
                );
                Err(Close::Protocol)
            }
        }
    }

    async fn handle_inner(&mut self, payload: &[u8]) -> Result<(), Close> {
        let inner = match InnerMessage::decode(payload) {
            Ok(inner) => inner,
            Err(e) => {
                tracing::warn!(target: "peer", "session {}: bad inner message: {}", self.id, e);
                return Err(Close::Protocol);
            }
        };
        let connection = self.name.clone().unwrap_or_default();
        let _ = self
            .ctx
            .events
            .send(PeerEvent::Inner {
                session_id: self.id,
                connection,
                message: inner,
            })
            .await;
        Ok(())
    }

    async fn handle_connect_request(&mut self, request: ConnectRequest) -> Result<(), Close> {
        // A bound session only accepts repeats for the same connection
        if let Some(bound) = &self.name {
            if *bound != request.connection_name {
                tracing::info!(
                    target: "connect-request",
                    "session {} bound to {} got request for {}",
                    self.id,
                    bound,
                    request.connection_name
                );
                return self.reject().await;
            }
        }

        let Some(record) = self.ctx.connections.find(&request.connection_name) else {
            tracing::info!(
                target: "connect-request",
                "unknown connection {}",
                request.connection_name
            );
            return self.reject().await;
        };

        if self.name.is_none() {
            self.name = Some(request.connection_name.clone());
            self.encrypted = match &record {
                Record::Server(c) => c.encrypted,
                Record::Client(c) => c.encrypted,
            };
            self.ctx.crypter.create(self.id, &request.connection_name);
            let mut sessions = self.ctx.sessions.lock().unwrap();
            if let Some(entry) = sessions.get_mut(&self.id) {
                entry.connection = Some(request.connection_name.clone());
            }
        }

        let (fixed, fixed_peers) = match &record {
            Record::Server(c) => (c.fixed, c.clients.clone()),
            Record::Client(c) => (c.fixed, vec![c.server.clone()]),
        };
        let allow_list = fixed.then_some(fixed_peers);

        let tracker_name = request
            .connection_name
            .split('#')
            .next()
            .unwrap_or_default()
            .to_string();
        let tracker = self.ctx.registry.tracker();
        let lookup_tracker = tracker_name.clone();
        let outcome = self
            .ctx
            .crypter
            .verify(
                self.id,
                &tracker_name,
                &request.identity,
                request.public_key.as_bytes(),
                &request.signature,
                fixed,
                allow_list.as_deref(),
                Some(move |identity: String| async move {
                    tracker.lookup_identity(&lookup_tracker, &identity).await
                }),
            )
            .await;

        if !outcome.verified {
            tracing::info!(
                target: "connect-request",
                "session {} failed verification for {}",
                self.id,
                request.connection_name
            );
            return self.reject().await;
        }

        if !self.ctx.crypter.set_peer_key(self.id, &request.public_key) {
            return self.reject().await;
        }

        tracing::debug!(
            target: "connect-request",
            "session {} verified peer {} on {}",
            self.id,
            outcome.name.as_deref().unwrap_or("?"),
            request.connection_name
        );

        self.send_outer(&OuterMessage::connect_response(true))
            .await
            .map_err(|_| Close::Remote)?;
        self.verified = true;

        // Mutual authentication: the accepting side identifies itself too
        if !self.sent_connect_request {
            self.send_connect_request().await.map_err(|_| Close::Remote)?;
        }

        self.try_establish().await
    }

    async fn try_establish(&mut self) -> Result<(), Close> {
        if self.established || !self.verified || !self.accepted {
            return Ok(());
        }

        let name = self.name.clone().unwrap_or_default();

        // A client-role connection keeps a single live session; the first
        // established one wins
        let client_role = matches!(self.ctx.connections.find(&name), Some(Record::Client(_)));
        {
            let mut sessions = self.ctx.sessions.lock().unwrap();
            if client_role {
                let occupied = sessions.iter().any(|(id, entry)| {
                    *id != self.id && entry.established && entry.connection.as_deref() == Some(&name)
                });
                if occupied {
                    tracing::info!(
                        target: "peer",
                        "session {}: {} already has a live session",
                        self.id,
                        name
                    );
                    return Err(Close::Capacity);
                }
            }
            if let Some(entry) = sessions.get_mut(&self.id) {
                entry.established = true;
            }
        }

        self.established = true;
        tracing::info!(target: "peer", "session {} established on {}", self.id, name);
        let _ = self
            .ctx
            .events
            .send(PeerEvent::Established {
                session_id: self.id,
                connection: name,
            })
            .await;
        Ok(())
    }

    async fn send_connect_request(&mut self) -> Result<(), ()> {
        let name = self.name.clone().unwrap_or_default();
        let Some(public_key) = self.ctx.crypter.session_public_key(self.id) else {
            return Err(());
        };
        let signature = self.ctx.crypter.sign(public_key.as_bytes());
        let request = ConnectRequest {
            connection_name: name,
            identity: self.ctx.crypter.identity().to_string(),
            public_key,
            signature,
            encrypted: self.encrypted,
        };
        self.sent_connect_request = true;
        self.send_outer(&OuterMessage::connect_request(request)).await
    }

    /// Send a REJECTED response, linger, and close with BYE
    async fn reject(&mut self) -> Result<(), Close> {
        let _ = self.send_outer(&OuterMessage::connect_response(false)).await;
        tokio::time::sleep(REJECT_BYE_DELAY).await;
        self.send_bye().await;
        Err(Close::Rejected)
    }

    async fn send_inner(&mut self, inner: &InnerMessage) -> Result<(), ()> {
        let payload = inner.encode_to_vec();
        let outer = if self.encrypted {
            let Some((nonce, ciphertext)) = self.ctx.crypter.encrypt(self.id, &payload) else {
                return Err(());
            };
            OuterMessage::encrypted(nonce, ciphertext)
        } else {
            OuterMessage::plain(payload)
        };
        self.send_outer(&outer).await
    }

    async fn send_outer(&self, outer: &OuterMessage) -> Result<(), ()> {
        self.stream
            .send(encode_frame(outer))
            .await
            .map_err(|_| ())
    }

    /// BYE is best-effort and idempotent
    async fn send_bye(&mut self) {
        if self.bye_sent {
            return;
        }
        self.bye_sent = true;
        let _ = self.send_outer(&OuterMessage::bye()).await;
    }

    async fn finish(mut self, reason: Close) {
        tracing::debug!(target: "peer", "session {} closing: {:?}", self.id, reason);

        if !matches!(reason, Close::Remote) {
            self.send_bye().await;
        }
        self.stream.close();
        self.ctx.crypter.destroy(self.id);

        let was_established = {
            let mut sessions = self.ctx.sessions.lock().unwrap();
            sessions.remove(&self.id);
            self.established
        };

        if was_established || self.name.is_some() {
            let _ = self
                .ctx
                .events
                .send(PeerEvent::Closed {
                    session_id: self.id,
                    connection: self.name.clone().unwrap_or_default(),
                    was_established,
                })
                .await;
        }
    }
}
