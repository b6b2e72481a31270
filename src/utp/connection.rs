//! Per-connection UTP reliability
//!
//! Each live connection runs as one task owning the send window, the
//! reassembly buffer and the retransmission timer. Packets arrive routed
//! from the endpoint dispatcher; application bytes arrive through the
//! stream handle's write channel. Delivery to the read channel is strictly
//! in sequence order.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};

use crate::error::TransportError;

use super::packet::{seq_lte, Packet, PacketType, MAX_SEGMENT};

/// In-flight packet cap
pub const WINDOW_PACKETS: usize = 64;

/// Receive window advertised to the remote
pub const RECV_WINDOW: u32 = 256 * 1024;

/// Retransmission timeout bounds
const INITIAL_RTO: Duration = Duration::from_millis(500);
const MAX_RTO: Duration = Duration::from_secs(5);

/// Retransmissions of one packet before the connection is declared dead
const MAX_RETRANSMITS: u32 = 8;

/// Retransmission check cadence
const TICK: Duration = Duration::from_millis(100);

/// Which side of the handshake this connection is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Acceptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    SynSent,
    Connected,
    Closed,
}

enum Stashed {
    Data(Bytes),
    Fin,
}

struct Unacked {
    packet: Packet,
    sent_at: Instant,
    retransmits: u32,
}

pub type ConnTable = Arc<Mutex<HashMap<(SocketAddr, u16), mpsc::Sender<Packet>>>>;

pub struct Connection {
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    recv_id: u16,
    send_id: u16,
    role: Role,
    epoch: Instant,
    table: ConnTable,

    packet_rx: mpsc::Receiver<Packet>,
    write_rx: mpsc::Receiver<Bytes>,
    read_tx: Option<mpsc::Sender<Bytes>>,
    established_tx: Option<oneshot::Sender<Result<(), TransportError>>>,

    state: State,
    /// Next sequence number to stamp on DATA/FIN
    send_seq: u16,
    /// Next expected incoming sequence number
    expected: u16,
    /// Acceptor's handshake STATE sequence, re-sent on duplicate SYN
    handshake_seq: u16,

    unacked: VecDeque<Unacked>,
    unacked_bytes: usize,
    remote_wnd: u32,
    stash: HashMap<u16, Stashed>,

    write_closed: bool,
    fin_seq: Option<u16>,
    fin_acked: bool,
    remote_fin: bool,
    read_dropped: bool,
    last_remote_ts: u32,

    rto: Duration,
    srtt: Option<Duration>,
}

pub struct ConnectionParams {
    pub socket: Arc<UdpSocket>,
    pub remote: SocketAddr,
    pub recv_id: u16,
    pub send_id: u16,
    pub role: Role,
    pub epoch: Instant,
    pub table: ConnTable,
    pub packet_rx: mpsc::Receiver<Packet>,
    pub write_rx: mpsc::Receiver<Bytes>,
    pub read_tx: mpsc::Sender<Bytes>,
    /// Fired once the handshake completes; initiator only
    pub established_tx: Option<oneshot::Sender<Result<(), TransportError>>>,
    /// The SYN that opened this connection; acceptor only
    pub syn: Option<Packet>,
}

impl Connection {
    pub fn new(params: ConnectionParams) -> Self {
        let role = params.role;
        let mut conn = Connection {
            socket: params.socket,
            remote: params.remote,
            recv_id: params.recv_id,
            send_id: params.send_id,
            role,
            epoch: params.epoch,
            table: params.table,
            packet_rx: params.packet_rx,
            write_rx: params.write_rx,
            read_tx: Some(params.read_tx),
            established_tx: params.established_tx,
            state: State::SynSent,
            send_seq: 1,
            expected: 0,
            handshake_seq: 0,
            unacked: VecDeque::new(),
            unacked_bytes: 0,
            remote_wnd: RECV_WINDOW,
            stash: HashMap::new(),
            write_closed: false,
            fin_seq: None,
            fin_acked: false,
            remote_fin: false,
            read_dropped: false,
            last_remote_ts: 0,
            rto: INITIAL_RTO,
            srtt: None,
        };

        if role == Role::Acceptor {
            let syn = params.syn.expect("acceptor needs the opening SYN");
            conn.expected = syn.seq_nr.wrapping_add(1);
            conn.handshake_seq = rand::random();
            conn.send_seq = conn.handshake_seq.wrapping_add(1);
            conn.state = State::Connected;
            conn.last_remote_ts = syn.timestamp;
        }
        conn
    }

    pub async fn run(mut self) {
        match self.role {
            Role::Initiator => {
                // SYN consumes sequence 1 and retransmits like data
                let syn = Packet::new(PacketType::Syn, self.recv_id, 1, 0);
                self.send_seq = 2;
                self.push_unacked(syn).await;
            }
            Role::Acceptor => {
                self.send_handshake_state().await;
            }
        }

        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        while !self.finished() {
            enum Input {
                Packet(Option<Packet>),
                Write(Option<Bytes>),
                Tick,
            }

            let can_write = self.accepts_writes();
            let input = tokio::select! {
                maybe = self.packet_rx.recv() => Input::Packet(maybe),
                maybe = self.write_rx.recv(), if can_write => Input::Write(maybe),
                _ = tick.tick() => Input::Tick,
            };

            match input {
                Input::Packet(Some(packet)) => self.on_packet(packet).await,
                Input::Packet(None) => break,
                Input::Write(Some(data)) => self.queue_data(data).await,
                Input::Write(None) => {
                    self.write_closed = true;
                    self.maybe_send_fin().await;
                }
                Input::Tick => self.on_tick().await,
            }
        }

        self.table.lock().unwrap().remove(&(self.remote, self.recv_id));
    }

    fn finished(&self) -> bool {
        match self.state {
            State::Closed => true,
            _ => self.fin_acked && (self.remote_fin || self.read_dropped),
        }
    }

    fn accepts_writes(&self) -> bool {
        self.state == State::Connected
            && !self.write_closed
            && self.unacked.len() < WINDOW_PACKETS
            && (self.unacked_bytes as u32) < self.remote_wnd
    }

    async fn on_packet(&mut self, packet: Packet) {
        self.last_remote_ts = packet.timestamp;
        match packet.ty {
            PacketType::Syn => {
                // Duplicate SYN: the handshake STATE was lost
                if self.role == Role::Acceptor {
                    self.send_handshake_state().await;
                }
            }
            PacketType::State => {
                self.handle_ack(&packet);
                if self.state == State::SynSent {
                    self.expected = packet.seq_nr.wrapping_add(1);
                    self.state = State::Connected;
                    self.drain_stash().await;
                    if let Some(tx) = self.established_tx.take() {
                        let _ = tx.send(Ok(()));
                    }
                }
            }
            PacketType::Data => {
                self.handle_ack(&packet);
                self.handle_data(packet).await;
            }
            PacketType::Fin => {
                self.handle_ack(&packet);
                self.handle_fin(packet).await;
            }
            PacketType::Reset => {
                tracing::debug!(target: "utp", "connection to {} reset", self.remote);
                self.state = State::Closed;
                self.read_tx = None;
                if let Some(tx) = self.established_tx.take() {
                    let _ = tx.send(Err(TransportError::Reset));
                }
            }
        }
        // A pending close rides on the ack that just drained the window
        self.maybe_send_fin().await;
    }

    /// Drop acknowledged packets from the send window
    fn handle_ack(&mut self, packet: &Packet) {
        self.remote_wnd = packet.wnd_size;
        let ack = packet.ack_nr;
        while let Some(front) = self.unacked.front() {
            if !seq_lte(front.packet.seq_nr, ack) {
                break;
            }
            let acked = self.unacked.pop_front().unwrap();
            self.unacked_bytes -= acked.packet.payload.len();
            if acked.retransmits == 0 {
                self.update_rtt(acked.sent_at.elapsed());
            }
            if Some(acked.packet.seq_nr) == self.fin_seq {
                self.fin_acked = true;
            }
        }
    }

    fn update_rtt(&mut self, sample: Duration) {
        let srtt = match self.srtt {
            Some(srtt) => (srtt * 7 + sample) / 8,
            None => sample,
        };
        self.srtt = Some(srtt);
        self.rto = (srtt * 2).clamp(INITIAL_RTO, MAX_RTO);
    }

    async fn handle_data(&mut self, packet: Packet) {
        if self.state == State::SynSent {
            // Reordered ahead of the handshake STATE
            self.stash.insert(packet.seq_nr, Stashed::Data(packet.payload));
            return;
        }
        let seq = packet.seq_nr;
        if seq == self.expected {
            self.expected = self.expected.wrapping_add(1);
            self.deliver(packet.payload).await;
            self.drain_stash().await;
        } else if !seq_lte(seq, self.expected.wrapping_sub(1)) {
            self.stash.insert(seq, Stashed::Data(packet.payload));
        }
        self.send_ack().await;
    }

    async fn handle_fin(&mut self, packet: Packet) {
        if self.state == State::SynSent {
            self.stash.insert(packet.seq_nr, Stashed::Fin);
            return;
        }
        let seq = packet.seq_nr;
        if seq == self.expected {
            self.expected = self.expected.wrapping_add(1);
            self.on_remote_fin().await;
            self.drain_stash().await;
        } else if !seq_lte(seq, self.expected.wrapping_sub(1)) {
            self.stash.insert(seq, Stashed::Fin);
        }
        self.send_ack().await;
    }

    async fn on_remote_fin(&mut self) {
        self.remote_fin = true;
        self.read_tx = None;
        // Nothing more will be written our way; close our side too once
        // the application stops writing
        self.maybe_send_fin().await;
    }

    async fn drain_stash(&mut self) {
        loop {
            match self.stash.remove(&self.expected) {
                Some(Stashed::Data(payload)) => {
                    self.expected = self.expected.wrapping_add(1);
                    self.deliver(payload).await;
                }
                Some(Stashed::Fin) => {
                    self.expected = self.expected.wrapping_add(1);
                    self.on_remote_fin().await;
                }
                None => break,
            }
        }
    }

    async fn deliver(&mut self, payload: Bytes) {
        if payload.is_empty() {
            return;
        }
        if let Some(tx) = &self.read_tx {
            if tx.send(payload).await.is_err() {
                self.read_dropped = true;
                self.read_tx = None;
            }
        }
    }

    async fn queue_data(&mut self, data: Bytes) {
        let mut rest = data;
        while !rest.is_empty() {
            let take = rest.len().min(MAX_SEGMENT);
            let payload = rest.split_to(take);
            let seq = self.send_seq;
            self.send_seq = self.send_seq.wrapping_add(1);
            let mut packet = Packet::new(PacketType::Data, self.send_id, seq, 0);
            packet.payload = payload;
            self.push_unacked(packet).await;
        }
    }

    async fn maybe_send_fin(&mut self) {
        if self.write_closed
            && self.fin_seq.is_none()
            && self.unacked.is_empty()
            && self.state == State::Connected
        {
            let seq = self.send_seq;
            self.send_seq = self.send_seq.wrapping_add(1);
            self.fin_seq = Some(seq);
            let packet = Packet::new(PacketType::Fin, self.send_id, seq, 0);
            self.push_unacked(packet).await;
        }
    }

    async fn push_unacked(&mut self, packet: Packet) {
        self.unacked_bytes += packet.payload.len();
        self.transmit(&packet).await;
        self.unacked.push_back(Unacked {
            packet,
            sent_at: Instant::now(),
            retransmits: 0,
        });
    }

    async fn send_handshake_state(&mut self) {
        let packet = Packet::new(PacketType::State, self.send_id, self.handshake_seq, 0);
        self.transmit(&packet).await;
    }

    async fn send_ack(&mut self) {
        let packet = Packet::new(
            PacketType::State,
            self.send_id,
            self.send_seq.wrapping_sub(1),
            0,
        );
        self.transmit(&packet).await;
    }

    /// Stamp volatile header fields and put the packet on the wire
    async fn transmit(&self, packet: &Packet) {
        let mut packet = packet.clone();
        packet.timestamp = self.now_micros();
        packet.timestamp_diff = self.now_micros().wrapping_sub(self.last_remote_ts);
        packet.wnd_size = RECV_WINDOW;
        packet.ack_nr = self.expected.wrapping_sub(1);
        if let Err(e) = self.socket.send_to(&packet.encode(), self.remote).await {
            tracing::trace!(target: "utp", "send to {} failed: {}", self.remote, e);
        }
    }

    fn now_micros(&self) -> u32 {
        self.epoch.elapsed().as_micros() as u32
    }

    async fn on_tick(&mut self) {
        let Some(front) = self.unacked.front() else {
            return;
        };
        if front.sent_at.elapsed() < self.rto {
            return;
        }

        if front.retransmits >= MAX_RETRANSMITS {
            tracing::debug!(
                target: "utp",
                "connection to {} timed out after {} retransmits",
                self.remote,
                MAX_RETRANSMITS
            );
            let reset = Packet::new(PacketType::Reset, self.send_id, self.send_seq, 0);
            self.transmit(&reset).await;
            self.state = State::Closed;
            self.read_tx = None;
            if let Some(tx) = self.established_tx.take() {
                let _ = tx.send(Err(TransportError::HandshakeTimeout {
                    addr: self.remote.to_string(),
                }));
            }
            return;
        }

        // Go-back-N on the oldest outstanding packet only
        let packet = front.packet.clone();
        self.transmit(&packet).await;
        if let Some(front) = self.unacked.front_mut() {
            front.sent_at = Instant::now();
            front.retransmits += 1;
        }
        self.rto = (self.rto * 2).min(MAX_RTO);
    }
}
