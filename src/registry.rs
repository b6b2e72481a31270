//! Central service registry
//!
//! Peer, Tracker, Front and Crypter all need lookups in each other. The
//! registry is populated once during startup, before any component task
//! runs; components keep an `Arc<Registry>` and resolve typed handles
//! lazily on first use instead of embedding one another.

use std::sync::{Arc, OnceLock};

use crate::config::Config;
use crate::connections::ConnectionsList;
use crate::crypto::Crypter;
use crate::front::Front;
use crate::peer::Peer;
use crate::tracker::TrackerHandle;

#[derive(Default)]
pub struct Registry {
    config: OnceLock<Arc<Config>>,
    crypter: OnceLock<Arc<Crypter>>,
    connections: OnceLock<Arc<ConnectionsList>>,
    peer: OnceLock<Arc<Peer>>,
    tracker: OnceLock<TrackerHandle>,
    front: OnceLock<Arc<Front>>,
}

impl Registry {
    pub fn new() -> Arc<Self> {
        Arc::new(Registry::default())
    }

    pub fn set_config(&self, config: Arc<Config>) {
        let _ = self.config.set(config);
    }

    pub fn set_crypter(&self, crypter: Arc<Crypter>) {
        let _ = self.crypter.set(crypter);
    }

    pub fn set_connections(&self, connections: Arc<ConnectionsList>) {
        let _ = self.connections.set(connections);
    }

    pub fn set_peer(&self, peer: Arc<Peer>) {
        let _ = self.peer.set(peer);
    }

    pub fn set_tracker(&self, tracker: TrackerHandle) {
        let _ = self.tracker.set(tracker);
    }

    pub fn set_front(&self, front: Arc<Front>) {
        let _ = self.front.set(front);
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.get().expect("registry: config set at startup").clone()
    }

    pub fn crypter(&self) -> Arc<Crypter> {
        self.crypter
            .get()
            .expect("registry: crypter set at startup")
            .clone()
    }

    pub fn connections(&self) -> Arc<ConnectionsList> {
        self.connections
            .get()
            .expect("registry: connections set at startup")
            .clone()
    }

    pub fn peer(&self) -> Arc<Peer> {
        self.peer.get().expect("registry: peer set at startup").clone()
    }

    pub fn tracker(&self) -> TrackerHandle {
        self.tracker
            .get()
            .expect("registry: tracker set at startup")
            .clone()
    }

    pub fn front(&self) -> Arc<Front> {
        self.front.get().expect("registry: front set at startup").clone()
    }
}
