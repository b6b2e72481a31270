//! Crypter
//!
//! Owns the daemon's RSA identity and one box session per peer session:
//! key generation, signing and verification of session keys, sealing of
//! tunnel payloads, and the on-disk peer key cache with its fixed-peer
//! protection rules. Failures surface as sentinels, never panics; the peer
//! read loop treats a `None` from `decrypt` as a session-fatal event.

pub mod identity;
pub mod seal;

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use uuid::Uuid;

use crate::config::write_atomic;
use identity::Identity;

/// Bound on a peer identity lookup round-trip
pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// One box session, paired with a peer session of the same id
pub struct CrypterSession {
    pub connection: String,
    public_key: [u8; seal::KEY_LEN],
    secret_key: [u8; seal::KEY_LEN],
    peer_key: Option<[u8; seal::KEY_LEN]>,
    shared: Option<[u8; seal::KEY_LEN]>,
    pub peer_name: Option<String>,
}

/// Outcome of a peer verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyOutcome {
    pub verified: bool,
    /// Peer full name once resolved, stripped of any tracker prefix
    pub name: Option<String>,
}

impl VerifyOutcome {
    fn failed() -> Self {
        VerifyOutcome {
            verified: false,
            name: None,
        }
    }
}

pub struct Crypter {
    identity: Identity,
    peers_dir: PathBuf,
    sessions: Mutex<HashMap<Uuid, CrypterSession>>,
}

impl Crypter {
    pub fn new(identity: Identity, peers_dir: PathBuf) -> Self {
        Crypter {
            identity,
            peers_dir,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn identity(&self) -> &str {
        self.identity.fingerprint()
    }

    pub fn public_pem(&self) -> &str {
        self.identity.public_pem()
    }

    /// Sign bytes with the daemon RSA key, returning base64
    pub fn sign(&self, data: &[u8]) -> String {
        self.identity.sign(data)
    }

    /// Allocate a fresh box keypair for a peer session
    pub fn create(&self, session_id: Uuid, connection: &str) -> bool {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.contains_key(&session_id) {
            return false;
        }
        let (secret_key, public_key) = seal::generate_keypair();
        sessions.insert(
            session_id,
            CrypterSession {
                connection: connection.to_string(),
                public_key,
                secret_key,
                peer_key: None,
                shared: None,
                peer_name: None,
            },
        );
        true
    }

    /// Drop a session; idempotent
    pub fn destroy(&self, session_id: Uuid) {
        self.sessions.lock().unwrap().remove(&session_id);
    }

    /// base64 of the session public key, as carried in ConnectRequest
    pub fn session_public_key(&self, session_id: Uuid) -> Option<String> {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .get(&session_id)
            .map(|s| BASE64.encode(s.public_key))
    }

    /// Store the peer's box public key received in its ConnectRequest
    pub fn set_peer_key(&self, session_id: Uuid, key_b64: &str) -> bool {
        let Ok(raw) = BASE64.decode(key_b64) else {
            return false;
        };
        let Ok(key) = <[u8; seal::KEY_LEN]>::try_from(raw.as_slice()) else {
            return false;
        };
        let mut sessions = self.sessions.lock().unwrap();
        let Some(session) = sessions.get_mut(&session_id) else {
            return false;
        };
        session.peer_key = Some(key);
        session.shared = None;
        true
    }

    pub fn peer_name(&self, session_id: Uuid) -> Option<String> {
        let sessions = self.sessions.lock().unwrap();
        sessions.get(&session_id)?.peer_name.clone()
    }

    pub fn has_peer_key(&self, session_id: Uuid) -> bool {
        let sessions = self.sessions.lock().unwrap();
        sessions
            .get(&session_id)
            .map(|s| s.peer_key.is_some())
            .unwrap_or(false)
    }

    /// Seal a payload for the session, returning (nonce, ciphertext)
    pub fn encrypt(&self, session_id: Uuid, plaintext: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        let shared = self.shared_key(session_id)?;
        seal::seal(&shared, plaintext)
    }

    /// Open a sealed payload for the session
    pub fn decrypt(&self, session_id: Uuid, nonce: &[u8], ciphertext: &[u8]) -> Option<Vec<u8>> {
        let shared = self.shared_key(session_id)?;
        seal::open(&shared, nonce, ciphertext)
    }

    fn shared_key(&self, session_id: Uuid) -> Option<[u8; seal::KEY_LEN]> {
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions.get_mut(&session_id)?;
        if session.shared.is_none() {
            let peer_key = session.peer_key?;
            session.shared = Some(seal::precompute(&peer_key, &session.secret_key));
        }
        session.shared
    }

    /// Verify a peer's signature over its session key, resolving the peer's
    /// RSA key through the disk cache and, when warranted, a tracker lookup.
    ///
    /// `fixed_peers` carries the connection allow-list when the connection is
    /// fixed. `lookup` resolves an identity to `(name, key_pem)` via the
    /// tracker; it is skipped when `strict` and the cache already answers.
    pub async fn verify<F, Fut>(
        &self,
        session_id: Uuid,
        tracker: &str,
        peer_identity: &str,
        data: &[u8],
        signature: &str,
        strict: bool,
        fixed_peers: Option<&[String]>,
        lookup: Option<F>,
    ) -> VerifyOutcome
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Option<(String, String)>>,
    {
        let cached = self.cached_peer(tracker, peer_identity);

        // The cache answers when its key checks the signature; a miss or a
        // stale key falls through to a tracker lookup
        let cache_good = cached
            .as_ref()
            .map(|(_, key)| identity::verify_with(key, data, signature))
            .unwrap_or(false);

        let resolved = if cache_good {
            cached.clone()
        } else if strict && cached.is_some() {
            // Strict mode never replaces a cached peer
            cached.clone()
        } else if let Some(lookup) = lookup {
            let answer = tokio::time::timeout(LOOKUP_TIMEOUT, lookup(peer_identity.to_string()))
                .await
                .ok()
                .flatten();
            match answer {
                Some((name, key)) => {
                    let differs = cached
                        .as_ref()
                        .map(|(cn, ck)| *cn != name || *ck != key)
                        .unwrap_or(true);
                    if differs {
                        // A fixed connection pins its listed peers: a tracker
                        // answer displacing one is treated as a forgery
                        if let (Some(peers), Some((cached_name, _))) =
                            (fixed_peers, cached.as_ref())
                        {
                            if contains_peer(peers, cached_name) {
                                tracing::info!(
                                    target: "crypter",
                                    "rejecting identity lookup for {}: cached fixed peer {} would be replaced",
                                    peer_identity,
                                    cached_name
                                );
                                return VerifyOutcome::failed();
                            }
                        }
                        self.cache_store(tracker, &name, &key);
                    }
                    Some((name, key))
                }
                None => None,
            }
        } else {
            None
        };

        let Some((name, key)) = resolved else {
            return VerifyOutcome::failed();
        };
        let name = strip_tracker(&name).to_string();

        if !identity::verify_with(&key, data, signature) {
            tracing::info!(target: "crypter", "signature check failed for peer {}", name);
            return VerifyOutcome::failed();
        }

        // Fixed connections only admit listed peers, valid signature or not
        if let Some(peers) = fixed_peers {
            if !contains_peer(peers, &name) {
                tracing::info!(
                    target: "crypter",
                    "peer {} is not in the fixed allow-list",
                    name
                );
                return VerifyOutcome::failed();
            }
        }

        let mut sessions = self.sessions.lock().unwrap();
        if let Some(session) = sessions.get_mut(&session_id) {
            session.peer_name = Some(name.clone());
        }

        VerifyOutcome {
            verified: true,
            name: Some(name),
        }
    }

    /// Find a cached peer key for an identity fingerprint
    fn cached_peer(&self, tracker: &str, peer_identity: &str) -> Option<(String, String)> {
        let dir = self.peers_dir.join(tracker);
        let entries = std::fs::read_dir(&dir).ok()?;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().map(|e| e != "rsa").unwrap_or(true) {
                continue;
            }
            let Ok(contents) = std::fs::read_to_string(&path) else {
                continue;
            };
            if identity::fingerprint_of(&contents) == peer_identity {
                let name = path
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                return Some((name, contents));
            }
        }
        None
    }

    /// Write a peer key into the cache
    fn cache_store(&self, tracker: &str, name: &str, key: &str) {
        let dir = self.peers_dir.join(tracker);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::warn!(target: "crypter", "cannot create {}: {}", dir.display(), e);
            return;
        }
        let file = dir.join(format!("{}.rsa", name.replace('/', "_")));
        if let Err(e) = write_atomic(&file, key.as_bytes(), 0o644) {
            tracing::warn!(target: "crypter", "cannot write {}: {}", file.display(), e);
        }
    }
}

/// Strip a `tracker#` prefix from a peer name
fn strip_tracker(name: &str) -> &str {
    name.split_once('#').map(|(_, rest)| rest).unwrap_or(name)
}

fn contains_peer(peers: &[String], name: &str) -> bool {
    peers.iter().any(|p| strip_tracker(p) == strip_tracker(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use identity::tests::test_identity;

    struct Peers {
        _dirs: Vec<tempfile::TempDir>,
        crypter: Crypter,
        peer_identity: Identity,
        peer_pem: String,
    }

    fn setup() -> Peers {
        let own_dir = tempfile::tempdir().unwrap();
        let peer_dir = tempfile::tempdir().unwrap();
        let cache_dir = tempfile::tempdir().unwrap();

        let (own, _) = test_identity(own_dir.path());
        let (peer_identity, peer_pem) = test_identity(peer_dir.path());
        let crypter = Crypter::new(own, cache_dir.path().to_path_buf());
        Peers {
            _dirs: vec![own_dir, peer_dir, cache_dir],
            crypter,
            peer_identity,
            peer_pem,
        }
    }

    /// Lookup stub for call sites that must resolve from the cache alone
    fn no_lookup() -> Option<fn(String) -> std::future::Ready<Option<(String, String)>>> {
        None
    }

    #[test]
    fn test_create_destroy() {
        let p = setup();
        let id = Uuid::new_v4();
        assert!(p.crypter.create(id, "t1#user@example.com/svc"));
        assert!(!p.crypter.create(id, "t1#user@example.com/svc"));
        assert!(p.crypter.session_public_key(id).is_some());
        p.crypter.destroy(id);
        p.crypter.destroy(id);
        assert!(p.crypter.session_public_key(id).is_none());
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let p = setup();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        p.crypter.create(a, "conn");
        p.crypter.create(b, "conn");

        let a_pub = p.crypter.session_public_key(a).unwrap();
        let b_pub = p.crypter.session_public_key(b).unwrap();
        assert!(p.crypter.set_peer_key(a, &b_pub));
        assert!(p.crypter.set_peer_key(b, &a_pub));

        let (nonce, ciphertext) = p.crypter.encrypt(a, b"ping").unwrap();
        assert_eq!(p.crypter.decrypt(b, &nonce, &ciphertext).unwrap(), b"ping");

        // Tampering is a sentinel, not a panic
        assert!(p.crypter.decrypt(b, &nonce, b"garbage").is_none());
    }

    #[test]
    fn test_encrypt_without_peer_key() {
        let p = setup();
        let id = Uuid::new_v4();
        p.crypter.create(id, "conn");
        assert!(p.crypter.encrypt(id, b"data").is_none());
    }

    #[tokio::test]
    async fn test_verify_from_cache() {
        let p = setup();
        let id = Uuid::new_v4();
        p.crypter.create(id, "conn");
        p.crypter.cache_store("t1", "user?peer", &p.peer_pem);

        let fingerprint = identity::fingerprint_of(&p.peer_pem);
        let signature = p.peer_identity.sign(b"session key");

        let outcome = p
            .crypter
            .verify(
                id,
                "t1",
                &fingerprint,
                b"session key",
                &signature,
                true,
                None,
                no_lookup(),
            )
            .await;
        assert!(outcome.verified);
        assert_eq!(outcome.name.as_deref(), Some("user?peer"));
        assert_eq!(p.crypter.peer_name(id).as_deref(), Some("user?peer"));
    }

    #[tokio::test]
    async fn test_verify_unknown_peer_without_lookup() {
        let p = setup();
        let id = Uuid::new_v4();
        p.crypter.create(id, "conn");

        let fingerprint = identity::fingerprint_of(&p.peer_pem);
        let signature = p.peer_identity.sign(b"session key");
        let outcome = p
            .crypter
            .verify(
                id,
                "t1",
                &fingerprint,
                b"session key",
                &signature,
                true,
                None,
                no_lookup(),
            )
            .await;
        assert!(!outcome.verified);
    }

    #[tokio::test]
    async fn test_verify_resolves_via_lookup_and_caches() {
        let p = setup();
        let id = Uuid::new_v4();
        p.crypter.create(id, "conn");

        let fingerprint = identity::fingerprint_of(&p.peer_pem);
        let signature = p.peer_identity.sign(b"session key");
        let pem = p.peer_pem.clone();

        let outcome = p
            .crypter
            .verify(
                id,
                "t1",
                &fingerprint,
                b"session key",
                &signature,
                false,
                None,
                Some(move |_identity: String| {
                    std::future::ready(Some(("user?peer".to_string(), pem)))
                }),
            )
            .await;
        assert!(outcome.verified);

        // Second verification answers from the cache alone
        let signature = p.peer_identity.sign(b"again");
        let outcome = p
            .crypter
            .verify(
                id,
                "t1",
                &fingerprint,
                b"again",
                &signature,
                true,
                None,
                no_lookup(),
            )
            .await;
        assert!(outcome.verified);
    }

    #[tokio::test]
    async fn test_fixed_rejects_unlisted_peer() {
        let p = setup();
        let id = Uuid::new_v4();
        p.crypter.create(id, "conn");
        p.crypter.cache_store("t1", "user?peer", &p.peer_pem);

        let fingerprint = identity::fingerprint_of(&p.peer_pem);
        let signature = p.peer_identity.sign(b"session key");
        let allowed = vec!["user?other".to_string()];

        let outcome = p
            .crypter
            .verify(
                id,
                "t1",
                &fingerprint,
                b"session key",
                &signature,
                true,
                Some(&allowed),
                no_lookup(),
            )
            .await;
        assert!(!outcome.verified);
    }

    #[tokio::test]
    async fn test_fixed_accepts_listed_peer_with_tracker_prefix() {
        let p = setup();
        let id = Uuid::new_v4();
        p.crypter.create(id, "conn");
        p.crypter.cache_store("t1", "user?peer", &p.peer_pem);

        let fingerprint = identity::fingerprint_of(&p.peer_pem);
        let signature = p.peer_identity.sign(b"session key");
        let allowed = vec!["t1#user?peer".to_string()];

        let outcome = p
            .crypter
            .verify(
                id,
                "t1",
                &fingerprint,
                b"session key",
                &signature,
                true,
                Some(&allowed),
                no_lookup(),
            )
            .await;
        assert!(outcome.verified);
    }

    #[tokio::test]
    async fn test_fixed_blocks_lookup_displacing_cached_peer() {
        let p = setup();
        let id = Uuid::new_v4();
        p.crypter.create(id, "conn");
        p.crypter.cache_store("t1", "user?peer", &p.peer_pem);

        // An attacker-signed handshake with a tracker answer that would
        // displace the pinned peer under the same identity
        let attacker_dir = tempfile::tempdir().unwrap();
        let (attacker, attacker_pem) = test_identity(attacker_dir.path());
        let fingerprint = identity::fingerprint_of(&p.peer_pem);
        let signature = attacker.sign(b"session key");
        let allowed = vec!["user?peer".to_string()];

        let outcome = p
            .crypter
            .verify(
                id,
                "t1",
                &fingerprint,
                b"session key",
                &signature,
                false,
                Some(&allowed),
                Some(move |_identity: String| {
                    std::future::ready(Some(("user?attacker".to_string(), attacker_pem)))
                }),
            )
            .await;
        assert!(!outcome.verified);
    }
}
