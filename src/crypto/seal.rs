//! Per-session box encryption
//!
//! Tunnel payloads are sealed with a NaCl-style box: X25519 between the two
//! session keypairs, Blake2s over the raw shared secret as the symmetric
//! key, XChaCha20-Poly1305 with a random 24-byte nonce per message.

use blake2::{Blake2s256, Digest};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use x25519_dalek::{PublicKey, StaticSecret};

/// Key length for session keys (both directions)
pub const KEY_LEN: usize = 32;

/// Nonce length for sealed messages
pub const NONCE_LEN: usize = 24;

/// Generate a session keypair, returning (secret, public)
pub fn generate_keypair() -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
    let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let public = PublicKey::from(&secret);
    (secret.to_bytes(), public.to_bytes())
}

/// Precompute the shared key for a session
pub fn precompute(peer_public: &[u8; KEY_LEN], secret: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(*secret);
    let public = PublicKey::from(*peer_public);
    let shared = secret.diffie_hellman(&public);
    let digest = Blake2s256::digest(shared.as_bytes());
    digest.into()
}

/// Seal plaintext, returning (nonce, ciphertext)
pub fn seal(shared: &[u8; KEY_LEN], plaintext: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(shared));
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .ok()?;
    Some((nonce.to_vec(), ciphertext))
}

/// Open a sealed message
pub fn open(shared: &[u8; KEY_LEN], nonce: &[u8], ciphertext: &[u8]) -> Option<Vec<u8>> {
    if nonce.len() != NONCE_LEN {
        return None;
    }
    let cipher = XChaCha20Poly1305::new(Key::from_slice(shared));
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_key_agreement() {
        let (a_secret, a_public) = generate_keypair();
        let (b_secret, b_public) = generate_keypair();

        let a_shared = precompute(&b_public, &a_secret);
        let b_shared = precompute(&a_public, &b_secret);
        assert_eq!(a_shared, b_shared);
    }

    #[test]
    fn test_seal_open_round_trip() {
        let (a_secret, a_public) = generate_keypair();
        let (b_secret, b_public) = generate_keypair();

        let a_shared = precompute(&b_public, &a_secret);
        let b_shared = precompute(&a_public, &b_secret);

        let (nonce, ciphertext) = seal(&a_shared, b"tunnel bytes").unwrap();
        assert_eq!(nonce.len(), NONCE_LEN);
        let plaintext = open(&b_shared, &nonce, &ciphertext).unwrap();
        assert_eq!(plaintext, b"tunnel bytes");
    }

    #[test]
    fn test_open_rejects_tampering() {
        let (a_secret, _) = generate_keypair();
        let (_, b_public) = generate_keypair();
        let shared = precompute(&b_public, &a_secret);

        let (nonce, mut ciphertext) = seal(&shared, b"payload").unwrap();
        ciphertext[0] ^= 0xff;
        assert!(open(&shared, &nonce, &ciphertext).is_none());
    }

    #[test]
    fn test_open_rejects_wrong_key() {
        let (a_secret, _) = generate_keypair();
        let (_, b_public) = generate_keypair();
        let shared = precompute(&b_public, &a_secret);
        let (nonce, ciphertext) = seal(&shared, b"payload").unwrap();

        let (c_secret, _) = generate_keypair();
        let other = precompute(&b_public, &c_secret);
        assert!(open(&other, &nonce, &ciphertext).is_none());
    }

    #[test]
    fn test_open_rejects_bad_nonce_length(){
        let (a_secret, _) = generate_keypair();
        let (_, b_public) = generate_keypair();
        let shared = precompute(&b_public, &a_secret);
        let (_, ciphertext) = seal(&shared, b"payload").unwrap();
        assert!(open(&shared, &[0u8; 12], &ciphertext).is_none());
    }
}
