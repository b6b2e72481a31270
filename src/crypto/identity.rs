//! RSA identity
//!
//! Every daemon carries an RSA keypair generated externally by `openssl`.
//! The identity fingerprint is the hex SHA-256 of the base64 of the public
//! key file; signatures are PKCS#1 v1.5 over SHA-256 of the hex digest of
//! the signed bytes.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::{RsaPrivateKey, RsaPublicKey};
use signature::{SignatureEncoding, Signer, Verifier};
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::error::CryptoError;

/// Loaded RSA keypair plus derived fingerprint
pub struct Identity {
    signing_key: SigningKey<Sha256>,
    public_pem: String,
    fingerprint: String,
}

impl Identity {
    /// Load the keypair from PEM files, as written by `openssl`
    pub fn load(public_path: &Path, private_path: &Path) -> Result<Self, CryptoError> {
        let public_pem =
            std::fs::read_to_string(public_path).map_err(|e| CryptoError::KeyLoad {
                path: public_path.display().to_string(),
                reason: e.to_string(),
            })?;
        let private_pem =
            std::fs::read_to_string(private_path).map_err(|e| CryptoError::KeyLoad {
                path: private_path.display().to_string(),
                reason: e.to_string(),
            })?;

        // openssl emits PKCS#1 ("BEGIN RSA ...") or PKCS#8 depending on age
        let private_key = RsaPrivateKey::from_pkcs1_pem(&private_pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(&private_pem))
            .map_err(|e| CryptoError::KeyLoad {
                path: private_path.display().to_string(),
                reason: e.to_string(),
            })?;
        // The public file is only validated here; the fingerprint and wire
        // form use its exact text
        parse_public_pem(&public_pem).ok_or_else(|| CryptoError::KeyLoad {
            path: public_path.display().to_string(),
            reason: "not an RSA public key".to_string(),
        })?;

        let fingerprint = fingerprint_of(&public_pem);
        Ok(Identity {
            signing_key: SigningKey::new(private_key),
            public_pem,
            fingerprint,
        })
    }

    /// hex SHA-256 over base64 of the public key file
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Exact public key PEM text, sent to trackers on registration
    pub fn public_pem(&self) -> &str {
        &self.public_pem
    }

    /// Sign bytes, returning the base64 signature
    pub fn sign(&self, data: &[u8]) -> String {
        let digest = hex_digest(data);
        let signature = self.signing_key.sign(digest.as_bytes());
        BASE64.encode(signature.to_bytes())
    }
}

/// Identity fingerprint of a public key PEM text
pub fn fingerprint_of(key_text: &str) -> String {
    let encoded = BASE64.encode(key_text.as_bytes());
    hex::encode(Sha256::digest(encoded.as_bytes()))
}

/// hex SHA-256 of bytes, the canonical signing input
pub fn hex_digest(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Verify a base64 signature over bytes against a public key PEM
pub fn verify_with(key_text: &str, data: &[u8], signature_b64: &str) -> bool {
    let Some(public_key) = parse_public_pem(key_text) else {
        return false;
    };
    let Ok(raw) = BASE64.decode(signature_b64) else {
        return false;
    };
    let Ok(signature) = Signature::try_from(raw.as_slice()) else {
        return false;
    };
    let digest = hex_digest(data);
    VerifyingKey::<Sha256>::new(public_key)
        .verify(digest.as_bytes(), &signature)
        .is_ok()
}

fn parse_public_pem(key_text: &str) -> Option<RsaPublicKey> {
    RsaPublicKey::from_pkcs1_pem(key_text)
        .or_else(|_| RsaPublicKey::from_public_key_pem(key_text))
        .ok()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use rsa::pkcs1::EncodeRsaPrivateKey;
    use rsa::pkcs8::EncodePublicKey;
    use rsa::pkcs8::LineEnding;

    /// Generate a keypair on disk, returning the Identity and the PEM text
    pub(crate) fn test_identity(dir: &Path) -> (Identity, String) {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public_key = RsaPublicKey::from(&private_key);

        let private_pem = private_key.to_pkcs1_pem(LineEnding::LF).unwrap();
        let public_pem = public_key.to_public_key_pem(LineEnding::LF).unwrap();

        let private_path = dir.join("private.rsa");
        let public_path = dir.join("public.rsa");
        std::fs::write(&private_path, private_pem.as_bytes()).unwrap();
        std::fs::write(&public_path, public_pem.as_bytes()).unwrap();

        let identity = Identity::load(&public_path, &private_path).unwrap();
        (identity, public_pem)
    }

    #[test]
    fn test_fingerprint_matches_key_text() {
        let dir = tempfile::tempdir().unwrap();
        let (identity, public_pem) = test_identity(dir.path());
        assert_eq!(identity.fingerprint(), fingerprint_of(&public_pem));
        assert_eq!(identity.fingerprint().len(), 64);
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (identity, public_pem) = test_identity(dir.path());

        let signature = identity.sign(b"session public key");
        assert!(verify_with(&public_pem, b"session public key", &signature));
        assert!(!verify_with(&public_pem, b"different bytes", &signature));
        assert!(!verify_with(&public_pem, b"session public key", "bm90IGEgc2ln"));
    }

    #[test]
    fn test_verify_rejects_wrong_key() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let (identity, _) = test_identity(dir_a.path());
        let (_, other_pem) = test_identity(dir_b.path());

        let signature = identity.sign(b"payload");
        assert!(!verify_with(&other_pem, b"payload", &signature));
    }

    #[test]
    fn test_load_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let result = Identity::load(&dir.path().join("public.rsa"), &dir.path().join("private.rsa"));
        assert!(matches!(result, Err(CryptoError::KeyLoad { .. })));
    }
}
