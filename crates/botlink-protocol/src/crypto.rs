/// Shared-key encryption for the secure channel.
///
/// The handshake derives one `SharedKey` per peer pair via X25519
/// Diffie-Hellman + HKDF-SHA256; envelope bodies are then sealed with
/// XChaCha20-Poly1305 under that key. Nonces are random 24-byte
/// extended nonces, safe to generate per message.
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::ProtocolError;

/// HKDF info string for domain separation.
const HKDF_INFO: &[u8] = b"botlink-channel-xchacha20poly1305-v1";

/// Symmetric key material derived during the handshake.
///
/// The sole input to the secure channel for a peer. Debug output is
/// redacted so key bytes never reach logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedKey([u8; 32]);

impl SharedKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SharedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SharedKey(..)")
    }
}

/// A sealed envelope body: ciphertext plus the nonce used to seal it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SealedBody {
    /// XChaCha20-Poly1305 ciphertext (includes 16-byte auth tag).
    pub ciphertext: Vec<u8>,
    /// 24-byte extended nonce.
    pub nonce: [u8; 24],
}

impl SealedBody {
    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        rmp_serde::to_vec(self).map_err(Into::into)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        rmp_serde::from_slice(data)
            .map_err(|e| ProtocolError::DecryptionFailed(format!("malformed sealed body: {e}")))
    }
}

/// Generate a fresh X25519 key pair for a handshake attempt.
pub fn generate_key_pair() -> (StaticSecret, PublicKey) {
    use chacha20poly1305::aead::rand_core::OsRng;

    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret, public)
}

/// Derive the channel key from our secret and the peer's public key.
///
/// DH is symmetric, so both sides of the handshake derive the same key.
pub fn derive_shared_key(local_secret: &StaticSecret, peer_public: &PublicKey) -> SharedKey {
    let dh = local_secret.diffie_hellman(peer_public);
    let hkdf = Hkdf::<Sha256>::new(None, dh.as_bytes());
    let mut key = [0u8; 32];
    hkdf.expand(HKDF_INFO, &mut key)
        .expect("HKDF-SHA256 expand to 32 bytes always succeeds");
    SharedKey(key)
}

/// Seal plaintext under a shared key with a fresh random nonce.
pub fn seal(key: &SharedKey, plaintext: &[u8]) -> Result<SealedBody, ProtocolError> {
    use chacha20poly1305::aead::rand_core::{OsRng, RngCore};

    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    let mut nonce_bytes = [0u8; 24];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from(nonce_bytes);

    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| ProtocolError::Crypto(format!("encryption failed: {e}")))?;

    Ok(SealedBody {
        ciphertext,
        nonce: nonce_bytes,
    })
}

/// Open a sealed body. Fails with `DecryptionFailed` on a mismatched
/// key or tampered ciphertext — the caller decides whether to drop the
/// connection or re-handshake.
pub fn open(key: &SharedKey, sealed: &SealedBody) -> Result<Vec<u8>, ProtocolError> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let nonce = XNonce::from(sealed.nonce);
    cipher
        .decrypt(&nonce, sealed.ciphertext.as_ref())
        .map_err(|_| ProtocolError::DecryptionFailed("authentication error".into()))
}

/// Random challenge bytes for the handshake probe.
pub fn probe_challenge() -> Vec<u8> {
    use chacha20poly1305::aead::rand_core::{OsRng, RngCore};

    let mut challenge = [0u8; 16];
    OsRng.fill_bytes(&mut challenge);
    challenge.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_pair_of(seed: u8) -> (StaticSecret, PublicKey) {
        let secret = StaticSecret::from([seed; 32]);
        let public = PublicKey::from(&secret);
        (secret, public)
    }

    #[test]
    fn dh_symmetry() {
        let (sk_a, pk_a) = key_pair_of(1);
        let (sk_b, pk_b) = key_pair_of(2);

        let key_ab = derive_shared_key(&sk_a, &pk_b);
        let key_ba = derive_shared_key(&sk_b, &pk_a);

        assert_eq!(key_ab, key_ba);
    }

    #[test]
    fn seal_open_roundtrip() {
        let (sk_a, _) = key_pair_of(1);
        let (_, pk_b) = key_pair_of(2);
        let key = derive_shared_key(&sk_a, &pk_b);

        let sealed = seal(&key, b"hello bots").unwrap();
        let opened = open(&key, &sealed).unwrap();

        assert_eq!(opened, b"hello bots");
    }

    #[test]
    fn open_with_mismatched_key_fails() {
        let (sk_a, pk_a) = key_pair_of(1);
        let (sk_b, _) = key_pair_of(2);
        let (sk_c, _) = key_pair_of(3);

        let key = derive_shared_key(&sk_a, &PublicKey::from(&sk_b));
        let wrong = derive_shared_key(&sk_c, &pk_a);

        let sealed = seal(&key, b"secret").unwrap();
        let result = open(&wrong, &sealed);
        assert!(matches!(result, Err(ProtocolError::DecryptionFailed(_))));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let (sk_a, _) = key_pair_of(1);
        let (_, pk_b) = key_pair_of(2);
        let key = derive_shared_key(&sk_a, &pk_b);

        let mut sealed = seal(&key, b"secret").unwrap();
        if let Some(byte) = sealed.ciphertext.first_mut() {
            *byte ^= 0xFF;
        }

        assert!(open(&key, &sealed).is_err());
    }

    #[test]
    fn tampered_nonce_fails() {
        let (sk_a, _) = key_pair_of(1);
        let (_, pk_b) = key_pair_of(2);
        let key = derive_shared_key(&sk_a, &pk_b);

        let mut sealed = seal(&key, b"secret").unwrap();
        sealed.nonce[0] ^= 0xFF;

        assert!(open(&key, &sealed).is_err());
    }

    #[test]
    fn different_seals_differ() {
        let (sk_a, _) = key_pair_of(1);
        let (_, pk_b) = key_pair_of(2);
        let key = derive_shared_key(&sk_a, &pk_b);

        let s1 = seal(&key, b"same message").unwrap();
        let s2 = seal(&key, b"same message").unwrap();

        assert_ne!(s1.nonce, s2.nonce);
        assert_ne!(s1.ciphertext, s2.ciphertext);
    }

    #[test]
    fn ciphertext_overhead_is_auth_tag() {
        let (sk_a, _) = key_pair_of(1);
        let (_, pk_b) = key_pair_of(2);
        let key = derive_shared_key(&sk_a, &pk_b);

        let plaintext = b"test payload";
        let sealed = seal(&key, plaintext).unwrap();
        assert_eq!(sealed.ciphertext.len(), plaintext.len() + 16);
    }

    #[test]
    fn sealed_body_msgpack_roundtrip() {
        let (sk_a, _) = key_pair_of(1);
        let (_, pk_b) = key_pair_of(2);
        let key = derive_shared_key(&sk_a, &pk_b);

        let sealed = seal(&key, b"roundtrip").unwrap();
        let bytes = sealed.to_bytes().unwrap();
        let decoded = SealedBody::from_bytes(&bytes).unwrap();
        assert_eq!(sealed, decoded);
    }

    #[test]
    fn malformed_sealed_body_rejected() {
        let result = SealedBody::from_bytes(b"not valid msgpack");
        assert!(matches!(result, Err(ProtocolError::DecryptionFailed(_))));
    }

    #[test]
    fn shared_key_debug_is_redacted() {
        let (sk_a, _) = key_pair_of(1);
        let (_, pk_b) = key_pair_of(2);
        let key = derive_shared_key(&sk_a, &pk_b);
        assert_eq!(format!("{key:?}"), "SharedKey(..)");
    }

    #[test]
    fn probe_challenges_are_random() {
        assert_ne!(probe_challenge(), probe_challenge());
    }
}
