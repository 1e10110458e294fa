//! Key-based peer authentication.
//!
//! Two modes:
//!
//! - **Ephemeral**: a fresh ed25519 keypair per transport. Any peer with
//!   security enabled may join; links are still refused to peers without
//!   security.
//! - **Closed membership**: a persisted private key plus a directory of
//!   accepted public keys (`*.pub` files). Peers presenting any other key are
//!   refused during the handshake.
//!
//! Key files contain the 32 raw key bytes, hex-encoded.
//!
//! On a secured link both sides also send an ephemeral x25519 key, covered
//! by their handshake signature. The shared secret yields one AES-256-GCM key
//! per direction, and every frame after the handshake is sealed with it.

use crate::transport::WireError;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use subtle::ConstantTimeEq;
use tracing::{info, warn};
use x25519_dalek::{EphemeralSecret, PublicKey as ExchangePublicKey};

/// Extension of accepted public key files.
pub const PUBLIC_KEY_EXTENSION: &str = "pub";

/// Extension of private key files written by [`generate_key_files`].
pub const PRIVATE_KEY_EXTENSION: &str = "key";

/// Our signing identity and the set of peers we accept.
pub struct Identity {
    signing: SigningKey,
    /// `None` accepts any key (ephemeral mode).
    accepted: Option<Vec<[u8; 32]>>,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint())
            .field("accepted", &self.accepted.as_ref().map(Vec::len))
            .finish()
    }
}

impl Identity {
    /// A throwaway keypair that accepts any secured peer.
    pub fn ephemeral() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
            accepted: None,
        }
    }

    /// Load a persisted private key and the accepted public keys.
    ///
    /// Fails if the key cannot be read or if the public key directory is
    /// missing, unreadable or contains a malformed key.
    pub fn load(private_key: &Path, public_keys_dir: Option<&Path>) -> Result<Self, WireError> {
        let dir = public_keys_dir.ok_or_else(|| {
            WireError::Security("a private key requires a public keys directory".to_string())
        })?;
        if !dir.is_dir() {
            return Err(WireError::Security(format!(
                "public keys directory {} does not exist",
                dir.display()
            )));
        }

        let signing = SigningKey::from_bytes(&read_key_file(private_key)?);

        let mut accepted = Vec::new();
        let entries = std::fs::read_dir(dir).map_err(|e| {
            WireError::Security(format!("cannot read {}: {e}", dir.display()))
        })?;
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(PUBLIC_KEY_EXTENSION) {
                continue;
            }
            let bytes = read_key_file(&path)?;
            VerifyingKey::from_bytes(&bytes).map_err(|e| {
                WireError::Security(format!("invalid public key {}: {e}", path.display()))
            })?;
            accepted.push(bytes);
        }
        if accepted.is_empty() {
            warn!(dir = %dir.display(), "No public keys found, no peer will be accepted");
        }
        info!(
            fingerprint = %fingerprint(&signing.verifying_key()),
            accepted = accepted.len(),
            "Loaded security identity"
        );
        Ok(Self {
            signing,
            accepted: Some(accepted),
        })
    }

    /// Also accept the key in `path`. Ephemeral identities accept anyone already.
    pub fn accept_key_file(&mut self, path: &Path) -> Result<(), WireError> {
        let bytes = read_key_file(path)?;
        VerifyingKey::from_bytes(&bytes).map_err(|e| {
            WireError::Security(format!("invalid public key {}: {e}", path.display()))
        })?;
        if let Some(accepted) = &mut self.accepted {
            if !accepted.contains(&bytes) {
                accepted.push(bytes);
            }
        }
        Ok(())
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing.verifying_key().to_bytes())
    }

    /// Short stable id of our public key, for logs.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.signing.verifying_key())
    }

    /// Hex signature over `data`.
    pub fn sign(&self, data: &[u8]) -> String {
        hex::encode(self.signing.sign(data).to_bytes())
    }

    /// Check that `public_key_hex` is acceptable and signed `data`.
    pub fn verify_peer(
        &self,
        public_key_hex: &str,
        data: &[u8],
        signature_hex: &str,
    ) -> Result<(), WireError> {
        let key_bytes: [u8; 32] = decode_fixed(public_key_hex)
            .ok_or_else(|| WireError::AuthenticationFailed("malformed public key".into()))?;
        if let Some(accepted) = &self.accepted {
            let known = accepted
                .iter()
                .any(|k| bool::from(k[..].ct_eq(&key_bytes[..])));
            if !known {
                return Err(WireError::AuthenticationFailed(
                    "public key is not accepted".into(),
                ));
            }
        }
        let key = VerifyingKey::from_bytes(&key_bytes)
            .map_err(|e| WireError::AuthenticationFailed(format!("invalid public key: {e}")))?;
        let sig_bytes = hex::decode(signature_hex)
            .map_err(|_| WireError::AuthenticationFailed("malformed signature".into()))?;
        let signature = Signature::from_slice(&sig_bytes)
            .map_err(|_| WireError::AuthenticationFailed("malformed signature".into()))?;
        key.verify(data, &signature)
            .map_err(|_| WireError::AuthenticationFailed("bad signature".into()))
    }
}

/// Bytes signed during the handshake.
///
/// The initiator signs its own nonce. The responder signs the initiator's
/// nonce followed by its own, proving the acknowledgement is fresh. Both
/// sign the exchange key they sent.
pub fn handshake_payload(nonces: &[&str], node_id: &str, exchange_key: &str) -> Vec<u8> {
    let mut data = Vec::new();
    for nonce in nonces {
        data.extend_from_slice(nonce.as_bytes());
        data.push(b'|');
    }
    data.extend_from_slice(node_id.as_bytes());
    data.push(b'|');
    data.extend_from_slice(exchange_key.as_bytes());
    data
}

/// Which end of the link we are. Decides which derived key seals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// Our half of the per-link key agreement.
pub struct KeyExchange {
    secret: EphemeralSecret,
    public: ExchangePublicKey,
}

impl std::fmt::Debug for KeyExchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyExchange")
            .field("public", &self.public_key_hex())
            .finish()
    }
}

impl Default for KeyExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyExchange {
    pub fn new() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = ExchangePublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public.as_bytes())
    }

    /// Combine with the peer's exchange key into the link's frame ciphers.
    ///
    /// `transcript` must be identical on both ends; it binds the keys to
    /// this particular handshake.
    pub fn finish(
        self,
        peer_key_hex: &str,
        role: Role,
        transcript: &[u8],
    ) -> Result<Session, WireError> {
        let peer: [u8; 32] = decode_fixed(peer_key_hex)
            .ok_or_else(|| WireError::AuthenticationFailed("malformed exchange key".into()))?;
        let shared = self.secret.diffie_hellman(&ExchangePublicKey::from(peer));
        if !shared.was_contributory() {
            return Err(WireError::AuthenticationFailed(
                "degenerate exchange key".into(),
            ));
        }
        let forward = derive_key(shared.as_bytes(), transcript, b"initiator>responder");
        let backward = derive_key(shared.as_bytes(), transcript, b"responder>initiator");
        let (seal, open) = match role {
            Role::Initiator => (forward, backward),
            Role::Responder => (backward, forward),
        };
        Ok(Session {
            sealer: FrameSealer::new(&seal)?,
            opener: FrameOpener::new(&open)?,
        })
    }
}

fn derive_key(shared: &[u8], transcript: &[u8], direction: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(b"agentbus-link-v1|");
    hasher.update(direction);
    hasher.update(b"|");
    hasher.update(shared);
    hasher.update(transcript);
    hasher.finalize().into()
}

/// Frame ciphers of one secured link.
#[derive(Debug)]
pub struct Session {
    pub sealer: FrameSealer,
    pub opener: FrameOpener,
}

/// 96-bit GCM nonce from a frame counter. Each direction has its own key,
/// so a counter never repeats under one key.
fn frame_nonce(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

fn cipher(key: &[u8; 32]) -> Result<Aes256Gcm, WireError> {
    Aes256Gcm::new_from_slice(key)
        .map_err(|e| WireError::Security(format!("invalid session key: {e}")))
}

/// Encrypts outgoing frames.
pub struct FrameSealer {
    cipher: Aes256Gcm,
    counter: u64,
}

impl std::fmt::Debug for FrameSealer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameSealer")
            .field("counter", &self.counter)
            .finish()
    }
}

impl FrameSealer {
    fn new(key: &[u8; 32]) -> Result<Self, WireError> {
        Ok(Self {
            cipher: cipher(key)?,
            counter: 0,
        })
    }

    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, WireError> {
        let nonce = frame_nonce(self.counter);
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| WireError::Security("frame counter exhausted".into()))?;
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| WireError::Security("frame encryption failed".into()))
    }
}

/// Decrypts incoming frames, in order. A replayed, reordered or altered
/// frame fails authentication.
pub struct FrameOpener {
    cipher: Aes256Gcm,
    counter: u64,
}

impl std::fmt::Debug for FrameOpener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameOpener")
            .field("counter", &self.counter)
            .finish()
    }
}

impl FrameOpener {
    fn new(key: &[u8; 32]) -> Result<Self, WireError> {
        Ok(Self {
            cipher: cipher(key)?,
            counter: 0,
        })
    }

    pub fn open(&mut self, sealed: &[u8]) -> Result<Vec<u8>, WireError> {
        let nonce = frame_nonce(self.counter);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&nonce), sealed)
            .map_err(|_| WireError::AuthenticationFailed("frame failed authentication".into()))?;
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| WireError::Security("frame counter exhausted".into()))?;
        Ok(plaintext)
    }
}

/// Write a new keypair as `<dir>/<name>.key` and `<dir>/<name>.pub`.
pub fn generate_key_files(dir: &Path, name: &str) -> Result<(PathBuf, PathBuf), WireError> {
    std::fs::create_dir_all(dir)?;
    let signing = SigningKey::generate(&mut OsRng);
    let private_path = dir.join(format!("{name}.{PRIVATE_KEY_EXTENSION}"));
    let public_path = dir.join(format!("{name}.{PUBLIC_KEY_EXTENSION}"));
    std::fs::write(&private_path, hex::encode(signing.to_bytes()))?;
    std::fs::write(&public_path, hex::encode(signing.verifying_key().to_bytes()))?;
    Ok((private_path, public_path))
}

fn fingerprint(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.to_bytes());
    hex::encode(&digest[..8])
}

fn read_key_file(path: &Path) -> Result<[u8; 32], WireError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| WireError::Security(format!("cannot read key {}: {e}", path.display())))?;
    decode_fixed(text.trim())
        .ok_or_else(|| WireError::Security(format!("malformed key file {}", path.display())))
}

fn decode_fixed(hex_str: &str) -> Option<[u8; 32]> {
    hex::decode(hex_str).ok()?.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify_ephemeral() {
        let a = Identity::ephemeral();
        let b = Identity::ephemeral();
        let data = handshake_payload(&["n1"], "node-a", "kx");
        let sig = a.sign(&data);
        assert!(b.verify_peer(&a.public_key_hex(), &data, &sig).is_ok());
        let other = handshake_payload(&["n2"], "node-a", "kx");
        assert!(b.verify_peer(&a.public_key_hex(), &other, &sig).is_err());
        let swapped_key = handshake_payload(&["n1"], "node-a", "other");
        assert!(b.verify_peer(&a.public_key_hex(), &swapped_key, &sig).is_err());
    }

    fn linked_sessions() -> (Session, Session) {
        let initiator = KeyExchange::new();
        let responder = KeyExchange::new();
        let (i_pub, r_pub) = (initiator.public_key_hex(), responder.public_key_hex());
        let transcript = b"n1|n2|node-a|node-b";
        (
            initiator.finish(&r_pub, Role::Initiator, transcript).unwrap(),
            responder.finish(&i_pub, Role::Responder, transcript).unwrap(),
        )
    }

    #[test]
    fn test_sealed_frame_is_not_plain_json() {
        let (mut a, mut b) = linked_sessions();
        let msg = crate::message::WireMessage::notification(
            crate::message::WireNotification::Whisper {
                payload: b"secret plan".to_vec(),
            },
        );
        let json = serde_json::to_vec(&msg).unwrap();

        let sealed = a.sealer.seal(&json).unwrap();
        assert_ne!(sealed, json);
        assert!(crate::message::decode_message(&sealed).is_err());
        assert!(!sealed.windows(b"whisper".len()).any(|w| w == b"whisper"));

        let opened = b.opener.open(&sealed).unwrap();
        assert_eq!(opened, json);
        assert!(crate::message::decode_message(&opened).is_ok());

        // The other direction uses its own key.
        let reply = b.sealer.seal(b"ack").unwrap();
        assert_eq!(a.opener.open(&reply).unwrap(), b"ack");
    }

    #[test]
    fn test_replayed_or_altered_frames_fail() {
        let (mut a, mut b) = linked_sessions();
        let first = a.sealer.seal(b"one").unwrap();
        b.opener.open(&first).unwrap();
        assert!(matches!(
            b.opener.open(&first),
            Err(WireError::AuthenticationFailed(_))
        ));

        let mut second = a.sealer.seal(b"two").unwrap();
        second[0] ^= 0x01;
        assert!(b.opener.open(&second).is_err());
    }

    #[test]
    fn test_mismatched_transcript_cannot_open() {
        let initiator = KeyExchange::new();
        let responder = KeyExchange::new();
        let (i_pub, r_pub) = (initiator.public_key_hex(), responder.public_key_hex());
        let mut a = initiator.finish(&r_pub, Role::Initiator, b"one").unwrap();
        let mut b = responder.finish(&i_pub, Role::Responder, b"two").unwrap();
        let sealed = a.sealer.seal(b"hello").unwrap();
        assert!(b.opener.open(&sealed).is_err());
    }

    #[test]
    fn test_malformed_exchange_key_rejected() {
        let kx = KeyExchange::new();
        assert!(matches!(
            kx.finish("zz", Role::Initiator, b"t"),
            Err(WireError::AuthenticationFailed(_))
        ));
        let kx = KeyExchange::new();
        let zero = hex::encode([0u8; 32]);
        assert!(kx.finish(&zero, Role::Initiator, b"t").is_err());
    }

    #[test]
    fn test_closed_membership() {
        let dir = tempfile::tempdir().unwrap();
        let keys = dir.path().join("keys");
        let (a_key, _) = generate_key_files(&keys, "a").unwrap();
        let (b_key, _) = generate_key_files(&keys, "b").unwrap();
        let a = Identity::load(&a_key, Some(&keys)).unwrap();
        let b = Identity::load(&b_key, Some(&keys)).unwrap();
        let data = handshake_payload(&["n"], "x", "kx");
        assert!(b.verify_peer(&a.public_key_hex(), &data, &a.sign(&data)).is_ok());

        let stranger = Identity::ephemeral();
        let err = b
            .verify_peer(&stranger.public_key_hex(), &data, &stranger.sign(&data))
            .unwrap_err();
        assert!(matches!(err, WireError::AuthenticationFailed(_)));
    }

    #[test]
    fn test_missing_public_keys_dir_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (key, _) = generate_key_files(dir.path(), "a").unwrap();
        assert!(Identity::load(&key, None).is_err());
        assert!(Identity::load(&key, Some(&dir.path().join("nope"))).is_err());
    }

    #[test]
    fn test_malformed_public_key_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (key, _) = generate_key_files(dir.path(), "a").unwrap();
        std::fs::write(dir.path().join("bad.pub"), "zz").unwrap();
        assert!(Identity::load(&key, Some(dir.path())).is_err());
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let id = Identity::ephemeral();
        assert_eq!(id.fingerprint(), id.fingerprint());
        assert_eq!(id.fingerprint().len(), 16);
    }
}
