//! Passphrase-sealed signaling.
//!
//! When the session carries a passphrase, SDP and ICE payloads relayed by the
//! broker travel as sealed envelopes. Key schedule:
//!
//! `session_key   = HKDF-SHA256(ikm = passphrase,   salt = session_id,   info = "beach-session")`
//! `handshake_key = HKDF-SHA256(ikm = session_key,  salt = handshake_id, info = "beach-handshake")`
//!
//! The handshake key seals broker-relayed payloads and later seeds the Noise
//! handshake as its PSK, so each negotiation attempt is keyed independently.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

pub const SEALED_ENVELOPE_VERSION: u32 = 1;

const SESSION_KEY_INFO: &[u8] = b"beach-session";
const HANDSHAKE_KEY_INFO: &[u8] = b"beach-handshake";
const LABEL_OFFER: &[u8] = b"offer";
const LABEL_ANSWER: &[u8] = b"answer";
const LABEL_ICE: &[u8] = b"ice";
const NONCE_LEN: usize = 12;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedEnvelope {
    pub version: u32,
    pub nonce: String,
    pub ciphertext: String,
}

#[derive(Debug, Clone, Copy)]
pub enum MessageLabel {
    Offer,
    Answer,
    Ice,
}

impl MessageLabel {
    fn as_bytes(self) -> &'static [u8] {
        match self {
            MessageLabel::Offer => LABEL_OFFER,
            MessageLabel::Answer => LABEL_ANSWER,
            MessageLabel::Ice => LABEL_ICE,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SealedEnvelopeError {
    #[error("unsupported sealed envelope version {0}")]
    Version(u32),
    #[error("invalid envelope encoding: {0}")]
    Encoding(&'static str),
    #[error("sealed envelope authentication failed")]
    Auth,
    #[error("key derivation failed")]
    Derive,
}

pub fn derive_session_key(
    passphrase: &str,
    session_id: &str,
) -> Result<[u8; 32], SealedEnvelopeError> {
    expand_key(session_id.as_bytes(), passphrase.as_bytes(), SESSION_KEY_INFO)
}

pub fn derive_handshake_key(
    session_key: &[u8; 32],
    handshake_id: &str,
) -> Result<[u8; 32], SealedEnvelopeError> {
    expand_key(handshake_id.as_bytes(), session_key, HANDSHAKE_KEY_INFO)
}

fn expand_key(salt: &[u8], ikm: &[u8], info: &[u8]) -> Result<[u8; 32], SealedEnvelopeError> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut key = [0u8; 32];
    hkdf.expand(info, &mut key)
        .map_err(|_| SealedEnvelopeError::Derive)?;
    Ok(key)
}

pub fn seal_message(
    key: &[u8; 32],
    label: MessageLabel,
    associated: &[&str],
    plaintext: &[u8],
) -> Result<SealedEnvelope, SealedEnvelopeError> {
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let cipher = ChaCha20Poly1305::new(key.into());
    let aad = build_aad(label, associated);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: plaintext,
                aad: &aad,
            },
        )
        .map_err(|_| SealedEnvelopeError::Auth)?;
    Ok(SealedEnvelope {
        version: SEALED_ENVELOPE_VERSION,
        nonce: BASE64_STANDARD.encode(nonce_bytes),
        ciphertext: BASE64_STANDARD.encode(ciphertext),
    })
}

pub fn open_message(
    key: &[u8; 32],
    label: MessageLabel,
    associated: &[&str],
    envelope: &SealedEnvelope,
) -> Result<Vec<u8>, SealedEnvelopeError> {
    if envelope.version != SEALED_ENVELOPE_VERSION {
        return Err(SealedEnvelopeError::Version(envelope.version));
    }
    let nonce_bytes = BASE64_STANDARD
        .decode(envelope.nonce.as_bytes())
        .map_err(|_| SealedEnvelopeError::Encoding("nonce"))?;
    if nonce_bytes.len() != NONCE_LEN {
        return Err(SealedEnvelopeError::Encoding("nonce length"));
    }
    let ciphertext = BASE64_STANDARD
        .decode(envelope.ciphertext.as_bytes())
        .map_err(|_| SealedEnvelopeError::Encoding("ciphertext"))?;
    let cipher = ChaCha20Poly1305::new(key.into());
    let aad = build_aad(label, associated);
    cipher
        .decrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: &ciphertext,
                aad: &aad,
            },
        )
        .map_err(|_| SealedEnvelopeError::Auth)
}

fn build_aad(label: MessageLabel, associated: &[&str]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(64);
    aad.extend_from_slice(label.as_bytes());
    for component in associated {
        aad.push(0x1f);
        aad.extend_from_slice(component.as_bytes());
    }
    aad
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_schedule_is_deterministic() {
        let a = derive_session_key("surfs up", "session-1").expect("derive");
        let b = derive_session_key("surfs up", "session-1").expect("derive");
        assert_eq!(a, b);

        let h1 = derive_handshake_key(&a, "hs-1").expect("derive");
        let h2 = derive_handshake_key(&b, "hs-1").expect("derive");
        assert_eq!(h1, h2);
    }

    #[test]
    fn handshake_ids_decorrelate_keys() {
        let session = derive_session_key("surfs up", "session-1").expect("derive");
        let h1 = derive_handshake_key(&session, "hs-1").expect("derive");
        let h2 = derive_handshake_key(&session, "hs-2").expect("derive");
        assert_ne!(h1, h2);
    }

    #[test]
    fn seal_open_round_trip() {
        let key = derive_session_key("pass", "sess").expect("derive");
        let associated = ["peer-a", "peer-b", "offer"];
        let envelope =
            seal_message(&key, MessageLabel::Offer, &associated, b"v=0 sdp").expect("seal");
        let plain =
            open_message(&key, MessageLabel::Offer, &associated, &envelope).expect("open");
        assert_eq!(plain, b"v=0 sdp");
    }

    #[test]
    fn wrong_label_or_aad_fails() {
        let key = derive_session_key("pass", "sess").expect("derive");
        let associated = ["peer-a", "peer-b", "offer"];
        let envelope =
            seal_message(&key, MessageLabel::Offer, &associated, b"payload").expect("seal");
        assert_eq!(
            open_message(&key, MessageLabel::Answer, &associated, &envelope),
            Err(SealedEnvelopeError::Auth)
        );
        assert_eq!(
            open_message(&key, MessageLabel::Offer, &["peer-a", "peer-x", "offer"], &envelope),
            Err(SealedEnvelopeError::Auth)
        );
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let key = [0u8; 32];
        let envelope = SealedEnvelope {
            version: 9,
            nonce: BASE64_STANDARD.encode([0u8; 12]),
            ciphertext: BASE64_STANDARD.encode([0u8; 16]),
        };
        assert_eq!(
            open_message(&key, MessageLabel::Ice, &[], &envelope),
            Err(SealedEnvelopeError::Version(9))
        );
    }
}
