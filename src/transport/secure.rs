//! AEAD wrapper around the data channel.
//!
//! Once the Noise handshake has produced directional keys, every outbound
//! envelope is sealed as `[nonce:12][ciphertext]` with ChaCha20-Poly1305.
//! Nonces are per-direction 96-bit counters; a received nonce that is not
//! exactly the next expected counter is treated as replay and closes the
//! channel. Associated data binds the handshake id and the direction tag so
//! frames cannot be reflected between directions or sessions.

use std::sync::Mutex;

use chacha20poly1305::aead::{Aead, KeyInit, Payload as AeadPayload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};

pub const NONCE_LEN: usize = 12;

/// Direction tags mixed into the associated data.
pub const DIRECTION_CLIENT_TO_SERVER: &str = "c→s";
pub const DIRECTION_SERVER_TO_CLIENT: &str = "s→c";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureChannelReason {
    Auth,
    Replay,
    Framing,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("secure channel failure: {reason:?}")]
pub struct SecureChannelError {
    pub reason: SecureChannelReason,
}

impl SecureChannelError {
    fn auth() -> Self {
        Self {
            reason: SecureChannelReason::Auth,
        }
    }

    fn replay() -> Self {
        Self {
            reason: SecureChannelReason::Replay,
        }
    }

    fn framing() -> Self {
        Self {
            reason: SecureChannelReason::Framing,
        }
    }
}

/// Handshake-derived key material for one channel.
#[derive(Clone)]
pub struct ChannelKeys {
    pub send_key: [u8; 32],
    pub recv_key: [u8; 32],
}

struct DirectionState {
    cipher: ChaCha20Poly1305,
    aad: Vec<u8>,
    counter: u64,
    /// Set after the first failure; every later call fails closed.
    poisoned: bool,
}

impl DirectionState {
    fn new(key: &[u8; 32], handshake_id: &str, direction: &str) -> Self {
        let mut aad = Vec::with_capacity(handshake_id.len() + direction.len() + 1);
        aad.extend_from_slice(handshake_id.as_bytes());
        aad.push(0x1f);
        aad.extend_from_slice(direction.as_bytes());
        Self {
            cipher: ChaCha20Poly1305::new(key.into()),
            aad,
            counter: 0,
            poisoned: false,
        }
    }

    fn next_nonce(&mut self) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce[4..].copy_from_slice(&self.counter.to_be_bytes());
        self.counter += 1;
        nonce
    }
}

/// Seals and opens envelope bytes for one negotiated channel.
///
/// [`SecureLayer::plaintext`] builds a pass-through layer for sessions that
/// never ran the Noise handshake.
pub struct SecureLayer {
    state: Option<SealedState>,
}

struct SealedState {
    send: Mutex<DirectionState>,
    recv: Mutex<DirectionState>,
}

impl SecureLayer {
    pub fn plaintext() -> Self {
        Self { state: None }
    }

    /// Builds the client-side layer: outbound frames are tagged `c→s` and
    /// inbound frames must have been sealed as `s→c`.
    pub fn client(keys: &ChannelKeys, handshake_id: &str) -> Self {
        Self {
            state: Some(SealedState {
                send: Mutex::new(DirectionState::new(
                    &keys.send_key,
                    handshake_id,
                    DIRECTION_CLIENT_TO_SERVER,
                )),
                recv: Mutex::new(DirectionState::new(
                    &keys.recv_key,
                    handshake_id,
                    DIRECTION_SERVER_TO_CLIENT,
                )),
            }),
        }
    }

    /// The host-side counterpart, used by loopback tests.
    pub fn server(keys: &ChannelKeys, handshake_id: &str) -> Self {
        Self {
            state: Some(SealedState {
                send: Mutex::new(DirectionState::new(
                    &keys.send_key,
                    handshake_id,
                    DIRECTION_SERVER_TO_CLIENT,
                )),
                recv: Mutex::new(DirectionState::new(
                    &keys.recv_key,
                    handshake_id,
                    DIRECTION_CLIENT_TO_SERVER,
                )),
            }),
        }
    }

    pub fn is_plaintext(&self) -> bool {
        self.state.is_none()
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, SecureChannelError> {
        let Some(state) = &self.state else {
            return Ok(plaintext.to_vec());
        };
        let mut send = state.send.lock().expect("secure send state poisoned");
        if send.poisoned {
            return Err(SecureChannelError::framing());
        }
        let nonce_bytes = send.next_nonce();
        let ciphertext = send
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                AeadPayload {
                    msg: plaintext,
                    aad: &send.aad,
                },
            )
            .map_err(|_| {
                send.poisoned = true;
                SecureChannelError::auth()
            })?;
        let mut framed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        framed.extend_from_slice(&nonce_bytes);
        framed.extend_from_slice(&ciphertext);
        Ok(framed)
    }

    pub fn open(&self, framed: &[u8]) -> Result<Vec<u8>, SecureChannelError> {
        let Some(state) = &self.state else {
            return Ok(framed.to_vec());
        };
        let mut recv = state.recv.lock().expect("secure recv state poisoned");
        if recv.poisoned {
            return Err(SecureChannelError::framing());
        }
        if framed.len() < NONCE_LEN {
            recv.poisoned = true;
            return Err(SecureChannelError::framing());
        }
        let (nonce_bytes, ciphertext) = framed.split_at(NONCE_LEN);
        let expected = recv.next_nonce();
        if nonce_bytes != expected {
            recv.poisoned = true;
            return Err(SecureChannelError::replay());
        }
        recv.cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                AeadPayload {
                    msg: ciphertext,
                    aad: &recv.aad,
                },
            )
            .map_err(|_| {
                recv.poisoned = true;
                SecureChannelError::auth()
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paired_layers() -> (SecureLayer, SecureLayer) {
        let key_a = [0x11u8; 32];
        let key_b = [0x22u8; 32];
        let client = SecureLayer::client(
            &ChannelKeys {
                send_key: key_a,
                recv_key: key_b,
            },
            "hs-1",
        );
        let server = SecureLayer::server(
            &ChannelKeys {
                send_key: key_b,
                recv_key: key_a,
            },
            "hs-1",
        );
        (client, server)
    }

    #[test]
    fn seal_open_round_trip_both_directions() {
        let (client, server) = paired_layers();
        for i in 0..4u8 {
            let framed = client.seal(&[i, i + 1]).expect("seal");
            assert_eq!(server.open(&framed).expect("open"), vec![i, i + 1]);
            let framed = server.seal(&[0xF0, i]).expect("seal");
            assert_eq!(client.open(&framed).expect("open"), vec![0xF0, i]);
        }
    }

    #[test]
    fn tampered_ciphertext_fails_auth_and_poisons() {
        let (client, server) = paired_layers();
        let mut framed = client.seal(b"payload").expect("seal");
        let last = framed.len() - 1;
        framed[last] ^= 0x01;
        assert_eq!(server.open(&framed), Err(SecureChannelError::auth()));
        // Channel is closed from here on, even for a valid frame.
        let framed = client.seal(b"next").expect("seal");
        assert_eq!(server.open(&framed), Err(SecureChannelError::framing()));
    }

    #[test]
    fn replayed_nonce_is_rejected() {
        let (client, server) = paired_layers();
        let first = client.seal(b"one").expect("seal");
        server.open(&first).expect("open");
        assert_eq!(server.open(&first), Err(SecureChannelError::replay()));
    }

    #[test]
    fn short_frame_is_framing_error() {
        let (_, server) = paired_layers();
        assert_eq!(server.open(&[0u8; 5]), Err(SecureChannelError::framing()));
    }

    #[test]
    fn direction_tags_prevent_reflection() {
        let key = [0x33u8; 32];
        let keys = ChannelKeys {
            send_key: key,
            recv_key: key,
        };
        let client = SecureLayer::client(&keys, "hs-2");
        // Sealed as c→s; opening it as if the server had sent it must fail
        // even though both directions share a key here.
        let framed = client.seal(b"looped").expect("seal");
        assert_eq!(client.open(&framed), Err(SecureChannelError::auth()));
    }

    #[test]
    fn plaintext_layer_passes_through() {
        let layer = SecureLayer::plaintext();
        assert!(layer.is_plaintext());
        assert_eq!(layer.seal(b"abc").expect("seal"), b"abc");
        assert_eq!(layer.open(b"abc").expect("open"), b"abc");
    }
}
