//! Noise handshake over the dedicated handshake data channel.
//!
//! The host opens a second channel labeled `beach-secure-handshake`. Both
//! sides run `Noise_XXpsk3` with the handshake key as PSK and a prologue
//! binding the handshake id and both peer ids. Session material comes from
//! the handshake transcript: directional AEAD keys, a six-digit verification
//! code for out-of-band comparison, and the key for a final
//! challenge-response that proves both sides derived the same code.

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;
use snow::Builder as NoiseBuilder;
use snow::params::NoiseParams;
use tokio::sync::mpsc;

use crate::transport::secure::ChannelKeys;

pub const HANDSHAKE_CHANNEL_LABEL: &str = "beach-secure-handshake";

const NOISE_PATTERN: &str = "Noise_XXpsk3_25519_ChaChaPoly_BLAKE2s";
const PROLOGUE_PREFIX: &[u8] = b"beach:secure-handshake:v1";
const DIRECTION_PREFIX: &str = "beach:secure-transport:direction:";
const VERIFY_PREFIX: &str = "beach:secure-transport:verify:";
const CHALLENGE_KEY_PREFIX: &str = "beach:secure-transport:challenge-key:";
const CHALLENGE_MAC_PREFIX: &str = "beach:secure-transport:challenge-mac:";
const CHALLENGE_FRAME_VERSION: u8 = 1;
const CHALLENGE_NONCE_LEN: usize = 16;
const CHALLENGE_MAC_LEN: usize = 32;
const CHALLENGE_FRAME_LEN: usize = 1 + 1 + 6 + CHALLENGE_NONCE_LEN + CHALLENGE_MAC_LEN;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandshakeRole {
    Initiator,
    Responder,
}

#[derive(Clone)]
pub struct HandshakeResult {
    pub keys: ChannelKeys,
    pub verification_code: String,
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("noise error: {0}")]
    Noise(String),
    #[error("handshake channel closed")]
    ChannelClosed,
    #[error("handshake verification failed: {0}")]
    Verification(&'static str),
    #[error("key derivation failed")]
    Derive,
}

/// Byte pipe onto the handshake data channel. The negotiator bridges these
/// queues to the channel callbacks so the handshake itself stays free of
/// platform types.
pub struct HandshakeIo {
    pub outbound: mpsc::UnboundedSender<Vec<u8>>,
    pub inbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

pub struct HandshakeParams {
    pub handshake_key: [u8; 32],
    pub handshake_id: String,
    pub local_peer_id: String,
    pub remote_peer_id: String,
}

pub async fn run_handshake(
    role: HandshakeRole,
    mut io: HandshakeIo,
    params: HandshakeParams,
) -> Result<HandshakeResult, HandshakeError> {
    tracing::debug!(
        target = "webrtc",
        ?role,
        handshake_id = %params.handshake_id,
        local_peer = %params.local_peer_id,
        remote_peer = %params.remote_peer_id,
        "starting secure handshake"
    );

    let prologue = build_prologue(
        &params.handshake_id,
        &params.local_peer_id,
        &params.remote_peer_id,
    );
    let noise_params: NoiseParams = NOISE_PATTERN
        .parse()
        .map_err(|err| HandshakeError::Noise(format!("invalid noise params: {err}")))?;
    let builder = NoiseBuilder::new(noise_params)
        .prologue(&prologue)
        .psk(3, params.handshake_key.as_slice());
    let keypair = builder.generate_keypair().map_err(map_noise_error)?;
    let builder = builder.local_private_key(&keypair.private);
    let mut state = match role {
        HandshakeRole::Initiator => builder.build_initiator().map_err(map_noise_error)?,
        HandshakeRole::Responder => builder.build_responder().map_err(map_noise_error)?,
    };

    let mut buf = vec![0u8; 1024];
    if role == HandshakeRole::Initiator {
        let len = state.write_message(&[], &mut buf).map_err(map_noise_error)?;
        io.outbound
            .send(buf[..len].to_vec())
            .map_err(|_| HandshakeError::ChannelClosed)?;
    }

    while !state.is_handshake_finished() {
        let incoming = io
            .inbound
            .recv()
            .await
            .ok_or(HandshakeError::ChannelClosed)?;
        state
            .read_message(&incoming, &mut buf)
            .map_err(map_noise_error)?;
        if state.is_handshake_finished() {
            break;
        }
        let len = state.write_message(&[], &mut buf).map_err(map_noise_error)?;
        io.outbound
            .send(buf[..len].to_vec())
            .map_err(|_| HandshakeError::ChannelClosed)?;
    }

    let handshake_hash = state.get_handshake_hash().to_vec();
    tracing::trace!(
        target = "webrtc",
        handshake_id = %params.handshake_id,
        ?role,
        transcript = %hex_preview(&handshake_hash),
        "noise handshake completed key exchange"
    );

    let (result, challenge_key, challenge_context) = derive_session_material(
        &params.handshake_key,
        &handshake_hash,
        &params.local_peer_id,
        &params.remote_peer_id,
        &params.handshake_id,
    )?;

    perform_verification_exchange(
        &mut io,
        role,
        &result.verification_code,
        &challenge_key,
        &challenge_context,
    )
    .await?;

    tracing::info!(
        target = "webrtc",
        handshake_id = %params.handshake_id,
        peer = %params.remote_peer_id,
        verification = %result.verification_code,
        "secure transport handshake established"
    );
    Ok(result)
}

pub fn build_prologue(handshake_id: &str, local_peer: &str, remote_peer: &str) -> Vec<u8> {
    let mut peers = [local_peer, remote_peer];
    peers.sort_unstable();
    let mut prologue =
        Vec::with_capacity(PROLOGUE_PREFIX.len() + handshake_id.len() + local_peer.len() + remote_peer.len() + 3);
    prologue.extend_from_slice(PROLOGUE_PREFIX);
    prologue.push(0x1f);
    prologue.extend_from_slice(handshake_id.as_bytes());
    prologue.push(0x1f);
    prologue.extend_from_slice(peers[0].as_bytes());
    prologue.push(0x1f);
    prologue.extend_from_slice(peers[1].as_bytes());
    prologue
}

fn derive_session_material(
    psk: &[u8],
    handshake_hash: &[u8],
    local_peer: &str,
    remote_peer: &str,
    handshake_id: &str,
) -> Result<(HandshakeResult, [u8; 32], Vec<u8>), HandshakeError> {
    let hkdf = Hkdf::<Sha256>::new(Some(psk), handshake_hash);

    let send_label = format!("{DIRECTION_PREFIX}{local_peer}->{remote_peer}");
    let recv_label = format!("{DIRECTION_PREFIX}{remote_peer}->{local_peer}");
    let mut send_key = [0u8; 32];
    let mut recv_key = [0u8; 32];
    hkdf.expand(send_label.as_bytes(), &mut send_key)
        .map_err(|_| HandshakeError::Derive)?;
    hkdf.expand(recv_label.as_bytes(), &mut recv_key)
        .map_err(|_| HandshakeError::Derive)?;

    let mut peers = [local_peer, remote_peer];
    peers.sort_unstable();
    let verify_label = format!("{VERIFY_PREFIX}{}|{}", peers[0], peers[1]);
    let mut verify_bytes = [0u8; 4];
    hkdf.expand(verify_label.as_bytes(), &mut verify_bytes)
        .map_err(|_| HandshakeError::Derive)?;
    let code = u32::from_le_bytes(verify_bytes) % 1_000_000;
    let verification_code = format!("{code:06}");

    let challenge_label = format!("{CHALLENGE_KEY_PREFIX}{handshake_id}|{}|{}", peers[0], peers[1]);
    let mut challenge_key = [0u8; 32];
    hkdf.expand(challenge_label.as_bytes(), &mut challenge_key)
        .map_err(|_| HandshakeError::Derive)?;
    let challenge_context =
        format!("{CHALLENGE_MAC_PREFIX}{handshake_id}|{}|{}", peers[0], peers[1]).into_bytes();

    Ok((
        HandshakeResult {
            keys: ChannelKeys { send_key, recv_key },
            verification_code,
        },
        challenge_key,
        challenge_context,
    ))
}

async fn perform_verification_exchange(
    io: &mut HandshakeIo,
    role: HandshakeRole,
    verification_code: &str,
    challenge_key: &[u8; 32],
    challenge_context: &[u8],
) -> Result<(), HandshakeError> {
    if verification_code.len() != 6 {
        return Err(HandshakeError::Verification("code length"));
    }
    let role_byte = match role {
        HandshakeRole::Initiator => 0u8,
        HandshakeRole::Responder => 1u8,
    };
    let expected_remote_role = role_byte ^ 1;

    let mut frame = [0u8; CHALLENGE_FRAME_LEN];
    frame[0] = CHALLENGE_FRAME_VERSION;
    frame[1] = role_byte;
    frame[2..8].copy_from_slice(verification_code.as_bytes());
    let mut nonce = [0u8; CHALLENGE_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    frame[8..8 + CHALLENGE_NONCE_LEN].copy_from_slice(&nonce);
    let mac = compute_challenge_mac(
        challenge_key,
        challenge_context,
        role_byte,
        &frame[2..8],
        &nonce,
    )?;
    frame[8 + CHALLENGE_NONCE_LEN..].copy_from_slice(&mac);

    io.outbound
        .send(frame.to_vec())
        .map_err(|_| HandshakeError::ChannelClosed)?;

    let remote = io
        .inbound
        .recv()
        .await
        .ok_or(HandshakeError::ChannelClosed)?;
    if remote.len() != CHALLENGE_FRAME_LEN {
        return Err(HandshakeError::Verification("frame length"));
    }
    if remote[0] != CHALLENGE_FRAME_VERSION {
        return Err(HandshakeError::Verification("frame version"));
    }
    if remote[1] != expected_remote_role {
        return Err(HandshakeError::Verification("role"));
    }
    let remote_code = &remote[2..8];
    let remote_nonce = &remote[8..8 + CHALLENGE_NONCE_LEN];
    let remote_mac = &remote[8 + CHALLENGE_NONCE_LEN..];
    let expected_mac = compute_challenge_mac(
        challenge_key,
        challenge_context,
        remote[1],
        remote_code,
        remote_nonce,
    )?;
    if !timing_safe_equal(remote_mac, &expected_mac) {
        return Err(HandshakeError::Verification("mac"));
    }
    if remote_code != verification_code.as_bytes() {
        return Err(HandshakeError::Verification("code"));
    }
    Ok(())
}

fn compute_challenge_mac(
    challenge_key: &[u8],
    challenge_context: &[u8],
    role_byte: u8,
    code_bytes: &[u8],
    nonce: &[u8],
) -> Result<[u8; CHALLENGE_MAC_LEN], HandshakeError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(challenge_key)
        .map_err(|_| HandshakeError::Derive)?;
    mac.update(challenge_context);
    mac.update(&[role_byte]);
    mac.update(code_bytes);
    mac.update(nonce);
    let tag = mac.finalize().into_bytes();
    let mut output = [0u8; CHALLENGE_MAC_LEN];
    output.copy_from_slice(&tag);
    Ok(output)
}

fn timing_safe_equal(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn map_noise_error(err: snow::Error) -> HandshakeError {
    HandshakeError::Noise(err.to_string())
}

fn hex_preview(data: &[u8]) -> String {
    const MAX_BYTES: usize = 8;
    let mut encoded = hex::encode(&data[..data.len().min(MAX_BYTES)]);
    if data.len() > MAX_BYTES {
        encoded.push('…');
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_io() -> (HandshakeIo, HandshakeIo) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            HandshakeIo {
                outbound: a_tx,
                inbound: a_rx,
            },
            HandshakeIo {
                outbound: b_tx,
                inbound: b_rx,
            },
        )
    }

    #[tokio::test]
    async fn loopback_handshake_agrees_on_keys_and_code() {
        let (host_io, client_io) = loopback_io();
        let psk = [7u8; 32];
        let host = tokio::spawn(run_handshake(
            HandshakeRole::Initiator,
            host_io,
            HandshakeParams {
                handshake_key: psk,
                handshake_id: "hs-1".into(),
                local_peer_id: "host".into(),
                remote_peer_id: "client".into(),
            },
        ));
        let client = tokio::spawn(run_handshake(
            HandshakeRole::Responder,
            client_io,
            HandshakeParams {
                handshake_key: psk,
                handshake_id: "hs-1".into(),
                local_peer_id: "client".into(),
                remote_peer_id: "host".into(),
            },
        ));

        let host = host.await.expect("join").expect("host handshake");
        let client = client.await.expect("join").expect("client handshake");

        assert_eq!(host.verification_code, client.verification_code);
        assert_eq!(host.keys.send_key, client.keys.recv_key);
        assert_eq!(host.keys.recv_key, client.keys.send_key);
        assert_ne!(host.keys.send_key, host.keys.recv_key);
    }

    #[tokio::test]
    async fn psk_mismatch_fails() {
        let (host_io, client_io) = loopback_io();
        let host = tokio::spawn(run_handshake(
            HandshakeRole::Initiator,
            host_io,
            HandshakeParams {
                handshake_key: [1u8; 32],
                handshake_id: "hs-2".into(),
                local_peer_id: "host".into(),
                remote_peer_id: "client".into(),
            },
        ));
        let client = tokio::spawn(run_handshake(
            HandshakeRole::Responder,
            client_io,
            HandshakeParams {
                handshake_key: [2u8; 32],
                handshake_id: "hs-2".into(),
                local_peer_id: "client".into(),
                remote_peer_id: "host".into(),
            },
        ));

        let host = host.await.expect("join");
        let client = client.await.expect("join");
        assert!(host.is_err() || client.is_err());
    }

    #[test]
    fn prologue_is_peer_order_independent() {
        let a = build_prologue("hs", "alpha", "beta");
        let b = build_prologue("hs", "beta", "alpha");
        assert_eq!(a, b);
    }
}
