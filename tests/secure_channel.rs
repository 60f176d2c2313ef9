//! Key schedule and secure-channel properties exercised end to end.

use cove::protocol::{HostFrame, decode_host_frame, encode_host_frame};
use cove::transport::secure::{ChannelKeys, SecureChannelError, SecureLayer};
use cove::transport::webrtc::secure_signaling::{
    MessageLabel, derive_handshake_key, derive_session_key, open_message, seal_message,
};
use cove::transport::{TransportMessage, decode_message, encode_message};

#[test]
fn independent_sessions_derive_identical_keys() {
    // Two peers with the same passphrase, session, and handshake id agree.
    let side_a = derive_session_key("correct horse", "session-42").expect("derive");
    let side_b = derive_session_key("correct horse", "session-42").expect("derive");
    assert_eq!(side_a, side_b);

    let handshake_a = derive_handshake_key(&side_a, "hs-7").expect("derive");
    let handshake_b = derive_handshake_key(&side_b, "hs-7").expect("derive");
    assert_eq!(handshake_a, handshake_b);

    // Different handshake ids produce uncorrelated handshake keys.
    let other = derive_handshake_key(&side_a, "hs-8").expect("derive");
    assert_ne!(handshake_a, other);

    // And a different session id changes the session key entirely.
    let foreign = derive_session_key("correct horse", "session-43").expect("derive");
    assert_ne!(side_a, foreign);
}

#[test]
fn sealed_offer_cannot_be_opened_with_wrong_passphrase() {
    let session = derive_session_key("tide pool", "sess").expect("derive");
    let key = derive_handshake_key(&session, "hs").expect("derive");
    let associated = ["host", "client", "offer"];
    let envelope = seal_message(&key, MessageLabel::Offer, &associated, b"v=0\r\n").expect("seal");

    let wrong_session = derive_session_key("rip tide", "sess").expect("derive");
    let wrong_key = derive_handshake_key(&wrong_session, "hs").expect("derive");
    assert!(open_message(&wrong_key, MessageLabel::Offer, &associated, &envelope).is_err());
    assert_eq!(
        open_message(&key, MessageLabel::Offer, &associated, &envelope).expect("open"),
        b"v=0\r\n"
    );
}

fn paired_layers(handshake_id: &str) -> (SecureLayer, SecureLayer) {
    let client_to_server = [0xA1u8; 32];
    let server_to_client = [0xB2u8; 32];
    let client = SecureLayer::client(
        &ChannelKeys {
            send_key: client_to_server,
            recv_key: server_to_client,
        },
        handshake_id,
    );
    let server = SecureLayer::server(
        &ChannelKeys {
            send_key: server_to_client,
            recv_key: client_to_server,
        },
        handshake_id,
    );
    (client, server)
}

#[test]
fn enveloped_frames_survive_the_secure_layer() {
    let (client, server) = paired_layers("hs-1");

    // Host → client: a frame travels envelope → seal → open → decode.
    let frame = HostFrame::InputAck { seq: 99 };
    let envelope = encode_message(&TransportMessage::binary(3, encode_host_frame(&frame)));
    let wire = server.seal(&envelope).expect("seal");
    assert_ne!(wire, envelope);

    let opened = client.open(&wire).expect("open");
    let message = decode_message(&opened).expect("decode envelope");
    assert_eq!(message.sequence, 3);
    let decoded = decode_host_frame(message.payload.as_binary().expect("binary")).expect("frame");
    assert_eq!(decoded, frame);
}

#[test]
fn secure_layer_rejects_cross_session_frames() {
    let (client_a, _) = paired_layers("hs-a");
    let (_, server_b) = paired_layers("hs-b");

    // Same keys, different handshake id in the AAD: must not decrypt.
    let sealed = server_b.seal(b"payload").expect("seal");
    let err = client_a.open(&sealed).expect_err("must fail");
    assert_eq!(err, SecureChannelError { reason: cove::transport::secure::SecureChannelReason::Auth });
}

#[test]
fn out_of_order_delivery_is_replay() {
    let (client, server) = paired_layers("hs-2");
    let first = server.seal(b"one").expect("seal");
    let second = server.seal(b"two").expect("seal");
    // Delivering the second frame first breaks the nonce counter.
    let err = client.open(&second).expect_err("must fail");
    assert_eq!(
        err.reason,
        cove::transport::secure::SecureChannelReason::Replay
    );
    // The channel is closed for good, even for the frame that was in order.
    assert!(client.open(&first).is_err());
}
