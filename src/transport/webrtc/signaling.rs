//! Typed WebSocket client for the session broker.
//!
//! Messages are newline-free UTF-8 JSON with a `type` discriminator. The
//! client joins the session, relays signals to peers, and fans every broker
//! message out to subscribers; `wait_for_message` is the primitive the
//! negotiator builds its states on. Any socket close aborts pending waits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;
use uuid::Uuid;

use super::secure_signaling::SealedEnvelope;
use crate::config::ClientConfig;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TransportType {
    #[serde(rename = "webrtc")]
    WebRtc,
    WebTransport,
    Direct,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PeerRole {
    Server,
    Client,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    pub role: PeerRole,
    pub joined_at: i64,
    pub supported_transports: Vec<TransportType>,
    pub preferred_transport: Option<TransportType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, String>>,
}

/// Signal payload nested inside broker `signal` messages:
/// `{"transport": "webrtc", "signal": {"signal_type": ..., ...}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "signal_type", rename_all = "snake_case")]
pub enum WebRtcSignal {
    Offer {
        sdp: String,
        handshake_id: String,
    },
    Answer {
        sdp: String,
        handshake_id: String,
    },
    IceCandidate {
        candidate: String,
        sdp_mid: Option<String>,
        sdp_mline_index: Option<u32>,
        handshake_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sealed: Option<SealedEnvelope>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum TransportSignal {
    #[serde(rename = "webrtc")]
    WebRtc { signal: WebRtcSignal },
}

impl TransportSignal {
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    pub fn from_value(value: &Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Join {
        peer_id: String,
        passphrase: Option<String>,
        supported_transports: Vec<TransportType>,
        preferred_transport: Option<TransportType>,
    },
    NegotiateTransport {
        to_peer: String,
        proposed: TransportType,
    },
    AcceptTransport {
        to_peer: String,
        transport: TransportType,
    },
    Signal {
        to_peer: String,
        signal: Value,
    },
    Ping,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    JoinSuccess {
        session_id: String,
        peer_id: String,
        peers: Vec<PeerInfo>,
        available_transports: Vec<TransportType>,
    },
    PeerJoined {
        peer: PeerInfo,
    },
    PeerLeft {
        peer_id: String,
    },
    TransportProposal {
        from_peer: String,
        proposed: TransportType,
    },
    TransportAccepted {
        from_peer: String,
        transport: TransportType,
    },
    Signal {
        from_peer: String,
        signal: Value,
    },
    Pong,
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerMessageKind {
    JoinSuccess,
    PeerJoined,
    PeerLeft,
    TransportProposal,
    TransportAccepted,
    Signal,
    Pong,
    Error,
}

impl ServerMessage {
    pub fn kind(&self) -> ServerMessageKind {
        match self {
            ServerMessage::JoinSuccess { .. } => ServerMessageKind::JoinSuccess,
            ServerMessage::PeerJoined { .. } => ServerMessageKind::PeerJoined,
            ServerMessage::PeerLeft { .. } => ServerMessageKind::PeerLeft,
            ServerMessage::TransportProposal { .. } => ServerMessageKind::TransportProposal,
            ServerMessage::TransportAccepted { .. } => ServerMessageKind::TransportAccepted,
            ServerMessage::Signal { .. } => ServerMessageKind::Signal,
            ServerMessage::Pong => ServerMessageKind::Pong,
            ServerMessage::Error { .. } => ServerMessageKind::Error,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("signaling socket closed")]
    Closed,
    #[error("timed out waiting for signaling message")]
    Timeout,
    #[error("signaling http status {status}")]
    Http { status: u16 },
    #[error("signaling decode failed: {0}")]
    Decode(String),
    #[error("signaling setup failed: {0}")]
    Setup(String),
}

pub struct SignalingClient {
    peer_id: String,
    send_tx: mpsc::UnboundedSender<ClientMessage>,
    events_tx: broadcast::Sender<ServerMessage>,
    // join_success is stateful: it may land before the first subscriber, so
    // the reader stashes it for late waiters.
    join_success: Arc<Mutex<Option<ServerMessage>>>,
    closed: Arc<CloseFlag>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

#[derive(Default)]
struct CloseFlag {
    flag: AtomicBool,
    notify: Notify,
}

impl CloseFlag {
    fn mark(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_closed(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    async fn closed(&self) {
        while !self.is_closed() {
            let notified = self.notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

impl SignalingClient {
    /// Connects to the broker and announces this peer. Returns once the join
    /// message is on the wire; `join_success` is awaited by the caller via
    /// [`SignalingClient::wait_for_message`].
    pub async fn connect(config: &ClientConfig) -> Result<Arc<Self>, SignalingError> {
        let websocket_url = derive_websocket_url(&config.signaling_url, &config.session_id)?;
        let (ws_stream, _) = connect_async(websocket_url.as_str())
            .await
            .map_err(|err| SignalingError::Setup(format!("websocket connect failed: {err}")))?;
        tracing::debug!(target = "signaling", url = %websocket_url, "broker websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let peer_id = Uuid::new_v4().to_string();
        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let closed = Arc::new(CloseFlag::default());

        let join_success = Arc::new(Mutex::new(None));

        let client = Arc::new(SignalingClient {
            peer_id: peer_id.clone(),
            send_tx: send_tx.clone(),
            events_tx: events_tx.clone(),
            join_success: join_success.clone(),
            closed: closed.clone(),
            tasks: Mutex::new(Vec::new()),
        });

        let writer_closed = closed.clone();
        let writer = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                let Ok(text) = serde_json::to_string(&message) else {
                    continue;
                };
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            writer_closed.mark();
        });

        let reader_events = events_tx.clone();
        let reader_send = send_tx.clone();
        let reader_closed = closed.clone();
        let reader_join = join_success.clone();
        let reader = tokio::spawn(async move {
            while let Some(message) = ws_read.next().await {
                let text = match message {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => continue,
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(err) => {
                        tracing::debug!(target = "signaling", error = %err, "websocket read ended");
                        break;
                    }
                };
                match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(server_msg) => {
                        // A transport proposal is acknowledged right away;
                        // negotiation does not depend on it succeeding.
                        if let ServerMessage::TransportProposal { from_peer, proposed } =
                            &server_msg
                        {
                            let _ = reader_send.send(ClientMessage::AcceptTransport {
                                to_peer: from_peer.clone(),
                                transport: proposed.clone(),
                            });
                        }
                        if matches!(server_msg, ServerMessage::JoinSuccess { .. }) {
                            if let Ok(mut cached) = reader_join.lock() {
                                *cached = Some(server_msg.clone());
                            }
                        }
                        let _ = reader_events.send(server_msg);
                    }
                    Err(err) => {
                        tracing::warn!(
                            target = "signaling",
                            error = %err,
                            "unrecognized broker message"
                        );
                    }
                }
            }
            reader_closed.mark();
        });

        let keepalive_send = send_tx.clone();
        let keepalive = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if keepalive_send.send(ClientMessage::Ping).is_err() {
                    break;
                }
            }
        });

        {
            let mut guard = client.tasks.lock().expect("signaling task list poisoned");
            guard.push(writer);
            guard.push(reader);
            guard.push(keepalive);
        }

        client.send(ClientMessage::Join {
            peer_id,
            passphrase: config.passphrase.clone(),
            supported_transports: vec![TransportType::WebRtc],
            preferred_transport: Some(TransportType::WebRtc),
        })?;
        tracing::debug!(target = "signaling", peer_id = %client.peer_id, "join announced");
        Ok(client)
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_closed()
    }

    pub fn send(&self, message: ClientMessage) -> Result<(), SignalingError> {
        if self.closed.is_closed() {
            return Err(SignalingError::Closed);
        }
        self.send_tx
            .send(message)
            .map_err(|_| SignalingError::Closed)
    }

    pub fn send_signal(&self, to_peer: &str, signal: WebRtcSignal) -> Result<(), SignalingError> {
        let payload = TransportSignal::WebRtc { signal }
            .to_value()
            .map_err(|err| SignalingError::Decode(err.to_string()))?;
        self.send(ClientMessage::Signal {
            to_peer: to_peer.to_string(),
            signal: payload,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerMessage> {
        self.events_tx.subscribe()
    }

    /// Returns the first message of the given kind, or `Timeout`. A socket
    /// close while waiting surfaces as `Closed`.
    pub async fn wait_for_message(
        &self,
        kind: ServerMessageKind,
        timeout: Duration,
    ) -> Result<ServerMessage, SignalingError> {
        let mut events = self.subscribe();
        if kind == ServerMessageKind::JoinSuccess {
            let cached = self
                .join_success
                .lock()
                .expect("join cache poisoned")
                .clone();
            if let Some(message) = cached {
                return Ok(message);
            }
        }
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.closed.is_closed() {
                return Err(SignalingError::Closed);
            }
            tokio::select! {
                message = events.recv() => match message {
                    Ok(message) if message.kind() == kind => return Ok(message),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(target = "signaling", skipped, "event subscriber lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(SignalingError::Closed),
                },
                _ = self.closed.closed() => return Err(SignalingError::Closed),
                _ = tokio::time::sleep_until(deadline) => return Err(SignalingError::Timeout),
            }
        }
    }

    pub fn close(&self) {
        self.closed.mark();
        if let Ok(mut tasks) = self.tasks.lock() {
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn derive_websocket_url(signaling_url: &str, session_id: &str) -> Result<Url, SignalingError> {
    let base = Url::parse(signaling_url)
        .map_err(|err| SignalingError::Setup(format!("invalid signaling url: {err}")))?;
    let mut ws = base.clone();
    ws.set_scheme(if base.scheme() == "https" { "wss" } else { "ws" })
        .map_err(|_| SignalingError::Setup("invalid websocket scheme".into()))?;
    ws.set_path(&format!("ws/{session_id}"));
    ws.set_query(None);
    ws.set_fragment(None);
    Ok(ws)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_swaps_scheme_and_path() {
        let ws = derive_websocket_url("https://broker.example/sessions/abc", "abc")
            .expect("derive");
        assert_eq!(ws.as_str(), "wss://broker.example/ws/abc");

        let ws = derive_websocket_url("http://localhost:4000/sessions/abc?x=1", "abc")
            .expect("derive");
        assert_eq!(ws.as_str(), "ws://localhost:4000/ws/abc");
    }

    #[test]
    fn signal_payload_shape_matches_protocol() {
        let signal = TransportSignal::WebRtc {
            signal: WebRtcSignal::IceCandidate {
                candidate: "candidate:1 1 udp 2130706431 192.0.2.1 54400 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                handshake_id: "hs-1".into(),
                sealed: None,
            },
        };
        let value = signal.to_value().expect("to value");
        assert_eq!(value["transport"], "webrtc");
        assert_eq!(value["signal"]["signal_type"], "ice_candidate");
        assert_eq!(value["signal"]["handshake_id"], "hs-1");

        let parsed = TransportSignal::from_value(&value).expect("from value");
        let TransportSignal::WebRtc {
            signal: WebRtcSignal::IceCandidate { candidate, .. },
        } = parsed
        else {
            panic!("unexpected signal variant");
        };
        assert!(candidate.starts_with("candidate:1"));
    }

    #[test]
    fn server_messages_parse_from_broker_json() {
        let text = r#"{
            "type": "join_success",
            "session_id": "sess",
            "peer_id": "assigned",
            "peers": [{
                "id": "host-1",
                "role": "server",
                "joined_at": 0,
                "supported_transports": ["webrtc"],
                "preferred_transport": "webrtc"
            }],
            "available_transports": ["webrtc"]
        }"#;
        let message: ServerMessage = serde_json::from_str(text).expect("parse");
        let ServerMessage::JoinSuccess { peers, .. } = message else {
            panic!("expected join_success");
        };
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].role, PeerRole::Server);
    }
}
