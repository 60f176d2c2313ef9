//! WebRTC negotiation and the data-channel transport.
//!
//! The client is always the answerer: it resolves the host peer through the
//! broker, long-polls the broker for the SDP offer, posts its answer, trades
//! ICE candidates over the signaling socket, and optionally runs the Noise
//! handshake before handing back an opened (and possibly AEAD-wrapped)
//! channel.
//!
//! Outbound ICE is staged: candidates queue while `Blocked`, move to
//! `Delayed` once the answer is posted, and flush in order when the flush
//! delay elapses (`Ready`). After that the full candidate set is replayed a
//! bounded number of times to survive lossy relays.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use once_cell::sync::Lazy;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc};
use tokio::time::{Instant, sleep, timeout};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

pub mod secure_handshake;
pub mod secure_signaling;
pub mod signaling;

use crate::config::ClientConfig;
use crate::transport::secure::SecureLayer;
use crate::transport::{
    CancelToken, Transport, TransportError, TransportId, TransportKind, TransportMessage,
    decode_message, encode_message, next_transport_id,
};
use secure_handshake::{
    HANDSHAKE_CHANNEL_LABEL, HandshakeIo, HandshakeParams, HandshakeRole, run_handshake,
};
use secure_signaling::{
    MessageLabel, SealedEnvelope, derive_handshake_key, derive_session_key, open_message,
    seal_message,
};
use signaling::{
    ClientMessage, PeerInfo, PeerRole, ServerMessage, ServerMessageKind, SignalingClient,
    SignalingError, TransportSignal, TransportType, WebRtcSignal,
};

#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("timed out resolving remote peer")]
    PeerResolutionTimeout,
    #[error("sdp exchange failed: {0}")]
    SdpExchangeFailed(String),
    #[error("ice gathering failed: {0}")]
    IceGatheringFailed(String),
    #[error("sealed offer decrypt failed")]
    SealedOfferDecryptFailed,
    #[error("noise handshake failed: {0}")]
    NoiseHandshakeFailed(String),
    #[error("data channel failed: {0}")]
    DataChannelFailed(String),
    #[error("negotiation cancelled")]
    Cancelled,
    #[error("negotiation setup failed: {0}")]
    Setup(String),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Resolving,
    ProposingTransport,
    GatheringLocal,
    ExchangingDescriptions,
    ExchangingIce,
    NoiseHandshake,
    DataChannelOpen,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureMode {
    Plaintext,
    Noise,
}

#[derive(Debug, Clone)]
pub struct SecureTransportSummary {
    pub mode: SecureMode,
    pub verification_code: Option<String>,
    pub handshake_id: Option<String>,
    pub remote_peer_id: Option<String>,
}

pub struct WebRtcConnection {
    pub transport: Arc<dyn Transport>,
    pub summary: SecureTransportSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcSdpPayload {
    pub sdp: String,
    #[serde(rename = "type")]
    pub typ: String,
    pub handshake_id: Option<String>,
    pub from_peer: String,
    pub to_peer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sealed: Option<SealedEnvelope>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCandidateBlob {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u32>,
}

fn transition(state: &mut NegotiationState, next: NegotiationState) {
    tracing::debug!(target = "webrtc", from = ?state, to = ?next, "negotiation state");
    *state = next;
}

fn http_client() -> &'static reqwest::Client {
    static CLIENT: Lazy<reqwest::Client> = Lazy::new(reqwest::Client::new);
    &CLIENT
}

/// Negotiates a data channel with the resolved host peer. All tasks and
/// listeners registered along the way are torn down when this returns,
/// successfully or not; the returned transport owns its own pump tasks.
pub async fn connect(
    config: &ClientConfig,
    signaling: Arc<SignalingClient>,
    cancel: CancelToken,
) -> Result<WebRtcConnection, NegotiationError> {
    let mut pc_slot: Option<Arc<RTCPeerConnection>> = None;
    let result = {
        let pc_slot = &mut pc_slot;
        tokio::select! {
            _ = cancel.cancelled() => Err(NegotiationError::Cancelled),
            result = negotiate(config, &signaling, pc_slot) => result,
        }
    };
    if result.is_err() {
        if let Some(pc) = pc_slot {
            let _ = pc.close().await;
        }
    }
    result
}

async fn negotiate(
    config: &ClientConfig,
    signaling: &Arc<SignalingClient>,
    pc_slot: &mut Option<Arc<RTCPeerConnection>>,
) -> Result<WebRtcConnection, NegotiationError> {
    let mut state = NegotiationState::Resolving;
    let secure = config.secure_signaling();
    let mut guard = TaskGuard::default();

    // Resolving: adopt the preferred peer, else the first server-role peer,
    // else the next one to join.
    let join_deadline = Instant::now() + config.join_timeout;
    let join = signaling
        .wait_for_message(ServerMessageKind::JoinSuccess, config.join_timeout)
        .await
        .map_err(|err| match err {
            SignalingError::Timeout => NegotiationError::PeerResolutionTimeout,
            other => NegotiationError::Signaling(other),
        })?;
    let ServerMessage::JoinSuccess {
        peer_id: local_peer_id,
        peers,
        ..
    } = join
    else {
        return Err(NegotiationError::Setup("join_success variant".into()));
    };
    let remote_peer_id =
        resolve_remote_peer(config, signaling, &peers, join_deadline).await?;
    tracing::info!(
        target = "webrtc",
        local = %local_peer_id,
        remote = %remote_peer_id,
        "remote peer resolved"
    );

    // Subscribing before the offer exchange buffers any ICE candidates the
    // host relays early; they drain once the remote description is set.
    let ice_events = signaling.subscribe();

    transition(&mut state, NegotiationState::ProposingTransport);
    if let Err(err) = signaling.send(ClientMessage::NegotiateTransport {
        to_peer: remote_peer_id.clone(),
        proposed: TransportType::WebRtc,
    }) {
        tracing::warn!(target = "webrtc", error = %err, "transport proposal failed");
    }

    transition(&mut state, NegotiationState::GatheringLocal);
    let pc = build_peer_connection(config).await?;
    *pc_slot = Some(pc.clone());

    let channels = Arc::new(ChannelSlots::default());
    register_channel_handlers(&pc, &channels);

    // ExchangingDescriptions: poll the broker until the host's offer lands.
    transition(&mut state, NegotiationState::ExchangingDescriptions);
    let http = http_client();
    let offer = timeout(
        config.sdp_poll_timeout,
        poll_offer(http, &config.signaling_url, &local_peer_id, config.poll_interval),
    )
    .await
    .map_err(|_| NegotiationError::SdpExchangeFailed("offer poll timed out".into()))??;

    let handshake_id = offer
        .handshake_id
        .clone()
        .ok_or_else(|| NegotiationError::SdpExchangeFailed("offer missing handshake_id".into()))?;

    let handshake_key = if secure {
        let passphrase = config.passphrase.as_deref().unwrap_or_default();
        let session_key = derive_session_key(passphrase, &config.session_id)
            .map_err(|err| NegotiationError::Setup(err.to_string()))?;
        Some(
            derive_handshake_key(&session_key, &handshake_id)
                .map_err(|err| NegotiationError::Setup(err.to_string()))?,
        )
    } else {
        None
    };

    let offer_sdp = if let Some(key) = &handshake_key {
        let sealed = offer
            .sealed
            .as_ref()
            .ok_or_else(|| NegotiationError::SdpExchangeFailed("offer not sealed".into()))?;
        let associated = [offer.from_peer.as_str(), offer.to_peer.as_str(), offer.typ.as_str()];
        let plaintext = open_message(key, MessageLabel::Offer, &associated, sealed)
            .map_err(|_| NegotiationError::SealedOfferDecryptFailed)?;
        String::from_utf8(plaintext)
            .map_err(|_| NegotiationError::SdpExchangeFailed("sealed offer not utf-8".into()))?
    } else {
        offer.sdp.clone()
    };

    let offer_desc = RTCSessionDescription::offer(offer_sdp)
        .map_err(|err| NegotiationError::SdpExchangeFailed(err.to_string()))?;
    pc.set_remote_description(offer_desc)
        .await
        .map_err(|err| NegotiationError::SdpExchangeFailed(err.to_string()))?;

    // Local candidates start gathering at set_local_description below; the
    // sender must exist first so none are dropped.
    let ice_sender = Arc::new(IceSender::new(
        signaling.clone(),
        local_peer_id.clone(),
        remote_peer_id.clone(),
        handshake_id.clone(),
        handshake_key,
    ));
    register_local_candidate_handler(&pc, &ice_sender);

    let answer = pc
        .create_answer(None)
        .await
        .map_err(|err| NegotiationError::SdpExchangeFailed(err.to_string()))?;
    pc.set_local_description(answer)
        .await
        .map_err(|err| NegotiationError::SdpExchangeFailed(err.to_string()))?;
    let local_desc = pc
        .local_description()
        .await
        .ok_or_else(|| NegotiationError::SdpExchangeFailed("missing local description".into()))?;

    let answer_payload = build_answer_payload(
        &local_desc,
        &handshake_id,
        &local_peer_id,
        &offer.from_peer,
        ice_sender.seal_key(),
    )?;
    post_answer(http, &config.signaling_url, &answer_payload).await?;
    ice_sender.mark_delayed();

    // ExchangingIce: flush staged candidates after the answer settles, then
    // replay the full set a few times for lossy relays.
    transition(&mut state, NegotiationState::ExchangingIce);
    spawn_candidate_flush(&mut guard, ice_sender.clone(), config);
    spawn_remote_candidate_pump(
        &mut guard,
        ice_events,
        pc.clone(),
        RemoteCandidateFilter {
            handshake_id: handshake_id.clone(),
            local_peer_id: local_peer_id.clone(),
            remote_peer_id: remote_peer_id.clone(),
            seal_key: ice_sender.seal_key().copied(),
        },
    );

    // Optional Noise handshake over the dedicated channel the host opens.
    let (secure_layer, verification_code) = if let Some(key) = ice_sender.seal_key().copied() {
        transition(&mut state, NegotiationState::NoiseHandshake);
        let result = timeout(
            config.noise_timeout,
            run_noise_handshake(
                &channels,
                key,
                handshake_id.clone(),
                local_peer_id.clone(),
                remote_peer_id.clone(),
            ),
        )
        .await
        .map_err(|_| NegotiationError::NoiseHandshakeFailed("timed out".into()))??;
        (
            Arc::new(SecureLayer::client(&result.keys, &handshake_id)),
            Some(result.verification_code),
        )
    } else {
        (Arc::new(SecureLayer::plaintext()), None)
    };

    transition(&mut state, NegotiationState::DataChannelOpen);
    let data_channel = timeout(config.data_channel_timeout, channels.wait_main_arrived())
        .await
        .map_err(|_| NegotiationError::DataChannelFailed("data channel never arrived".into()))?;

    let transport = Arc::new(WebRtcTransport::new(
        pc.clone(),
        data_channel.clone(),
        secure_layer,
    ));
    timeout(config.data_channel_timeout, channels.wait_main_open())
        .await
        .map_err(|_| NegotiationError::DataChannelFailed("data channel never opened".into()))?
        .map_err(NegotiationError::DataChannelFailed)?;
    transport.mark_open();

    transition(&mut state, NegotiationState::Ready);
    let mode = if transport.is_secure() {
        SecureMode::Noise
    } else {
        SecureMode::Plaintext
    };
    let summary = SecureTransportSummary {
        mode,
        verification_code,
        handshake_id: Some(handshake_id),
        remote_peer_id: Some(remote_peer_id),
    };
    drop(guard);
    Ok(WebRtcConnection {
        transport: transport as Arc<dyn Transport>,
        summary,
    })
}

async fn resolve_remote_peer(
    config: &ClientConfig,
    signaling: &Arc<SignalingClient>,
    peers: &[PeerInfo],
    deadline: Instant,
) -> Result<String, NegotiationError> {
    if let Some(preferred) = &config.preferred_peer_id {
        if peers.iter().any(|peer| &peer.id == preferred) {
            return Ok(preferred.clone());
        }
    }
    if let Some(server) = peers.iter().find(|peer| peer.role == PeerRole::Server) {
        return Ok(server.id.clone());
    }
    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .ok_or(NegotiationError::PeerResolutionTimeout)?;
        let message = signaling
            .wait_for_message(ServerMessageKind::PeerJoined, remaining)
            .await
            .map_err(|err| match err {
                SignalingError::Timeout => NegotiationError::PeerResolutionTimeout,
                other => NegotiationError::Signaling(other),
            })?;
        if let ServerMessage::PeerJoined { peer } = message {
            if peer.role == PeerRole::Server {
                return Ok(peer.id);
            }
        }
    }
}

async fn build_peer_connection(
    config: &ClientConfig,
) -> Result<Arc<RTCPeerConnection>, NegotiationError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(|err| NegotiationError::Setup(err.to_string()))?;
    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)
        .map_err(|err| NegotiationError::Setup(err.to_string()))?;
    let mut setting = SettingEngine::default();
    setting.set_ice_timeouts(
        Some(Duration::from_secs(3)),
        Some(Duration::from_secs(10)),
        Some(Duration::from_millis(500)),
    );
    let api = APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let ice_servers = config
        .ice_servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect();
    let rtc_config = RTCConfiguration {
        ice_servers,
        ..Default::default()
    };
    let pc = api
        .new_peer_connection(rtc_config)
        .await
        .map_err(|err| NegotiationError::Setup(err.to_string()))?;
    Ok(Arc::new(pc))
}

/// Channel arrival/open bookkeeping shared with the `on_data_channel` handler.
#[derive(Default)]
struct ChannelSlots {
    main: Mutex<Option<Arc<RTCDataChannel>>>,
    main_arrived: Notify,
    main_open: AtomicBool,
    main_open_notify: Notify,
    main_failed: AtomicBool,
    handshake_io: Mutex<Option<HandshakePipes>>,
    handshake_arrived: Notify,
}

struct HandshakePipes {
    channel: Arc<RTCDataChannel>,
    inbound_rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl ChannelSlots {
    async fn wait_main_arrived(&self) -> Arc<RTCDataChannel> {
        loop {
            let notified = self.main_arrived.notified();
            if let Some(dc) = self.main.lock().expect("channel slot poisoned").clone() {
                return dc;
            }
            notified.await;
        }
    }

    async fn wait_main_open(&self) -> Result<(), String> {
        loop {
            let notified = self.main_open_notify.notified();
            if self.main_failed.load(Ordering::SeqCst) {
                return Err("data channel closed before open".into());
            }
            if self.main_open.load(Ordering::SeqCst) {
                return Ok(());
            }
            notified.await;
        }
    }

    async fn wait_handshake(&self) -> HandshakePipes {
        loop {
            let notified = self.handshake_arrived.notified();
            if let Some(pipes) = self
                .handshake_io
                .lock()
                .expect("handshake slot poisoned")
                .take()
            {
                return pipes;
            }
            notified.await;
        }
    }
}

fn register_channel_handlers(pc: &Arc<RTCPeerConnection>, channels: &Arc<ChannelSlots>) {
    let slots = channels.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let slots = slots.clone();
        Box::pin(async move {
            let label = dc.label().to_string();
            tracing::debug!(target = "webrtc", label = %label, "data channel announced");
            if label == HANDSHAKE_CHANNEL_LABEL {
                let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
                dc.on_message(Box::new(move |msg: DataChannelMessage| {
                    let tx = inbound_tx.clone();
                    Box::pin(async move {
                        let _ = tx.send(msg.data.to_vec());
                    })
                }));
                *slots
                    .handshake_io
                    .lock()
                    .expect("handshake slot poisoned") = Some(HandshakePipes {
                    channel: dc,
                    inbound_rx,
                });
                slots.handshake_arrived.notify_waiters();
                return;
            }

            let open_slots = slots.clone();
            dc.on_open(Box::new(move || {
                let slots = open_slots.clone();
                Box::pin(async move {
                    tracing::debug!(target = "webrtc", "data channel opened");
                    slots.main_open.store(true, Ordering::SeqCst);
                    slots.main_open_notify.notify_waiters();
                })
            }));
            let close_slots = slots.clone();
            dc.on_close(Box::new(move || {
                let slots = close_slots.clone();
                Box::pin(async move {
                    if !slots.main_open.load(Ordering::SeqCst) {
                        slots.main_failed.store(true, Ordering::SeqCst);
                        slots.main_open_notify.notify_waiters();
                    }
                })
            }));
            *slots.main.lock().expect("channel slot poisoned") = Some(dc);
            slots.main_arrived.notify_waiters();
        })
    }));
}

async fn run_noise_handshake(
    channels: &Arc<ChannelSlots>,
    handshake_key: [u8; 32],
    handshake_id: String,
    local_peer_id: String,
    remote_peer_id: String,
) -> Result<secure_handshake::HandshakeResult, NegotiationError> {
    let pipes = channels.wait_handshake().await;
    wait_for_channel_open(&pipes.channel).await;

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let dc = pipes.channel.clone();
    let pump = tokio::spawn(async move {
        while let Some(payload) = outbound_rx.recv().await {
            if dc.send(&Bytes::from(payload)).await.is_err() {
                break;
            }
        }
    });

    let io = HandshakeIo {
        outbound: outbound_tx,
        inbound: pipes.inbound_rx,
    };
    let result = run_handshake(
        HandshakeRole::Responder,
        io,
        HandshakeParams {
            handshake_key,
            handshake_id,
            local_peer_id,
            remote_peer_id,
        },
    )
    .await
    .map_err(|err| NegotiationError::NoiseHandshakeFailed(err.to_string()));
    pump.abort();
    result
}

async fn wait_for_channel_open(channel: &Arc<RTCDataChannel>) {
    if channel.ready_state() == RTCDataChannelState::Open {
        return;
    }
    let notify = Arc::new(Notify::new());
    let signal = notify.clone();
    channel.on_open(Box::new(move || {
        let notify = signal.clone();
        Box::pin(async move {
            notify.notify_waiters();
        })
    }));
    if channel.ready_state() == RTCDataChannelState::Open {
        return;
    }
    notify.notified().await;
}

async fn poll_offer(
    http: &reqwest::Client,
    signaling_url: &str,
    local_peer_id: &str,
    poll_interval: Duration,
) -> Result<WebRtcSdpPayload, NegotiationError> {
    let url = format!("{}/offer", signaling_url.trim_end_matches('/'));
    loop {
        let response = http
            .get(&url)
            .query(&[("peer_id", local_peer_id)])
            .send()
            .await
            .map_err(|err| NegotiationError::SdpExchangeFailed(err.to_string()))?;
        match response.status() {
            StatusCode::OK => {
                let payload = response
                    .json::<WebRtcSdpPayload>()
                    .await
                    .map_err(|err| NegotiationError::SdpExchangeFailed(err.to_string()))?;
                return Ok(payload);
            }
            StatusCode::NOT_FOUND => sleep(poll_interval).await,
            status => {
                return Err(NegotiationError::Signaling(SignalingError::Http {
                    status: status.as_u16(),
                }));
            }
        }
    }
}

fn build_answer_payload(
    local_desc: &RTCSessionDescription,
    handshake_id: &str,
    local_peer_id: &str,
    remote_peer_id: &str,
    seal_key: Option<&[u8; 32]>,
) -> Result<WebRtcSdpPayload, NegotiationError> {
    let typ = local_desc.sdp_type.to_string();
    let (sdp, sealed) = match seal_key {
        Some(key) => {
            let associated = [local_peer_id, remote_peer_id, typ.as_str()];
            let envelope = seal_message(
                key,
                MessageLabel::Answer,
                &associated,
                local_desc.sdp.as_bytes(),
            )
            .map_err(|err| NegotiationError::Setup(err.to_string()))?;
            (String::new(), Some(envelope))
        }
        None => (local_desc.sdp.clone(), None),
    };
    Ok(WebRtcSdpPayload {
        sdp,
        typ,
        handshake_id: Some(handshake_id.to_string()),
        from_peer: local_peer_id.to_string(),
        to_peer: remote_peer_id.to_string(),
        sealed,
    })
}

async fn post_answer(
    http: &reqwest::Client,
    signaling_url: &str,
    payload: &WebRtcSdpPayload,
) -> Result<(), NegotiationError> {
    let url = format!("{}/answer", signaling_url.trim_end_matches('/'));
    let response = http
        .post(&url)
        .json(payload)
        .send()
        .await
        .map_err(|err| NegotiationError::SdpExchangeFailed(err.to_string()))?;
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(NegotiationError::Signaling(SignalingError::Http {
            status: status.as_u16(),
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CandidateGate {
    Blocked,
    Delayed,
    Ready,
}

struct IceSenderState {
    gate: CandidateGate,
    pending: Vec<IceCandidateBlob>,
    sent: Vec<IceCandidateBlob>,
}

type SignalRelay = dyn Fn(&str, WebRtcSignal) -> Result<(), SignalingError> + Send + Sync;

/// Staged outbound candidate flow; see the module docs for the gate rules.
struct IceSender {
    relay: Box<SignalRelay>,
    local_peer_id: String,
    remote_peer_id: String,
    handshake_id: String,
    seal_key: Option<[u8; 32]>,
    state: Mutex<IceSenderState>,
}

impl IceSender {
    fn new(
        signaling: Arc<SignalingClient>,
        local_peer_id: String,
        remote_peer_id: String,
        handshake_id: String,
        seal_key: Option<[u8; 32]>,
    ) -> Self {
        Self::with_relay(
            Box::new(move |peer, signal| signaling.send_signal(peer, signal)),
            local_peer_id,
            remote_peer_id,
            handshake_id,
            seal_key,
        )
    }

    fn with_relay(
        relay: Box<SignalRelay>,
        local_peer_id: String,
        remote_peer_id: String,
        handshake_id: String,
        seal_key: Option<[u8; 32]>,
    ) -> Self {
        Self {
            relay,
            local_peer_id,
            remote_peer_id,
            handshake_id,
            seal_key,
            state: Mutex::new(IceSenderState {
                gate: CandidateGate::Blocked,
                pending: Vec::new(),
                sent: Vec::new(),
            }),
        }
    }

    fn seal_key(&self) -> Option<&[u8; 32]> {
        self.seal_key.as_ref()
    }

    fn push(&self, blob: IceCandidateBlob) {
        let mut state = self.state.lock().expect("ice sender state poisoned");
        match state.gate {
            CandidateGate::Ready => {
                self.send_blob(&blob);
                state.sent.push(blob);
            }
            CandidateGate::Blocked | CandidateGate::Delayed => state.pending.push(blob),
        }
    }

    fn mark_delayed(&self) {
        let mut state = self.state.lock().expect("ice sender state poisoned");
        if state.gate == CandidateGate::Blocked {
            state.gate = CandidateGate::Delayed;
        }
    }

    fn make_ready(&self) {
        let drained = {
            let mut state = self.state.lock().expect("ice sender state poisoned");
            state.gate = CandidateGate::Ready;
            std::mem::take(&mut state.pending)
        };
        for blob in &drained {
            self.send_blob(blob);
        }
        let mut state = self.state.lock().expect("ice sender state poisoned");
        state.sent.extend(drained);
    }

    fn resend_all(&self) {
        let sent = {
            let state = self.state.lock().expect("ice sender state poisoned");
            state.sent.clone()
        };
        if sent.is_empty() {
            return;
        }
        tracing::debug!(
            target = "webrtc",
            candidates = sent.len(),
            "replaying local ice candidates"
        );
        for blob in &sent {
            self.send_blob(blob);
        }
    }

    fn send_blob(&self, blob: &IceCandidateBlob) {
        let signal = match self.build_signal(blob) {
            Ok(signal) => signal,
            Err(err) => {
                tracing::warn!(target = "webrtc", error = %err, "sealing ice candidate failed");
                return;
            }
        };
        if let Err(err) = (self.relay)(&self.remote_peer_id, signal) {
            tracing::warn!(target = "webrtc", error = %err, "ice candidate relay failed");
        }
    }

    fn build_signal(&self, blob: &IceCandidateBlob) -> Result<WebRtcSignal, NegotiationError> {
        if let Some(key) = &self.seal_key {
            let plaintext = serde_json::to_vec(blob)
                .map_err(|err| NegotiationError::Setup(err.to_string()))?;
            let associated = [
                self.local_peer_id.as_str(),
                self.remote_peer_id.as_str(),
                self.handshake_id.as_str(),
            ];
            let envelope = seal_message(key, MessageLabel::Ice, &associated, &plaintext)
                .map_err(|err| NegotiationError::Setup(err.to_string()))?;
            Ok(WebRtcSignal::IceCandidate {
                candidate: String::new(),
                sdp_mid: None,
                sdp_mline_index: None,
                handshake_id: self.handshake_id.clone(),
                sealed: Some(envelope),
            })
        } else {
            Ok(WebRtcSignal::IceCandidate {
                candidate: blob.candidate.clone(),
                sdp_mid: blob.sdp_mid.clone(),
                sdp_mline_index: blob.sdp_mline_index,
                handshake_id: self.handshake_id.clone(),
                sealed: None,
            })
        }
    }
}

fn register_local_candidate_handler(pc: &Arc<RTCPeerConnection>, sender: &Arc<IceSender>) {
    let sender = sender.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let sender = sender.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(json) => sender.push(IceCandidateBlob {
                    candidate: json.candidate,
                    sdp_mid: json.sdp_mid,
                    sdp_mline_index: json.sdp_mline_index.map(u32::from),
                }),
                Err(err) => {
                    tracing::warn!(target = "webrtc", error = %err, "candidate serialize error");
                }
            }
        })
    }));
}

fn spawn_candidate_flush(guard: &mut TaskGuard, sender: Arc<IceSender>, config: &ClientConfig) {
    let flush_delay = config.answer_flush_delay;
    let resend_interval = config.resend_interval;
    let attempts = config.max_resend_attempts;
    guard.spawn(async move {
        sleep(flush_delay).await;
        sender.make_ready();
        for _ in 0..attempts {
            sleep(resend_interval).await;
            sender.resend_all();
        }
    });
}

struct RemoteCandidateFilter {
    handshake_id: String,
    local_peer_id: String,
    remote_peer_id: String,
    seal_key: Option<[u8; 32]>,
}

fn spawn_remote_candidate_pump(
    guard: &mut TaskGuard,
    mut events: tokio::sync::broadcast::Receiver<ServerMessage>,
    pc: Arc<RTCPeerConnection>,
    filter: RemoteCandidateFilter,
) {
    guard.spawn(async move {
        loop {
            let message = match events.recv().await {
                Ok(message) => message,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(target = "webrtc", skipped, "ice event stream lagged");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            let ServerMessage::Signal { from_peer, signal } = message else {
                continue;
            };
            if from_peer != filter.remote_peer_id {
                continue;
            }
            let Ok(TransportSignal::WebRtc {
                signal:
                    WebRtcSignal::IceCandidate {
                        candidate,
                        sdp_mid,
                        sdp_mline_index,
                        handshake_id,
                        sealed,
                    },
            }) = TransportSignal::from_value(&signal)
            else {
                continue;
            };
            if handshake_id != filter.handshake_id {
                tracing::debug!(
                    target = "webrtc",
                    got = %handshake_id,
                    want = %filter.handshake_id,
                    "dropping candidate from stale handshake"
                );
                continue;
            }
            let blob = match &filter.seal_key {
                Some(key) => {
                    let Some(envelope) = sealed else {
                        tracing::warn!(
                            target = "webrtc",
                            "dropping unsealed remote candidate in secure mode"
                        );
                        continue;
                    };
                    let associated = [
                        filter.remote_peer_id.as_str(),
                        filter.local_peer_id.as_str(),
                        filter.handshake_id.as_str(),
                    ];
                    match open_message(key, MessageLabel::Ice, &associated, &envelope)
                        .map_err(|err| err.to_string())
                        .and_then(|plain| {
                            serde_json::from_slice::<IceCandidateBlob>(&plain)
                                .map_err(|err| err.to_string())
                        }) {
                        Ok(blob) => blob,
                        Err(err) => {
                            tracing::warn!(
                                target = "webrtc",
                                error = %err,
                                "dropping undecryptable remote candidate"
                            );
                            continue;
                        }
                    }
                }
                None => IceCandidateBlob {
                    candidate,
                    sdp_mid,
                    sdp_mline_index,
                },
            };
            let init = RTCIceCandidateInit {
                candidate: blob.candidate,
                sdp_mid: blob.sdp_mid,
                sdp_mline_index: blob.sdp_mline_index.map(|idx| idx as u16),
                username_fragment: None,
            };
            if let Err(err) = pc.add_ice_candidate(init).await {
                tracing::warn!(target = "webrtc", error = %err, "add ice candidate failed");
            }
        }
    });
}

#[derive(Default)]
struct TaskGuard {
    handles: Vec<tokio::task::JoinHandle<()>>,
}

impl TaskGuard {
    fn spawn<F>(&mut self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.handles.push(tokio::spawn(future));
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        for handle in self.handles.drain(..) {
            handle.abort();
        }
    }
}

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// The negotiated data channel as a [`Transport`]. Envelopes are sealed by
/// the secure layer before they reach the channel and opened on receipt.
pub struct WebRtcTransport {
    id: TransportId,
    outbound_seq: AtomicU64,
    outbound_tx: mpsc::UnboundedSender<Vec<u8>>,
    inbound_rx: Mutex<crossbeam_channel::Receiver<Result<TransportMessage, TransportError>>>,
    buffered: Arc<AtomicU64>,
    open_notify: Arc<Notify>,
    secure: bool,
    _pc: Arc<RTCPeerConnection>,
    _dc: Arc<RTCDataChannel>,
}

impl WebRtcTransport {
    fn new(pc: Arc<RTCPeerConnection>, dc: Arc<RTCDataChannel>, secure: Arc<SecureLayer>) -> Self {
        let id = next_transport_id();
        let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
        let secure_recv = secure.clone();
        let dc_for_errors = dc.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = inbound_tx.clone();
            let secure = secure_recv.clone();
            let dc = dc_for_errors.clone();
            Box::pin(async move {
                let outcome = secure
                    .open(&msg.data)
                    .map_err(TransportError::from)
                    .and_then(|plain| decode_message(&plain).map_err(TransportError::from));
                match outcome {
                    Ok(message) => {
                        let _ = tx.send(Ok(message));
                    }
                    Err(err) => {
                        tracing::warn!(
                            target = "webrtc",
                            error = %err,
                            "inbound frame rejected; closing channel"
                        );
                        let _ = tx.send(Err(err));
                        // Closing inline would wedge the channel's own read
                        // loop, so it happens off to the side.
                        tokio::spawn(async move {
                            let _ = dc.close().await;
                        });
                    }
                }
            })
        }));

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let buffered = Arc::new(AtomicU64::new(0));
        let open_notify = Arc::new(Notify::new());
        let sender_dc = dc.clone();
        let sender_secure = secure.clone();
        let sender_buffered = buffered.clone();
        let sender_open = open_notify.clone();
        tokio::spawn(async move {
            if sender_dc.ready_state() != RTCDataChannelState::Open {
                sender_open.notified().await;
            }
            while let Some(plain) = outbound_rx.recv().await {
                let len = plain.len() as u64;
                let framed = match sender_secure.seal(&plain) {
                    Ok(framed) => framed,
                    Err(err) => {
                        tracing::warn!(target = "webrtc", error = %err, "seal failed; stopping");
                        break;
                    }
                };
                match timeout(SEND_TIMEOUT, sender_dc.send(&Bytes::from(framed))).await {
                    Ok(Ok(_)) => {
                        sender_buffered.fetch_sub(len, Ordering::Relaxed);
                    }
                    Ok(Err(err)) => {
                        tracing::warn!(target = "webrtc", error = %err, "data channel send error");
                        break;
                    }
                    Err(_) => {
                        tracing::warn!(target = "webrtc", "data channel send timed out");
                        break;
                    }
                }
            }
        });

        Self {
            id,
            outbound_seq: AtomicU64::new(0),
            outbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            buffered,
            open_notify,
            secure: !secure.is_plaintext(),
            _pc: pc,
            _dc: dc,
        }
    }

    fn mark_open(&self) {
        self.open_notify.notify_waiters();
        self.open_notify.notify_one();
    }

    fn is_secure(&self) -> bool {
        self.secure
    }
}

impl Transport for WebRtcTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebRtc
    }

    fn id(&self) -> TransportId {
        self.id
    }

    fn send(&self, message: TransportMessage) -> Result<(), TransportError> {
        let bytes = encode_message(&message);
        self.buffered.fetch_add(bytes.len() as u64, Ordering::Relaxed);
        self.outbound_tx
            .send(bytes)
            .map_err(|_| TransportError::ChannelClosed)
    }

    fn recv(&self, timeout: Duration) -> Result<TransportMessage, TransportError> {
        let receiver = self.inbound_rx.lock().expect("webrtc inbound poisoned");
        match receiver.recv_timeout(timeout) {
            Ok(result) => result,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Err(TransportError::Timeout),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => {
                Err(TransportError::ChannelClosed)
            }
        }
    }

    fn try_recv(&self) -> Result<Option<TransportMessage>, TransportError> {
        let receiver = self.inbound_rx.lock().expect("webrtc inbound poisoned");
        match receiver.try_recv() {
            Ok(result) => result.map(Some),
            Err(crossbeam_channel::TryRecvError::Empty) => Ok(None),
            Err(crossbeam_channel::TryRecvError::Disconnected) => {
                Err(TransportError::ChannelClosed)
            }
        }
    }

    fn buffered_amount(&self) -> u64 {
        self.buffered.load(Ordering::Relaxed)
    }

    fn send_text(&self, text: &str) -> Result<u64, TransportError> {
        let sequence = self.outbound_seq.fetch_add(1, Ordering::Relaxed);
        self.send(TransportMessage::text(sequence, text))?;
        Ok(sequence)
    }

    fn send_bytes(&self, bytes: &[u8]) -> Result<u64, TransportError> {
        let sequence = self.outbound_seq.fetch_add(1, Ordering::Relaxed);
        self.send(TransportMessage::binary(sequence, bytes.to_vec()))?;
        Ok(sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collecting_sender(
        seal_key: Option<[u8; 32]>,
    ) -> (IceSender, crossbeam_channel::Receiver<WebRtcSignal>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let sender = IceSender::with_relay(
            Box::new(move |_, signal| {
                tx.send(signal).expect("collect signal");
                Ok(())
            }),
            "local".into(),
            "remote".into(),
            "hs-1".into(),
            seal_key,
        );
        (sender, rx)
    }

    fn blob(idx: usize) -> IceCandidateBlob {
        IceCandidateBlob {
            candidate: format!("candidate:{idx}"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    #[test]
    fn candidates_stay_queued_until_flush_then_emit_in_order() {
        let (sender, rx) = collecting_sender(None);
        // Produced before the answer is posted: nothing may go out.
        sender.push(blob(0));
        sender.push(blob(1));
        sender.mark_delayed();
        sender.push(blob(2));
        assert!(rx.try_recv().is_err());

        // The flush delay elapses: everything emits in arrival order.
        sender.make_ready();
        for expected in 0..3 {
            let WebRtcSignal::IceCandidate { candidate, .. } = rx.try_recv().expect("signal")
            else {
                panic!("unexpected signal variant");
            };
            assert_eq!(candidate, format!("candidate:{expected}"));
        }

        // Once ready, new candidates send immediately.
        sender.push(blob(3));
        let WebRtcSignal::IceCandidate { candidate, .. } = rx.try_recv().expect("signal") else {
            panic!("unexpected signal variant");
        };
        assert_eq!(candidate, "candidate:3");
    }

    #[test]
    fn resend_replays_every_generated_candidate() {
        let (sender, rx) = collecting_sender(None);
        sender.push(blob(0));
        sender.mark_delayed();
        sender.make_ready();
        sender.push(blob(1));
        let _ = rx.try_recv().expect("first");
        let _ = rx.try_recv().expect("second");

        sender.resend_all();
        let mut replayed = Vec::new();
        while let Ok(WebRtcSignal::IceCandidate { candidate, .. }) = rx.try_recv() {
            replayed.push(candidate);
        }
        assert_eq!(replayed, vec!["candidate:0", "candidate:1"]);
    }

    #[test]
    fn sealed_candidates_clear_plaintext_fields() {
        let (sender, rx) = collecting_sender(Some([9u8; 32]));
        sender.mark_delayed();
        sender.make_ready();
        sender.push(blob(0));
        let WebRtcSignal::IceCandidate {
            candidate,
            sdp_mid,
            sdp_mline_index,
            handshake_id,
            sealed,
        } = rx.try_recv().expect("signal")
        else {
            panic!("unexpected signal variant");
        };
        assert!(candidate.is_empty());
        assert!(sdp_mid.is_none());
        assert!(sdp_mline_index.is_none());
        assert_eq!(handshake_id, "hs-1");
        let envelope = sealed.expect("sealed envelope");

        // The receiver opens it with the same handshake key and sender-side
        // AAD ordering.
        let opened = open_message(
            &[9u8; 32],
            MessageLabel::Ice,
            &["local", "remote", "hs-1"],
            &envelope,
        )
        .expect("open");
        let decoded: IceCandidateBlob = serde_json::from_slice(&opened).expect("blob json");
        assert_eq!(decoded, blob(0));
    }

    #[test]
    fn sdp_payload_serializes_with_type_field() {
        let payload = WebRtcSdpPayload {
            sdp: "v=0".into(),
            typ: "answer".into(),
            handshake_id: Some("hs".into()),
            from_peer: "a".into(),
            to_peer: "b".into(),
            sealed: None,
        };
        let value = serde_json::to_value(&payload).expect("serialize");
        assert_eq!(value["type"], "answer");
        assert_eq!(value["handshake_id"], "hs");
        assert!(value.get("sealed").is_none());
    }
}
